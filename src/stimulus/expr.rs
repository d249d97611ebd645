//! Waveform expression language.
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := ('-' | '+') unary | atom
//! atom  := number | name | name '(' [expr (',' expr)*] ')' | '(' expr ')'
//! ```
//!
//! Names that are not followed by `(` are parameters, resolved from the
//! currently selected sequence values at evaluation time.

use crate::error::{AppResult, DaqError};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal
    Num(f64),
    /// Named parameter
    Var(String),
    /// Unary minus
    Neg(Box<Expr>),
    /// Binary arithmetic
    Bin(Box<Expr>, char, Box<Expr>),
    /// Function call
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
    Comma,
}

fn tokenize(text: &str) -> AppResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Op(Op::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(Op::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(Op::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(Op::Div));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| DaqError::Parse(format!("bad number '{}'", literal)))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(DaqError::Parse(format!(
                    "unexpected character '{}' at {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> AppResult<()> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            Some(t) => Err(DaqError::Parse(format!("expected {:?}, found {:?}", expected, t))),
            None => Err(DaqError::Parse(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn expr(&mut self) -> AppResult<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (Op::Add | Op::Sub))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(Box::new(lhs), op_char(op), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> AppResult<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (Op::Mul | Op::Div))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(Box::new(lhs), op_char(op), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> AppResult<Expr> {
        match self.peek() {
            Some(Token::Op(Op::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op(Op::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> AppResult<Expr> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Var(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Expr::Call(name, args));
                }
                loop {
                    args.push(self.expr()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(DaqError::Parse(format!(
                                "expected ',' or ')' in call to {}, found {:?}",
                                name, other
                            )))
                        }
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(t) => Err(DaqError::Parse(format!("unexpected token {:?}", t))),
            None => Err(DaqError::Parse("unexpected end of expression".to_string())),
        }
    }
}

fn op_char(op: Op) -> char {
    match op {
        Op::Add => '+',
        Op::Sub => '-',
        Op::Mul => '*',
        Op::Div => '/',
    }
}

/// Parse an expression.
pub fn parse(text: &str) -> AppResult<Expr> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(DaqError::Parse("empty waveform expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if let Some(t) = parser.peek() {
        return Err(DaqError::Parse(format!("trailing input at {:?}", t)));
    }
    Ok(expr)
}

impl Expr {
    /// Parameter names referenced anywhere in the tree.
    pub fn parameters(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_parameters(&mut out);
        out
    }

    fn collect_parameters(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_parameters(out),
            Expr::Bin(a, _, b) => {
                a.collect_parameters(out);
                b.collect_parameters(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_parameters(out)),
        }
    }
}

/// Intermediate value: a scalar or a full-length buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Scalar(f64),
    Wave(Vec<f64>),
}

impl Value {
    fn into_wave(self, n: usize) -> Vec<f64> {
        match self {
            Value::Scalar(v) => vec![v; n],
            Value::Wave(w) => w,
        }
    }
}

/// Evaluation context: buffer length, sample rate and parameter values.
pub(crate) struct Context<'a> {
    pub n: usize,
    pub rate: f64,
    pub params: &'a BTreeMap<String, f64>,
}

impl Context<'_> {
    fn index(&self, seconds: f64) -> usize {
        let i = (seconds * self.rate).round();
        if i <= 0.0 {
            0
        } else {
            (i as usize).min(self.n)
        }
    }

    fn window(&self, start: f64, width: f64) -> (usize, usize) {
        let s = self.index(start);
        let e = self.index(start + width).max(s);
        (s, e)
    }
}

pub(crate) fn eval(expr: &Expr, ctx: &Context<'_>) -> AppResult<Value> {
    match expr {
        Expr::Num(v) => Ok(Value::Scalar(*v)),
        Expr::Var(name) => ctx
            .params
            .get(name)
            .copied()
            .map(Value::Scalar)
            .ok_or_else(|| DaqError::Parse(format!("unknown parameter '{}'", name))),
        Expr::Neg(inner) => Ok(match eval(inner, ctx)? {
            Value::Scalar(v) => Value::Scalar(-v),
            Value::Wave(w) => Value::Wave(w.into_iter().map(|x| -x).collect()),
        }),
        Expr::Bin(a, op, b) => {
            let f: fn(f64, f64) -> f64 = match op {
                '+' => |x, y| x + y,
                '-' => |x, y| x - y,
                '*' => |x, y| x * y,
                _ => |x, y| x / y,
            };
            Ok(match (eval(a, ctx)?, eval(b, ctx)?) {
                (Value::Scalar(x), Value::Scalar(y)) => Value::Scalar(f(x, y)),
                (Value::Wave(w), Value::Scalar(y)) => {
                    Value::Wave(w.into_iter().map(|x| f(x, y)).collect())
                }
                (Value::Scalar(x), Value::Wave(w)) => {
                    Value::Wave(w.into_iter().map(|y| f(x, y)).collect())
                }
                (Value::Wave(u), Value::Wave(w)) => {
                    Value::Wave(u.into_iter().zip(w).map(|(x, y)| f(x, y)).collect())
                }
            })
        }
        Expr::Call(name, args) => call(name, args, ctx),
    }
}

fn scalar_args(name: &str, args: &[Expr], ctx: &Context<'_>) -> AppResult<Vec<f64>> {
    args.iter()
        .map(|a| match eval(a, ctx)? {
            Value::Scalar(v) => Ok(v),
            Value::Wave(_) => Err(DaqError::Parse(format!(
                "{}() expects scalar arguments",
                name
            ))),
        })
        .collect()
}

fn arity(name: &str, got: usize, min: usize, max: usize) -> AppResult<()> {
    if got < min || got > max {
        return Err(DaqError::Parse(format!(
            "{}() takes {}..={} arguments, got {}",
            name, min, max, got
        )));
    }
    Ok(())
}

fn call(name: &str, args: &[Expr], ctx: &Context<'_>) -> AppResult<Value> {
    let n = ctx.n;
    match name {
        "pulse" => {
            arity(name, args.len(), 3, 3)?;
            let a = scalar_args(name, args, ctx)?;
            let (s, e) = ctx.window(a[0], a[1]);
            let mut w = vec![0.0; n];
            w[s..e].iter_mut().for_each(|x| *x = a[2]);
            Ok(Value::Wave(w))
        }
        "sine" => {
            arity(name, args.len(), 2, 3)?;
            let a = scalar_args(name, args, ctx)?;
            let (freq, amp) = (a[0], a[1]);
            let phase = a.get(2).copied().unwrap_or(0.0);
            let w = (0..n)
                .map(|i| {
                    let t = i as f64 / ctx.rate;
                    amp * (2.0 * std::f64::consts::PI * freq * t + phase).sin()
                })
                .collect();
            Ok(Value::Wave(w))
        }
        "ramp" => {
            arity(name, args.len(), 3, 3)?;
            let a = scalar_args(name, args, ctx)?;
            let (s, e) = ctx.window(a[0], a[1]);
            let mut w = vec![0.0; n];
            let len = (e - s) as f64;
            for (k, x) in w[s..e].iter_mut().enumerate() {
                *x = a[2] * k as f64 / len;
            }
            Ok(Value::Wave(w))
        }
        "steps" => {
            arity(name, args.len(), 3, usize::MAX)?;
            let a = scalar_args(name, args, ctx)?;
            let (start, width) = (a[0], a[1]);
            let mut w = vec![0.0; n];
            for (k, level) in a[2..].iter().enumerate() {
                let (s, e) = ctx.window(start + k as f64 * width, width);
                w[s..e].iter_mut().for_each(|x| *x = *level);
            }
            Ok(Value::Wave(w))
        }
        "sum" => {
            let mut acc = vec![0.0; n];
            for arg in args {
                let w = eval(arg, ctx)?.into_wave(n);
                acc.iter_mut().zip(w).for_each(|(x, y)| *x += y);
            }
            Ok(Value::Wave(acc))
        }
        other => Err(DaqError::Parse(format!("unknown function '{}'", other))),
    }
}
