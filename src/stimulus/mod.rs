//! Stimulus generation.
//!
//! A [`Stimulus`] is a parsed waveform expression such as
//! `pulse(0.002, 0.001, amp) + sine(10, 0.1)`. Rendering it for a duration,
//! sample rate and set of parameter values gives a buffer of
//! `round(duration * rate)` samples. Intermediates are 64-bit floats; the
//! final buffer is cast to the channel dtype with [`cast`]. The same
//! expression, timing and parameter values always give bit-identical
//! samples.
//!
//! Functions: `pulse(start, width, amplitude)`, `sine(freq, amp, phase=0)`,
//! `ramp(start, width, amplitude)`, `steps(start, width, a1, a2, ...)`,
//! `sum(w1, w2, ...)`, plus scalar arithmetic.

pub mod expr;
pub mod sequence;

pub use self::expr::Expr;
pub use self::sequence::{parse_axis, parse_sequence_block, parse_sequence_line, SequenceSpec};

use crate::data::{ArrayData, Dtype};
use crate::error::{AppResult, DaqError};
use std::collections::{BTreeMap, BTreeSet};

/// Parsed waveform expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    text: String,
    expr: Expr,
}

impl Stimulus {
    /// Parse a waveform expression.
    pub fn parse(text: &str) -> AppResult<Self> {
        Ok(Self {
            text: text.to_string(),
            expr: expr::parse(text)?,
        })
    }

    /// Source text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parameter names the expression needs.
    pub fn parameters(&self) -> BTreeSet<String> {
        self.expr.parameters()
    }

    /// Number of samples for `duration` seconds at `rate` Hz.
    pub fn sample_count(duration: f64, rate: f64) -> AppResult<usize> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DaqError::Parse(format!("invalid sample rate {}", rate)));
        }
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(DaqError::Parse(format!("invalid duration {}", duration)));
        }
        Ok((duration * rate).round() as usize)
    }

    /// Render into 64-bit samples.
    pub fn render(
        &self,
        duration: f64,
        rate: f64,
        params: &BTreeMap<String, f64>,
    ) -> AppResult<Vec<f64>> {
        let n = Self::sample_count(duration, rate)?;
        let ctx = expr::Context { n, rate, params };
        match expr::eval(&self.expr, &ctx)? {
            expr::Value::Scalar(v) => Ok(vec![v; n]),
            expr::Value::Wave(w) => Ok(w),
        }
    }
}

/// Parse and render in one step.
pub fn evaluate(
    text: &str,
    duration: f64,
    rate: f64,
    params: &BTreeMap<String, f64>,
) -> AppResult<Vec<f64>> {
    Stimulus::parse(text)?.render(duration, rate, params)
}

/// Cast rendered samples to a channel dtype (integers saturate).
pub fn cast(samples: &[f64], dtype: Dtype) -> ArrayData {
    ArrayData::from_f64(samples, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_params() -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    #[test]
    fn pulse_occupies_its_window() {
        let w = evaluate("pulse(0.002, 0.001, 1.0)", 0.01, 10_000.0, &no_params()).unwrap();
        assert_eq!(w.len(), 100);
        assert!(w[..20].iter().all(|&x| x == 0.0));
        assert!(w[20..30].iter().all(|&x| x == 1.0));
        assert!(w[30..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn named_parameters_are_substituted() {
        let mut params = BTreeMap::new();
        params.insert("amp".to_string(), 0.5);
        let w = evaluate("pulse(0, 0.001, amp) * 2", 0.002, 1000.0, &params).unwrap();
        assert_eq!(w, vec![1.0, 0.0]);
        assert!(matches!(
            evaluate("pulse(0, 1, gain)", 1.0, 10.0, &params),
            Err(DaqError::Parse(_))
        ));
    }

    #[test]
    fn sine_and_sum() {
        let w = evaluate("sum(sine(250, 2), 1)", 0.004, 1000.0, &no_params()).unwrap();
        assert_eq!(w.len(), 4);
        assert!((w[0] - 1.0).abs() < 1e-12);
        assert!((w[1] - 3.0).abs() < 1e-12);
        assert!((w[3] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn ramp_and_steps() {
        let w = evaluate("ramp(0, 0.004, 4)", 0.005, 1000.0, &no_params()).unwrap();
        assert_eq!(w, vec![0.0, 1.0, 2.0, 3.0, 0.0]);
        let w = evaluate("steps(0.001, 0.002, 1, -1)", 0.006, 1000.0, &no_params()).unwrap();
        assert_eq!(w, vec![0.0, 1.0, 1.0, -1.0, -1.0, 0.0]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut params = BTreeMap::new();
        params.insert("f".to_string(), 37.5);
        let s = Stimulus::parse("sine(f, 0.3, 0.1) + pulse(0.01, 0.02, 0.25)").unwrap();
        let a = s.render(0.1, 20_000.0, &params).unwrap();
        let b = s.render(0.1, 20_000.0, &params).unwrap();
        assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn scalar_expression_fills_buffer() {
        assert_eq!(evaluate("-0.07", 0.003, 1000.0, &no_params()).unwrap(), vec![-0.07; 3]);
    }

    #[test]
    fn integer_cast_saturates() {
        let data = cast(&[-1.0e6, 0.4, 1.6, 1.0e6], Dtype::I16);
        assert_eq!(data, ArrayData::I16(vec![i16::MIN, 0, 2, i16::MAX]));
    }

    #[test]
    fn invalid_timing_rejected() {
        assert!(Stimulus::sample_count(1.0, 0.0).is_err());
        assert!(Stimulus::sample_count(-1.0, 10.0).is_err());
    }
}
