//! Sequence specification lines: `name = single ; axisSpec`.
//!
//! `axisSpec` is one of
//!
//! - `[v1, v2, ...]` explicit list
//! - `a:b/n` `n` samples from `a` to `b` inclusive (`l` option: log spacing)
//! - `a:b:step` stepped range from `a` up to, not including, `b`
//!
//! Options follow a trailing `:`. `r` shuffles the values once, with a
//! seeded generator so the order can be reproduced.

use crate::error::{AppResult, DaqError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const MAX_POINTS: usize = 1_000_000;

/// One parsed sequence line.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSpec {
    /// Parameter name
    pub name: String,
    /// Value used when the parameter is not swept
    pub single: Option<f64>,
    /// Sweep values; empty when no axis was given
    pub values: Vec<f64>,
    /// Seed used to shuffle `values`, if they were shuffled
    pub shuffle_seed: Option<u64>,
}

/// Parse one `name = single ; axisSpec` line.
///
/// `seed` is only used when the axis carries the `r` option.
pub fn parse_sequence_line(line: &str, seed: u64) -> AppResult<SequenceSpec> {
    let (name, rest) = line
        .split_once('=')
        .ok_or_else(|| DaqError::Parse(format!("expected 'name = ...' in '{}'", line)))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(DaqError::Parse(format!("missing parameter name in '{}'", line)));
    }
    let (single, axis) = match rest.split_once(';') {
        Some((single, axis)) => (single.trim(), axis.trim()),
        None => (rest.trim(), ""),
    };
    let single = if single.is_empty() {
        None
    } else {
        Some(number(single)?)
    };
    let (values, shuffle_seed) = if axis.is_empty() {
        (Vec::new(), None)
    } else {
        parse_axis(axis, seed)?
    };
    Ok(SequenceSpec {
        name: name.to_string(),
        single,
        values,
        shuffle_seed,
    })
}

/// Parse a block of sequence lines; blank lines and `#` comments are skipped.
pub fn parse_sequence_block(text: &str, seed: u64) -> AppResult<Vec<SequenceSpec>> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .enumerate()
        .map(|(i, l)| parse_sequence_line(l, seed.wrapping_add(i as u64)))
        .collect()
}

/// Expand an axis spec. Returns the values and the shuffle seed, if used.
pub fn parse_axis(spec: &str, seed: u64) -> AppResult<(Vec<f64>, Option<u64>)> {
    let spec = spec.trim();
    let (mut values, opts) = if let Some(body) = spec.strip_prefix('[') {
        let (list, tail) = body
            .split_once(']')
            .ok_or_else(|| DaqError::Parse(format!("unterminated list in '{}'", spec)))?;
        let opts = match tail.trim() {
            "" => "",
            t => t
                .strip_prefix(':')
                .ok_or_else(|| DaqError::Parse(format!("unexpected '{}' after list", t)))?,
        };
        let values = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(number)
            .collect::<AppResult<Vec<f64>>>()?;
        check_opts(opts, false)?;
        (values, opts)
    } else {
        let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(DaqError::Parse(format!("cannot parse axis '{}'", spec)));
        }
        let start = number(parts[0])?;
        if let Some((stop, count)) = parts[1].split_once('/') {
            if parts.len() > 3 {
                return Err(DaqError::Parse(format!("too many fields in '{}'", spec)));
            }
            let stop = number(stop)?;
            let count = count
                .trim()
                .parse::<usize>()
                .map_err(|_| DaqError::Parse(format!("bad sample count in '{}'", spec)))?;
            if count > MAX_POINTS {
                return Err(DaqError::Parse(format!("axis '{}' is too long", spec)));
            }
            let opts = parts.get(2).copied().unwrap_or("");
            check_opts(opts, true)?;
            let values = if opts.contains('l') {
                logspace(start, stop, count)?
            } else {
                linspace(start, stop, count)
            };
            (values, opts)
        } else {
            if parts.len() < 3 || parts.len() > 4 {
                return Err(DaqError::Parse(format!("expected a:b:step in '{}'", spec)));
            }
            let stop = number(parts[1])?;
            let step = number(parts[2])?;
            let opts = parts.get(3).copied().unwrap_or("");
            check_opts(opts, false)?;
            (arange(start, stop, step)?, opts)
        }
    };

    if values.len() > MAX_POINTS {
        return Err(DaqError::Parse(format!("axis '{}' is too long", spec)));
    }
    if opts.contains('r') {
        let mut rng = StdRng::seed_from_u64(seed);
        values.shuffle(&mut rng);
        Ok((values, Some(seed)))
    } else {
        Ok((values, None))
    }
}

fn number(text: &str) -> AppResult<f64> {
    let text = text.trim();
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DaqError::Parse(format!("bad number '{}'", text)))
}

fn check_opts(opts: &str, allow_log: bool) -> AppResult<()> {
    for c in opts.chars() {
        match c {
            'r' => {}
            'l' if allow_log => {}
            other => return Err(DaqError::Parse(format!("unknown axis option '{}'", other))),
        }
    }
    Ok(())
}

fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + span * i as f64).collect()
        }
    }
}

fn logspace(start: f64, stop: f64, count: usize) -> AppResult<Vec<f64>> {
    if start <= 0.0 || stop <= 0.0 {
        return Err(DaqError::Parse(
            "log spacing needs positive endpoints".to_string(),
        ));
    }
    Ok(linspace(start.ln(), stop.ln(), count)
        .into_iter()
        .map(f64::exp)
        .collect())
}

fn arange(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if step == 0.0 {
        return Err(DaqError::Parse("step must be non-zero".to_string()));
    }
    let count = ((stop - start) / step - 1e-9).ceil();
    if count <= 0.0 {
        return Ok(Vec::new());
    }
    if count > MAX_POINTS as f64 {
        return Err(DaqError::Parse("stepped range is too long".to_string()));
    }
    Ok((0..count as usize).map(|i| start + step * i as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_list() {
        let spec = parse_sequence_line("amp = 0.5 ; [0.5, 1.0]", 0).unwrap();
        assert_eq!(spec.name, "amp");
        assert_eq!(spec.single, Some(0.5));
        assert_eq!(spec.values, vec![0.5, 1.0]);
        assert_eq!(spec.shuffle_seed, None);
    }

    #[test]
    fn single_value_only() {
        let spec = parse_sequence_line("holding = -0.07", 0).unwrap();
        assert_eq!(spec.single, Some(-0.07));
        assert!(spec.values.is_empty());
    }

    #[test]
    fn linear_and_log_counts() {
        let (v, _) = parse_axis("0:1/5", 0).unwrap();
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let (v, _) = parse_axis("1:100/3:l", 0).unwrap();
        assert!((v[1] - 10.0).abs() < 1e-9);
        assert!(parse_axis("0:100/3:l", 0).is_err());
    }

    #[test]
    fn huge_counts_are_rejected_before_expansion() {
        for spec in ["0:1/18446744073709551615", "0:1/50000000", "1:10/50000000:l"] {
            assert!(matches!(parse_axis(spec, 0), Err(DaqError::Parse(_))), "{spec}");
        }
        let (v, _) = parse_axis(&format!("0:1/{}", MAX_POINTS), 0).unwrap();
        assert_eq!(v.len(), MAX_POINTS);
    }

    #[test]
    fn stepped_range_excludes_stop() {
        let (v, _) = parse_axis("0:1:0.25", 0).unwrap();
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75]);
        let (v, _) = parse_axis("10:0:-5", 0).unwrap();
        assert_eq!(v, vec![10.0, 5.0]);
        assert!(parse_axis("0:1:0", 0).is_err());
    }

    #[test]
    fn shuffle_is_reproducible() {
        let (a, seed) = parse_axis("0:10:1:r", 42).unwrap();
        let (b, _) = parse_axis("0:10:1:r", 42).unwrap();
        assert_eq!(seed, Some(42));
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, (0..10).map(f64::from).collect::<Vec<_>>());

        let (listed, _) = parse_axis("[1, 2, 3, 4]:r", 7).unwrap();
        assert_eq!(listed.len(), 4);
    }

    #[test]
    fn bad_lines() {
        assert!(parse_sequence_line("no equals sign", 0).is_err());
        assert!(parse_sequence_line(" = 1", 0).is_err());
        assert!(parse_axis("[1, 2", 0).is_err());
        assert!(parse_axis("0:1/3:x", 0).is_err());
    }

    #[test]
    fn block_skips_comments() {
        let specs = parse_sequence_block("# sweep\namp = 1 ; [1,2]\n\nfreq = 10\n", 3).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].name, "freq");
    }
}
