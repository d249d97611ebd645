//! Parameter sweeps.
//!
//! A sweep is an ordered list of [`SequenceParam`]s, each naming a device
//! parameter and the values it takes. Params sharing a link label iterate in
//! lock-step as one axis whose length is the shortest member's; the merged
//! axis sits where its first member was declared. [`SequenceGrid`] freezes
//! the axes and enumerates the points in row-major order.

use crate::error::{AppResult, DaqError};
use crate::protocol::PROTOCOL_KEY;
use crate::stimulus::{parse_sequence_line, SequenceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `(device, parameter)` pair addressed by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamKey {
    /// Device name (`protocol` for the repetition axis)
    pub device: String,
    /// Parameter name
    pub param: String,
}

impl ParamKey {
    /// Key for `device.param`.
    pub fn new(device: &str, param: &str) -> Self {
        Self {
            device: device.to_string(),
            param: param.to_string(),
        }
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.device, self.param)
    }
}

/// One swept parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceParam {
    /// Addressed parameter
    pub key: ParamKey,
    /// Value used when the parameter is not swept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single: Option<f64>,
    /// Sweep values
    pub values: Vec<f64>,
    /// Link group label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Seed the values were shuffled with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
}

impl SequenceParam {
    /// Sweep `device.param` over `values`.
    pub fn new(device: &str, param: &str, values: Vec<f64>) -> Self {
        Self {
            key: ParamKey::new(device, param),
            single: None,
            values,
            link: None,
            shuffle_seed: None,
        }
    }

    /// Put this param into link group `label`.
    pub fn with_link(mut self, label: &str) -> Self {
        self.link = Some(label.to_string());
        self
    }

    /// Param for `device` from a parsed sequence line.
    pub fn from_spec(device: &str, spec: SequenceSpec) -> Self {
        Self {
            key: ParamKey::new(device, &spec.name),
            single: spec.single,
            values: spec.values,
            link: None,
            shuffle_seed: spec.shuffle_seed,
        }
    }

    /// Parse `device.param = single ; axisSpec`.
    pub fn parse(text: &str, seed: u64) -> AppResult<Self> {
        let (target, _) = text
            .split_once('=')
            .ok_or_else(|| DaqError::Parse(format!("expected 'device.param = ...' in '{}'", text)))?;
        let (device, _) = target.trim().split_once('.').ok_or_else(|| {
            DaqError::Parse(format!("parameter '{}' must be written device.param", target.trim()))
        })?;
        let rest = text
            .trim_start()
            .strip_prefix(device)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or_else(|| DaqError::Parse(format!("cannot parse '{}'", text)))?;
        Ok(Self::from_spec(device.trim(), parse_sequence_line(rest, seed)?))
    }

    /// True when the param contributes an axis.
    pub fn is_swept(&self) -> bool {
        !self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Axis {
    members: Vec<usize>,
    len: usize,
}

/// Frozen N-dimensional grid of sweep points.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceGrid {
    params: Vec<SequenceParam>,
    axes: Vec<Axis>,
}

impl SequenceGrid {
    /// Build the grid. `repetitions > 0` appends a `protocol.repetitions`
    /// axis counting `0..repetitions`.
    pub fn new(mut params: Vec<SequenceParam>, repetitions: u32) -> AppResult<Self> {
        for (i, p) in params.iter().enumerate() {
            if params[..i].iter().any(|q| q.key == p.key) {
                return Err(DaqError::Configuration(format!(
                    "parameter {} is swept twice",
                    p.key
                )));
            }
        }
        if repetitions > 0 {
            params.push(SequenceParam::new(
                PROTOCOL_KEY,
                "repetitions",
                (0..repetitions).map(f64::from).collect(),
            ));
        }

        let mut axes: Vec<Axis> = Vec::new();
        let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, p) in params.iter().enumerate().filter(|(_, p)| p.is_swept()) {
            match p.link.as_deref().and_then(|l| groups.get(l).copied()) {
                Some(axis) => {
                    axes[axis].members.push(i);
                    axes[axis].len = axes[axis].len.min(p.values.len());
                }
                None => {
                    if let Some(label) = p.link.as_deref() {
                        groups.insert(label, axes.len());
                    }
                    axes.push(Axis {
                        members: vec![i],
                        len: p.values.len(),
                    });
                }
            }
        }
        Ok(Self { params, axes })
    }

    /// Swept and fixed params, including the repetition axis.
    pub fn params(&self) -> &[SequenceParam] {
        &self.params
    }

    /// Length of every axis.
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.len).collect()
    }

    /// Number of points; one when nothing is swept.
    pub fn len(&self) -> usize {
        self.axes.iter().map(|a| a.len).product()
    }

    /// True when some axis has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All coordinate vectors in row-major order (last axis fastest).
    pub fn points(&self) -> Vec<Vec<usize>> {
        let shape = self.shape();
        let total = self.len();
        let mut points = Vec::with_capacity(total);
        let mut coords = vec![0; shape.len()];
        for _ in 0..total {
            points.push(coords.clone());
            for axis in (0..shape.len()).rev() {
                coords[axis] += 1;
                if coords[axis] < shape[axis] {
                    break;
                }
                coords[axis] = 0;
            }
        }
        points
    }

    /// Parameter values at `coords`, in declaration order. Params that are
    /// not swept contribute their single value, if any.
    pub fn values_at(&self, coords: &[usize]) -> AppResult<Vec<(ParamKey, f64)>> {
        if coords.len() != self.axes.len() {
            return Err(DaqError::InvalidState(format!(
                "grid has {} axes, got {} coordinates",
                self.axes.len(),
                coords.len()
            )));
        }
        let mut index_of = vec![None; self.params.len()];
        for (axis, &c) in self.axes.iter().zip(coords) {
            if c >= axis.len {
                return Err(DaqError::InvalidState(format!(
                    "coordinate {} out of range for axis of length {}",
                    c, axis.len
                )));
            }
            for &m in &axis.members {
                index_of[m] = Some(c);
            }
        }
        Ok(self
            .params
            .iter()
            .zip(index_of)
            .filter_map(|(p, idx)| match idx {
                Some(i) => Some((p.key.clone(), p.values[i])),
                None => p.single.map(|v| (p.key.clone(), v)),
            })
            .collect())
    }

    /// Child directory name for a point: zero-padded indices joined by `_`.
    pub fn dir_name(coords: &[usize]) -> String {
        if coords.is_empty() {
            return "000".to_string();
        }
        coords
            .iter()
            .map(|c| format!("{:03}", c))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Record of the sweep for the parent directory's attributes.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.params
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "device": p.key.device,
                        "param": p.key.param,
                        "values": p.values,
                        "link": p.link,
                    })
                })
                .collect(),
        )
    }

    /// Shuffle seeds by parameter, for reproducing shuffled orders.
    pub fn shuffle_seeds(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params
            .iter()
            .filter_map(|p| p.shuffle_seed.map(|s| (p.key.to_string(), serde_json::Value::from(s))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_enumeration() {
        let grid = SequenceGrid::new(
            vec![
                SequenceParam::new("devA", "amp", vec![0.5, 1.0]),
                SequenceParam::new("devA", "freq", vec![10.0, 20.0, 40.0]),
            ],
            0,
        )
        .unwrap();
        assert_eq!(grid.shape(), vec![2, 3]);
        let names: Vec<String> = grid.points().iter().map(|p| SequenceGrid::dir_name(p)).collect();
        assert_eq!(
            names,
            vec!["000_000", "000_001", "000_002", "001_000", "001_001", "001_002"]
        );
        let values = grid.values_at(&[1, 2]).unwrap();
        assert_eq!(
            values,
            vec![
                (ParamKey::new("devA", "amp"), 1.0),
                (ParamKey::new("devA", "freq"), 40.0)
            ]
        );
    }

    #[test]
    fn linked_axes_take_shortest_length() {
        let grid = SequenceGrid::new(
            vec![
                SequenceParam::new("devA", "x", vec![1.0, 2.0, 3.0]).with_link("g"),
                SequenceParam::new("devB", "y", vec![0.0; 4]),
                SequenceParam::new("devA", "z", vec![5.0, 6.0, 7.0, 8.0, 9.0]).with_link("g"),
            ],
            0,
        )
        .unwrap();
        assert_eq!(grid.shape(), vec![3, 4]);
        assert_eq!(grid.len(), 12);
        let values = grid.values_at(&[2, 0]).unwrap();
        assert_eq!(values[0], (ParamKey::new("devA", "x"), 3.0));
        assert_eq!(values[2], (ParamKey::new("devA", "z"), 7.0));
        assert!(grid.values_at(&[3, 0]).is_err());
    }

    #[test]
    fn repetitions_add_trailing_axis() {
        let grid = SequenceGrid::new(vec![SequenceParam::new("devA", "amp", vec![1.0, 2.0])], 3).unwrap();
        assert_eq!(grid.shape(), vec![2, 3]);
        assert_eq!(
            grid.values_at(&[0, 2]).unwrap()[1],
            (ParamKey::new(PROTOCOL_KEY, "repetitions"), 2.0)
        );
    }

    #[test]
    fn unswept_params_use_single_value() {
        let mut fixed = SequenceParam::new("devA", "hold", vec![]);
        fixed.single = Some(-0.07);
        let grid = SequenceGrid::new(vec![fixed], 0).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.points(), vec![Vec::<usize>::new()]);
        assert_eq!(grid.values_at(&[]).unwrap()[0].1, -0.07);
    }

    #[test]
    fn parse_device_param_line() {
        let p = SequenceParam::parse("devA.amp = 0.5 ; [0.5, 1.0]", 0).unwrap();
        assert_eq!(p.key, ParamKey::new("devA", "amp"));
        assert_eq!(p.values, vec![0.5, 1.0]);
        assert!(SequenceParam::parse("amp = 1", 0).is_err());
    }

    #[test]
    fn duplicate_params_rejected() {
        let err = SequenceGrid::new(
            vec![
                SequenceParam::new("devA", "amp", vec![1.0]),
                SequenceParam::new("devA", "amp", vec![2.0]),
            ],
            0,
        );
        assert!(err.is_err());
    }
}
