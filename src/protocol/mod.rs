//! Protocol descriptors and their execution.
//!
//! A protocol is the mapping `{"protocol": <options>, <device>: <sub-command>, ...}`.
//! [`ProtocolCommand`] is its typed form: global [`ProtocolOptions`] plus the
//! per-device sub-commands in declaration order. The [`runner`] executes a
//! command once, in a loop, or over a parameter [`sequence`].

pub mod runner;
pub mod sequence;

pub use self::runner::{Frame, ProtocolRunner, RunnerEvent, RunnerState};
pub use self::sequence::{ParamKey, SequenceGrid, SequenceParam};

use crate::error::{AppResult, DaqError};
use crate::store::{Attributes, DirHandle};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Key of the global options inside a protocol mapping.
pub const PROTOCOL_KEY: &str = "protocol";

/// Attribute naming the kind of a protocol directory.
pub const DIR_TYPE_KEY: &str = "dirType";

/// Global options of one protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolOptions {
    /// Run length in seconds
    pub duration: f64,
    /// Settling time before the run, in seconds
    pub lead_time: f64,
    /// Repeat until stopped
    #[serde(rename = "loop")]
    pub looping: bool,
    /// Minimum spacing of loop iterations, in seconds
    pub loop_cycle_time: f64,
    /// Minimum spacing of sequence iterations, in seconds
    pub cycle_time: f64,
    /// Start the next loop iteration immediately
    pub continuous: bool,
    /// Extra sequence axis repeating every point this many times
    pub repetitions: u32,
    /// Write results to the data store
    pub store_data: bool,
    /// Base name of the storage directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Bound on the Task poll loop, in seconds (default `duration + 5`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Destination directory, filled in by the runner
    #[serde(skip)]
    pub storage_dir: Option<DirHandle>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            duration: 0.0,
            lead_time: 0.0,
            looping: false,
            loop_cycle_time: 0.0,
            cycle_time: 0.0,
            continuous: false,
            repetitions: 0,
            store_data: false,
            name: None,
            timeout: None,
            storage_dir: None,
        }
    }
}

impl ProtocolOptions {
    /// Upper bound on one Task's poll loop.
    pub fn effective_timeout(&self) -> f64 {
        self.timeout.unwrap_or(self.duration + 5.0)
    }

    /// Spacing of loop iteration start times.
    pub fn loop_period(&self) -> f64 {
        if self.continuous {
            0.0
        } else {
            (self.duration + self.lead_time).max(self.loop_cycle_time)
        }
    }

    /// Storage directory base name.
    pub fn base_name(&self) -> &str {
        self.name.as_deref().unwrap_or("protocol")
    }

    fn validate(&self) -> AppResult<()> {
        let non_negative = [
            ("duration", self.duration),
            ("leadTime", self.lead_time),
            ("loopCycleTime", self.loop_cycle_time),
            ("cycleTime", self.cycle_time),
        ];
        for (key, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(DaqError::Configuration(format!(
                    "protocol option '{}' must be a non-negative number, got {}",
                    key, value
                )));
            }
        }
        if let Some(timeout) = self.timeout {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "protocol option 'timeout' must be positive, got {}",
                    timeout
                )));
            }
        }
        Ok(())
    }
}

/// Typed protocol descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtocolCommand {
    /// Global options
    pub protocol: ProtocolOptions,
    /// Device sub-commands in declaration order
    pub devices: Map<String, Value>,
}

impl ProtocolCommand {
    /// Command with the given options and no devices.
    pub fn new(protocol: ProtocolOptions) -> Self {
        Self {
            protocol,
            devices: Map::new(),
        }
    }

    /// Add a device sub-command.
    pub fn with_device(mut self, name: &str, cmd: Value) -> Self {
        self.devices.insert(name.to_string(), cmd);
        self
    }

    /// Parse and validate a protocol mapping.
    pub fn from_value(value: Value) -> AppResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(DaqError::Configuration(
                "protocol descriptor must be a mapping".to_string(),
            ));
        };
        let protocol = match map.remove(PROTOCOL_KEY) {
            None | Some(Value::Null) => ProtocolOptions::default(),
            Some(opts) => serde_json::from_value(opts)
                .map_err(|e| DaqError::Configuration(format!("protocol options: {}", e)))?,
        };
        let cmd = Self {
            protocol,
            devices: map,
        };
        cmd.validate()?;
        Ok(cmd)
    }

    /// Read a protocol descriptor from a JSON file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| DaqError::Configuration(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value)
    }

    /// Check global options and device names.
    pub fn validate(&self) -> AppResult<()> {
        self.protocol.validate()?;
        for name in self.devices.keys() {
            if name.is_empty() || name == DIR_TYPE_KEY || name.starts_with("__") {
                return Err(DaqError::Configuration(format!(
                    "'{}' cannot be used as a device name",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Names of the participating devices, in declaration order.
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// The descriptor as a mapping, without the storage handle.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            PROTOCOL_KEY.to_string(),
            serde_json::to_value(&self.protocol).unwrap_or(Value::Null),
        );
        for (name, cmd) in &self.devices {
            map.insert(name.clone(), cmd.clone());
        }
        Value::Object(map)
    }

    /// Directory attributes recording this descriptor under `dir_type`.
    pub fn descriptor_info(&self, dir_type: &str) -> Attributes {
        let mut info = Attributes::new();
        info.insert(DIR_TYPE_KEY.to_string(), Value::from(dir_type));
        if let Value::Object(map) = self.to_value() {
            info.extend(map);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_descriptor() {
        let cmd = ProtocolCommand::from_value(json!({
            "protocol": {"duration": 0.5, "storeData": true, "loop": true, "leadTime": 0.1},
            "Clamp1": {"waveform": "pulse(0, 0.1, 1)"},
            "Camera": {"frames": 2},
        }))
        .unwrap();
        assert_eq!(cmd.protocol.duration, 0.5);
        assert!(cmd.protocol.store_data && cmd.protocol.looping);
        assert_eq!(cmd.device_names().collect::<Vec<_>>(), vec!["Clamp1", "Camera"]);
        assert_eq!(cmd.protocol.effective_timeout(), 5.5);
        assert!((cmd.protocol.loop_period() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn descriptor_info_round_trips() {
        let cmd = ProtocolCommand::new(ProtocolOptions {
            duration: 0.01,
            ..ProtocolOptions::default()
        })
        .with_device("devA", json!({"waveform": "1"}));
        let info = cmd.descriptor_info("Protocol");
        assert_eq!(info[DIR_TYPE_KEY], json!("Protocol"));
        assert_eq!(info["protocol"]["duration"], json!(0.01));
        assert!(info["protocol"].get("timeout").is_none());

        let mut back = info.clone();
        back.remove(DIR_TYPE_KEY);
        assert_eq!(ProtocolCommand::from_value(Value::Object(back)).unwrap(), cmd);
    }

    #[test]
    fn rejects_bad_options() {
        assert!(ProtocolCommand::from_value(json!([1, 2])).is_err());
        assert!(ProtocolCommand::from_value(json!({"protocol": {"duration": -1.0}})).is_err());
        assert!(ProtocolCommand::from_value(json!({"protocol": {"timeout": 0.0}})).is_err());
        assert!(ProtocolCommand::from_value(json!({"dirType": {}})).is_err());
    }

    #[test]
    fn loop_period_rules() {
        let opts = ProtocolOptions {
            duration: 1.0,
            lead_time: 0.5,
            loop_cycle_time: 2.0,
            ..ProtocolOptions::default()
        };
        assert_eq!(opts.loop_period(), 2.0);
        let opts = ProtocolOptions {
            continuous: true,
            ..opts
        };
        assert_eq!(opts.loop_period(), 0.0);
    }
}
