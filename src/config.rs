//! Manager configuration using Figment
//!
//! Configuration is read once at Manager start from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `NEURODAQ_`
//!
//! # Example
//! ```no_run
//! use neurodaq::config::ManagerConfig;
//!
//! let config = ManagerConfig::load_from("rig.toml")?;
//! println!("Storing under {}", config.storage_dir.display());
//! # Ok::<(), neurodaq::error::DaqError>(())
//! ```
//!
//! A minimal rig file:
//!
//! ```toml
//! storage_dir = "/data/rig1"
//! protocol_dir = "/data/rig1/protocols"
//!
//! [devices.Clamp1]
//! driver = "MockWaveform"
//! config = { rate = 10000.0, channel = "ao0" }
//!
//! [modules.Runner]
//! module = "TaskRunner"
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment prefix for overrides, e.g. `NEURODAQ_LOG_LEVEL=debug`.
pub const ENV_PREFIX: &str = "NEURODAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    /// Root of the experiment data tree
    #[serde(default = "default_storage_dir", alias = "storageDir")]
    pub storage_dir: PathBuf,
    /// Directory holding protocol descriptor files
    #[serde(default = "default_protocol_dir", alias = "protocolDir")]
    pub protocol_dir: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Device definitions, keyed by device name
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceDefinition>,
    /// Module definitions, keyed by module name
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDefinition>,
    /// Keys not recognized above, kept for module-specific use
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One device entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDefinition {
    /// Driver type registered with the Manager (e.g. "MockWaveform")
    pub driver: String,
    /// Driver-specific configuration (dynamic)
    #[serde(default)]
    pub config: Value,
}

/// One module entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDefinition {
    /// Module type registered with the Manager (e.g. "TaskRunner")
    pub module: String,
    /// Module-specific configuration (dynamic)
    #[serde(default)]
    pub config: Value,
}

// Default value functions
fn default_storage_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_protocol_dir() -> PathBuf {
    PathBuf::from("protocols")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            protocol_dir: default_protocol_dir(),
            log_level: default_log_level(),
            devices: BTreeMap::new(),
            modules: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(DaqError::from)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> AppResult<Self> {
        Figment::new()
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(DaqError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate configuration after loading.
    ///
    /// `known_drivers` and `known_modules` are the factory type names the
    /// Manager has registered.
    pub fn validate(&self, known_drivers: &[&str], known_modules: &[&str]) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, device) in &self.devices {
            if name.trim().is_empty() {
                return Err(DaqError::Configuration("Empty device name".to_string()));
            }
            if !known_drivers.contains(&device.driver.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Device '{}' uses unknown driver '{}'. Registered: {}",
                    name,
                    device.driver,
                    known_drivers.join(", ")
                )));
            }
        }

        for (name, module) in &self.modules {
            if !known_modules.contains(&module.module.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Module '{}' uses unknown type '{}'",
                    name, module.module
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const RIG: &str = r#"
storageDir = "/data/rig1"
protocol_dir = "/data/protocols"
log_level = "debug"
operator = "lab-3"

[devices.Clamp1]
driver = "MockWaveform"
config = { rate = 20000.0, channel = "ao0" }

[devices.Camera]
driver = "MockCamera"

[modules.Runner]
module = "TaskRunner"
"#;

    fn rig_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(RIG.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = rig_file();
        let config = ManagerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/data/rig1"));
        assert_eq!(config.protocol_dir, PathBuf::from("/data/protocols"));
        assert_eq!(config.devices["Clamp1"].driver, "MockWaveform");
        assert_eq!(config.devices["Clamp1"].config["rate"], serde_json::json!(20000.0));
        assert_eq!(config.devices["Camera"].config, Value::Null);
        assert_eq!(config.modules["Runner"].module, "TaskRunner");
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let file = rig_file();
        let config = ManagerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.extra.get("operator"), Some(&Value::from("lab-3")));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ManagerConfig::load_from("/nonexistent/rig.toml").unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let file = rig_file();
        let config = ManagerConfig::load_from(file.path()).unwrap();
        assert!(config
            .validate(&["MockWaveform", "MockCamera"], &["TaskRunner"])
            .is_ok());
        assert!(matches!(
            config.validate(&["MockWaveform"], &["TaskRunner"]),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = ManagerConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate(&[], &[]).is_err());
    }
}
