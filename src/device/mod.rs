//! Device abstraction.
//!
//! A [`Device`] is one logical piece of instrumentation. For every Task it
//! takes part in, it hands out a [`DeviceTask`]: the per-run handle whose
//! lifecycle the Task drives in a fixed order
//!
//! 1. [`reserve`](DeviceTask::reserve)
//! 2. [`configure`](DeviceTask::configure)
//! 3. [`create_channels`](DeviceTask::create_channels)
//! 4. [`start`](DeviceTask::start)
//! 5. [`is_done`](DeviceTask::is_done) (polled)
//! 6. [`get_result`](DeviceTask::get_result)
//! 7. [`store_result`](DeviceTask::store_result)
//! 8. [`stop`](DeviceTask::stop) and [`release`](DeviceTask::release), always
//!
//! Exclusive use is tracked by a [`DeviceLock`] per device. Reserving a
//! device that another owner holds fails fast with [`DaqError::Busy`].
//!
//! Drivers are constructed from configuration by a [`DeviceFactory`]
//! registered under a driver type name.

pub mod mock;

use crate::daq::{DaqTask, Direction};
use crate::data::{DataObject, Dtype};
use crate::error::{AppResult, DaqError};
use crate::store::DirHandle;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-device sub-commands of one protocol, keyed by device name.
pub type PeerCommands = Map<String, Value>;

/// Description of one logical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Input or output
    pub direction: Direction,
    /// Physical units (`V`, `A`, ...)
    pub units: String,
    /// Allowed value range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<(f64, f64)>,
    /// Hardware sample type
    pub dtype: Dtype,
}

/// Identity of whoever holds a device reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(1);

impl ReservationId {
    /// A fresh, process-unique owner id.
    pub fn next() -> Self {
        Self(NEXT_RESERVATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-owner reservation of a device.
///
/// The owner may acquire repeatedly (a module holding a device across
/// several Tasks); each acquire needs a matching release. Clones share the
/// same state, so device tasks carry a clone of their device's lock.
#[derive(Debug, Clone)]
pub struct DeviceLock {
    device: Arc<str>,
    owner: Arc<Mutex<Option<(ReservationId, usize)>>>,
}

impl DeviceLock {
    /// Unreserved lock for `device`.
    pub fn new(device: &str) -> Self {
        Self {
            device: Arc::from(device),
            owner: Arc::new(Mutex::new(None)),
        }
    }

    /// Reserve for `owner`. Re-acquiring by the current owner nests.
    pub fn try_acquire(&self, owner: ReservationId) -> AppResult<()> {
        let mut current = self.owner.lock();
        match current.as_mut() {
            Some((holder, _)) if *holder != owner => Err(DaqError::Busy(self.device.to_string())),
            Some((_, depth)) => {
                *depth += 1;
                Ok(())
            }
            None => {
                *current = Some((owner, 1));
                Ok(())
            }
        }
    }

    /// Undo one acquire by `owner`; returns whether `owner` held the lock.
    pub fn release(&self, owner: ReservationId) -> bool {
        let mut current = self.owner.lock();
        match current.as_mut() {
            Some((holder, depth)) if *holder == owner => {
                *depth -= 1;
                if *depth == 0 {
                    *current = None;
                }
                true
            }
            _ => false,
        }
    }

    /// True while some owner holds the device.
    pub fn is_reserved(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Current owner.
    pub fn owner(&self) -> Option<ReservationId> {
        self.owner.lock().map(|(owner, _)| owner)
    }
}

/// Context handed to [`Device::create_task`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Protocol duration in seconds
    pub duration: f64,
    /// Reservation owner of the creating Task
    pub owner: ReservationId,
}

/// Uniform contract every driver implements.
#[async_trait]
pub trait Device: Send + Sync {
    /// Instance name from the configuration.
    fn name(&self) -> &str;

    /// Driver type name (as registered with its factory).
    fn driver_type(&self) -> &str;

    /// Logical channels this device exposes.
    fn list_channels(&self) -> BTreeMap<String, ChannelInfo>;

    /// Current value of a device parameter.
    fn get_param(&self, name: &str) -> AppResult<Value>;

    /// Change a device parameter. With `auto_restart`, a running acquisition
    /// is restarted to pick up the change.
    async fn set_param(&self, name: &str, value: Value, auto_restart: bool) -> AppResult<()>;

    /// Build the per-run handle for one Task from this device's sub-command.
    fn create_task(&self, cmd: &Value, ctx: &TaskContext) -> AppResult<Box<dyn DeviceTask>>;

    /// Reservation state of this device.
    fn lock(&self) -> &DeviceLock;

    /// Substitute sweep values into this device's sub-command.
    ///
    /// The default writes them into the command's `params` mapping.
    fn apply_sequence_params(&self, cmd: &mut Value, params: &BTreeMap<String, f64>) -> AppResult<()> {
        if params.is_empty() {
            return Ok(());
        }
        if cmd.is_null() {
            *cmd = Value::Object(Map::new());
        }
        let obj = cmd.as_object_mut().ok_or_else(|| {
            DaqError::device(self.name(), "sub-command must be a mapping to accept sequence parameters")
        })?;
        let slot = obj
            .entry("params")
            .or_insert_with(|| Value::Object(Map::new()));
        let slot = slot
            .as_object_mut()
            .ok_or_else(|| DaqError::device(self.name(), "'params' must be a mapping"))?;
        for (name, value) in params {
            slot.insert(name.clone(), Value::from(*value));
        }
        Ok(())
    }

    /// Tear down the driver. Called at most once, by the Manager.
    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Per-run handle for one device in one Task.
#[async_trait]
pub trait DeviceTask: Send + Sync {
    /// Name of the owning device.
    fn device_name(&self) -> &str;

    /// Acquire exclusive ownership. Idempotent.
    async fn reserve(&mut self) -> AppResult<()>;

    /// Inspect the peer sub-commands; may reorder `start_order` to claim a
    /// position for this device.
    async fn configure(&mut self, _peers: &PeerCommands, _start_order: &mut Vec<String>) -> AppResult<()> {
        Ok(())
    }

    /// True when this device emits the hardware start edge.
    fn is_trigger_source(&self) -> bool {
        false
    }

    /// Register waveforms with the DAQ coordinator.
    async fn create_channels(&mut self, _daq: &mut DaqTask) -> AppResult<()> {
        Ok(())
    }

    /// Begin the run. `daq` is finalized.
    async fn start(&mut self, daq: &DaqTask) -> AppResult<()>;

    /// Polled by the Task until every device reports done.
    async fn is_done(&mut self) -> AppResult<bool>;

    /// Device-defined result, if the device produces one.
    async fn get_result(&mut self) -> AppResult<Option<DataObject>>;

    /// Write results directly into `dir`. Returns `false` when the Task
    /// should store [`get_result`](Self::get_result) itself.
    async fn store_result(&mut self, _dir: &DirHandle) -> AppResult<bool> {
        Ok(false)
    }

    /// Stop the run; `abort` skips any orderly wind-down.
    async fn stop(&mut self, abort: bool) -> AppResult<()>;

    /// Give up the reservation. Safe to call when never reserved.
    async fn release(&mut self) -> AppResult<()>;
}

/// Resolves device names for Tasks and Runners.
pub trait DeviceSource: Send + Sync {
    /// Look up a device by name.
    fn get_device(&self, name: &str) -> AppResult<Arc<dyn Device>>;
}

impl DeviceSource for BTreeMap<String, Arc<dyn Device>> {
    fn get_device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| DaqError::device(name, "no such device"))
    }
}

/// Builds devices of one driver type from configuration.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Driver type name used in the `driver` field of the configuration.
    fn driver_type(&self) -> &'static str;

    /// Check a configuration without instantiating.
    fn validate(&self, _config: &Value) -> AppResult<()> {
        Ok(())
    }

    /// Async instantiation of the driver.
    fn build(&self, name: String, config: Value) -> BoxFuture<'static, AppResult<Arc<dyn Device>>>;
}

/// Deserialize a driver config, treating `null` as an empty mapping.
pub fn parse_config<T: serde::de::DeserializeOwned>(device: &str, config: &Value) -> AppResult<T> {
    let config = if config.is_null() {
        Value::Object(Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| DaqError::Configuration(format!("device '{}': {}", device, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_single_owner() {
        let lock = DeviceLock::new("Clamp1");
        let a = ReservationId::next();
        let b = ReservationId::next();

        lock.try_acquire(a).unwrap();
        lock.try_acquire(a).unwrap();
        assert!(matches!(lock.try_acquire(b), Err(DaqError::Busy(name)) if name == "Clamp1"));

        assert!(!lock.release(b));
        assert!(lock.is_reserved());
        assert!(lock.release(a));
        assert!(lock.is_reserved());
        assert!(lock.release(a));
        assert!(!lock.is_reserved());
        assert!(!lock.release(a));
        lock.try_acquire(b).unwrap();
        assert_eq!(lock.owner(), Some(b));
    }

    #[test]
    fn clones_share_reservation() {
        let lock = DeviceLock::new("Camera");
        let clone = lock.clone();
        clone.try_acquire(ReservationId::next()).unwrap();
        assert!(lock.is_reserved());
    }

    #[test]
    fn parse_config_accepts_null() {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Cfg {
            rate: f64,
        }
        let cfg: Cfg = parse_config("dev", &Value::Null).unwrap();
        assert_eq!(cfg.rate, 0.0);
        let bad: AppResult<Cfg> = parse_config("dev", &serde_json::json!({"rate": "fast"}));
        assert!(matches!(bad, Err(DaqError::Configuration(_))));
    }
}
