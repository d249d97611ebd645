//! Manager - process-wide owner of devices, modules and the data store
//!
//! The Manager is built once from a [`ManagerConfig`]:
//!
//! 1. the configuration is validated against the registered driver and
//!    module factories
//! 2. every configured device is instantiated through its [`DeviceFactory`]
//! 3. the data store is opened at `storage_dir`, which becomes both the
//!    base and the current directory
//! 4. configured modules are loaded
//!
//! Shutdown runs in reverse: modules first, then devices in reverse
//! registration order. [`Manager::quit`] is idempotent and a failing (or
//! panicking) device cannot keep the others from shutting down.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = Manager::new(ManagerConfig::load_from("rig.toml")?).await?;
//! manager.install()?;
//!
//! let mut task = manager.create_task(json!({
//!     "protocol": {"duration": 0.1},
//!     "Clamp1": {"waveform": "pulse(0.01, 0.05, 1)"},
//! }))?;
//! let result = task.execute().await?;
//!
//! manager.quit().await;
//! ```

use crate::config::ManagerConfig;
use crate::device::mock::{MockCameraFactory, MockWaveformFactory};
use crate::device::{Device, DeviceFactory, DeviceSource, ReservationId};
use crate::error::{AppResult, DaqError};
use crate::protocol::{ProtocolCommand, ProtocolRunner, SequenceParam};
use crate::store::{Attributes, DataStore, DirHandle};
use crate::task::Task;
use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

static GLOBAL: OnceCell<Arc<Manager>> = OnceCell::new();

const EVENT_CAPACITY: usize = 64;

/// Notifications from the Manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// The current directory changed
    CurrentDirChanged(PathBuf),
    /// A module finished loading
    ModuleLoaded {
        /// Module instance name
        name: String,
    },
    /// `quit()` began
    ShuttingDown,
}

// =============================================================================
// Modules
// =============================================================================

/// A long-lived component loaded by the Manager (e.g. a task runner).
#[async_trait]
pub trait Module: Send + Sync {
    /// Instance name.
    fn name(&self) -> &str;

    /// Registered module type.
    fn module_type(&self) -> &str;

    /// Release everything the module holds. Called once, by the Manager.
    async fn quit(&self) -> AppResult<()>;

    /// Upcast for [`Manager::get_module_as`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Builds modules of one type.
pub trait ModuleFactory: Send + Sync + 'static {
    /// Type name used in the `module` field of the configuration.
    fn module_type(&self) -> &'static str;

    /// Instantiate a module owned by `manager`.
    fn build(&self, manager: &Arc<Manager>, name: String, config: Value) -> AppResult<Arc<dyn Module>>;
}

// =============================================================================
// Reservation
// =============================================================================

/// Devices held by one owner until dropped.
///
/// Tasks created with [`Task::with_owner`]`(reservation.owner())` run on
/// the held devices; anyone else gets `Busy`.
pub struct Reservation {
    owner: ReservationId,
    devices: Vec<Arc<dyn Device>>,
}

impl Reservation {
    /// Owner id to hand to Tasks.
    pub fn owner(&self) -> ReservationId {
        self.owner
    }

    /// Names of the held devices.
    pub fn devices(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name()).collect()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("owner", &self.owner)
            .field("devices", &self.devices())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        for device in self.devices.iter().rev() {
            device.lock().release(self.owner);
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Manager`] from configuration, factories and prebuilt devices.
pub struct ManagerBuilder {
    config: ManagerConfig,
    device_factories: BTreeMap<&'static str, Arc<dyn DeviceFactory>>,
    module_factories: BTreeMap<&'static str, Arc<dyn ModuleFactory>>,
    devices: Vec<Arc<dyn Device>>,
}

impl ManagerBuilder {
    /// Builder with the built-in factories (`MockWaveform`, `MockCamera`,
    /// `TaskRunner`).
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            device_factories: BTreeMap::new(),
            module_factories: BTreeMap::new(),
            devices: Vec::new(),
        }
        .device_factory(MockWaveformFactory)
        .device_factory(MockCameraFactory)
        .module_factory(TaskRunnerFactory)
    }

    /// Register a driver factory, replacing any of the same type.
    pub fn device_factory(mut self, factory: impl DeviceFactory) -> Self {
        self.device_factories
            .insert(factory.driver_type(), Arc::new(factory));
        self
    }

    /// Register a module factory, replacing any of the same type.
    pub fn module_factory(mut self, factory: impl ModuleFactory) -> Self {
        self.module_factories
            .insert(factory.module_type(), Arc::new(factory));
        self
    }

    /// Add an already constructed device. Registered before configured ones.
    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.devices.push(device);
        self
    }

    /// Validate, instantiate devices, open the store and load modules.
    #[instrument(skip_all)]
    pub async fn build(self) -> AppResult<Arc<Manager>> {
        let ManagerBuilder {
            config,
            device_factories,
            module_factories,
            mut devices,
        } = self;

        let known_drivers: Vec<&str> = device_factories.keys().copied().collect();
        let known_modules: Vec<&str> = module_factories.keys().copied().collect();
        config.validate(&known_drivers, &known_modules)?;

        // Fail fast on every bad device config before touching hardware
        let mut validation_errors = Vec::new();
        for (name, def) in &config.devices {
            if devices.iter().any(|d| d.name() == name) {
                validation_errors.push(format!("Device '{}' is defined twice", name));
            } else if let Some(factory) = device_factories.get(def.driver.as_str()) {
                if let Err(e) = factory.validate(&def.config) {
                    validation_errors.push(format!("Device '{}' ({}): {}", name, def.driver, e));
                }
            }
        }
        if !validation_errors.is_empty() {
            return Err(DaqError::Configuration(format!(
                "device configuration invalid:\n  - {}",
                validation_errors.join("\n  - ")
            )));
        }

        for (name, def) in &config.devices {
            let Some(factory) = device_factories.get(def.driver.as_str()) else {
                continue;
            };
            match factory.build(name.clone(), def.config.clone()).await {
                Ok(device) => {
                    debug!(device = %name, driver = %def.driver, "Device initialized");
                    devices.push(device);
                }
                Err(e) => {
                    error!(device = %name, error = %e, "Device initialization failed");
                    shutdown_devices(&devices).await;
                    return Err(e);
                }
            }
        }

        let store = DataStore::new();
        let base_dir = match store.dir(&config.storage_dir, true) {
            Ok(dir) => dir,
            Err(e) => {
                shutdown_devices(&devices).await;
                return Err(e);
            }
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let modules = config.modules.clone();
        let manager = Arc::new(Manager {
            config,
            store,
            current_dir: RwLock::new(base_dir.clone()),
            base_dir,
            devices,
            modules: RwLock::new(Vec::new()),
            module_factories,
            events,
            shut_down: AtomicBool::new(false),
        });

        for (name, def) in modules {
            if let Err(e) = manager.load_module(&def.module, &name, def.config) {
                manager.quit().await;
                return Err(e);
            }
        }

        info!(
            devices = manager.devices.len(),
            modules = manager.modules.read().len(),
            "Manager ready"
        );
        Ok(manager)
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Process-wide owner of devices, modules and the data store.
pub struct Manager {
    config: ManagerConfig,
    store: DataStore,
    base_dir: DirHandle,
    current_dir: RwLock<DirHandle>,
    devices: Vec<Arc<dyn Device>>,
    modules: RwLock<Vec<Arc<dyn Module>>>,
    module_factories: BTreeMap<&'static str, Arc<dyn ModuleFactory>>,
    events: broadcast::Sender<ManagerEvent>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("base_dir", &self.base_dir.path())
            .field("devices", &self.list_devices())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Manager {
    /// Manager with the built-in factories.
    pub async fn new(config: ManagerConfig) -> AppResult<Arc<Self>> {
        ManagerBuilder::new(config).build().await
    }

    /// Builder for custom factories or prebuilt devices.
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// Make this the process-wide instance. Fails if one is installed.
    pub fn install(self: &Arc<Self>) -> AppResult<()> {
        GLOBAL
            .set(Arc::clone(self))
            .map_err(|_| DaqError::InvalidState("a Manager is already installed".to_string()))
    }

    /// The process-wide instance.
    pub fn global() -> AppResult<Arc<Self>> {
        GLOBAL
            .get()
            .cloned()
            .ok_or_else(|| DaqError::InvalidState("no Manager installed".to_string()))
    }

    /// Configuration the Manager was built from.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Receive Manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Device names in registration order.
    pub fn list_devices(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    /// Look up a device by name.
    pub fn get_device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| DaqError::device(name, "no such device"))
    }

    /// Instantiate a module of type `module_type` under `name`.
    pub fn load_module(self: &Arc<Self>, module_type: &str, name: &str, config: Value) -> AppResult<Arc<dyn Module>> {
        self.ensure_running()?;
        if self.modules.read().iter().any(|m| m.name() == name) {
            return Err(DaqError::Configuration(format!("module '{}' is already loaded", name)));
        }
        let factory = self.module_factories.get(module_type).ok_or_else(|| {
            DaqError::Configuration(format!("unknown module type '{}'", module_type))
        })?;
        let module = factory.build(self, name.to_string(), config)?;
        self.modules.write().push(Arc::clone(&module));
        info!(module = %name, module_type, "Module loaded");
        let _ = self.events.send(ManagerEvent::ModuleLoaded {
            name: name.to_string(),
        });
        Ok(module)
    }

    /// Look up a loaded module.
    pub fn get_module(&self, name: &str) -> AppResult<Arc<dyn Module>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("no module named '{}'", name)))
    }

    /// Look up a loaded module as its concrete type.
    pub fn get_module_as<T: Module + 'static>(&self, name: &str) -> AppResult<Arc<T>> {
        self.get_module(name)?
            .into_any()
            .downcast::<T>()
            .map_err(|_| DaqError::Configuration(format!("module '{}' has a different type", name)))
    }

    /// Names of the loaded modules, in load order.
    pub fn list_modules(&self) -> Vec<String> {
        self.modules
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// The data store.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Root of the experiment data tree.
    pub fn base_dir(&self) -> &DirHandle {
        &self.base_dir
    }

    /// Directory new results go under.
    pub fn get_current_dir(&self) -> DirHandle {
        self.current_dir.read().clone()
    }

    /// Change the current directory.
    pub fn set_current_dir(&self, dir: DirHandle) {
        let path = dir.path();
        *self.current_dir.write() = dir;
        info!(dir = %path.display(), "Current directory changed");
        let _ = self.events.send(ManagerEvent::CurrentDirChanged(path));
    }

    /// Build a Task from a protocol mapping.
    pub fn create_task(&self, cmd: Value) -> AppResult<Task> {
        self.ensure_running()?;
        Task::new(ProtocolCommand::from_value(cmd)?, self)
    }

    /// Read `name` (with `.json` appended when it has no extension) from
    /// the protocol directory.
    pub fn load_protocol(&self, name: &str) -> AppResult<ProtocolCommand> {
        let mut path = self.config.protocol_dir.join(name);
        if path.extension().is_none() {
            path.set_extension("json");
        }
        if !path.is_file() {
            return Err(DaqError::NotFound(path));
        }
        ProtocolCommand::load(&path)
    }

    /// Reserve `names` for one owner; all or none.
    pub fn reserve_devices(&self, names: &[&str]) -> AppResult<Reservation> {
        self.ensure_running()?;
        let mut reservation = Reservation {
            owner: ReservationId::next(),
            devices: Vec::with_capacity(names.len()),
        };
        for name in names {
            let device = self.get_device(name)?;
            // Dropping `reservation` on error releases what was taken
            device.lock().try_acquire(reservation.owner)?;
            reservation.devices.push(device);
        }
        debug!(owner = %reservation.owner, devices = ?names, "Devices reserved");
        Ok(reservation)
    }

    /// Record an experiment-level log message in the current directory.
    pub fn log_msg(&self, message: &str, tags: Attributes) -> AppResult<()> {
        info!(target: "neurodaq::experiment", ?tags, "{}", message);
        self.get_current_dir().log_msg(message, tags)
    }

    /// True once [`quit`](Self::quit) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shut down modules, then devices in reverse registration order.
    ///
    /// Only the first call does anything. Failures are logged and do not
    /// stop the remaining teardown.
    #[instrument(skip(self))]
    pub async fn quit(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Manager already shut down");
            return;
        }
        info!("Manager shutting down");
        let _ = self.events.send(ManagerEvent::ShuttingDown);

        let modules: Vec<Arc<dyn Module>> = std::mem::take(&mut *self.modules.write());
        for module in modules.iter().rev() {
            match AssertUnwindSafe(module.quit()).catch_unwind().await {
                Ok(Ok(())) => debug!(module = %module.name(), "Module stopped"),
                Ok(Err(e)) => warn!(module = %module.name(), error = %e, "Module quit failed"),
                Err(_) => error!(module = %module.name(), "Module panicked during quit"),
            }
        }

        shutdown_devices(&self.devices).await;
        info!("Manager shut down");
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.is_shut_down() {
            return Err(DaqError::InvalidState("the Manager has shut down".to_string()));
        }
        Ok(())
    }
}

impl DeviceSource for Manager {
    fn get_device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        Manager::get_device(self, name)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            warn!("Manager dropped without quit(); devices were not shut down");
        }
    }
}

async fn shutdown_devices(devices: &[Arc<dyn Device>]) {
    for device in devices.iter().rev() {
        match AssertUnwindSafe(device.shutdown()).catch_unwind().await {
            Ok(Ok(())) => debug!(device = %device.name(), "Device shut down"),
            Ok(Err(e)) => warn!(device = %device.name(), error = %e, "Device shutdown failed"),
            Err(_) => error!(device = %device.name(), "Device panicked during shutdown"),
        }
    }
}

// =============================================================================
// TaskRunner module
// =============================================================================

/// Device lookups through a Manager that may have gone away.
struct ManagerDevices(Weak<Manager>);

impl DeviceSource for ManagerDevices {
    fn get_device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.0
            .upgrade()
            .ok_or_else(|| DaqError::InvalidState("the Manager has shut down".to_string()))?
            .get_device(name)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaskRunnerConfig {
    /// Protocol file loaded at startup
    protocol: Option<String>,
}

/// Runs protocols against the Manager's devices, storing under the
/// Manager's current directory.
pub struct TaskRunnerModule {
    name: String,
    manager: Weak<Manager>,
    runner: ProtocolRunner,
    protocol: RwLock<Option<ProtocolCommand>>,
}

impl TaskRunnerModule {
    /// The underlying runner, for events and control.
    pub fn runner(&self) -> &ProtocolRunner {
        &self.runner
    }

    /// Protocol selected for [`run`](Self::run).
    pub fn protocol(&self) -> Option<ProtocolCommand> {
        self.protocol.read().clone()
    }

    /// Select the protocol to run.
    pub fn set_protocol(&self, cmd: ProtocolCommand) {
        *self.protocol.write() = Some(cmd);
    }

    /// Run the selected protocol once, or in a loop when it says `loop`.
    pub fn run(&self) -> AppResult<()> {
        let cmd = self.selected()?;
        let dir = self.current_dir()?;
        if cmd.protocol.looping {
            self.runner.start_loop(cmd, Some(dir))
        } else {
            self.runner.start_single(cmd, Some(dir))
        }
    }

    /// Run the selected protocol over the grid spanned by `params`.
    pub fn run_sequence(&self, params: Vec<SequenceParam>) -> AppResult<()> {
        let cmd = self.selected()?;
        let dir = self.current_dir()?;
        self.runner.start_sequence(cmd, params, Some(dir))
    }

    fn selected(&self) -> AppResult<ProtocolCommand> {
        self.protocol()
            .ok_or_else(|| DaqError::InvalidState(format!("module '{}' has no protocol selected", self.name)))
    }

    fn current_dir(&self) -> AppResult<DirHandle> {
        self.manager
            .upgrade()
            .map(|m| m.get_current_dir())
            .ok_or_else(|| DaqError::InvalidState("the Manager has shut down".to_string()))
    }
}

#[async_trait]
impl Module for TaskRunnerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> &str {
        TaskRunnerFactory::TYPE
    }

    async fn quit(&self) -> AppResult<()> {
        self.runner.abort();
        self.runner.wait().await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Factory for [`TaskRunnerModule`].
pub struct TaskRunnerFactory;

impl TaskRunnerFactory {
    const TYPE: &'static str = "TaskRunner";
}

impl ModuleFactory for TaskRunnerFactory {
    fn module_type(&self) -> &'static str {
        Self::TYPE
    }

    fn build(&self, manager: &Arc<Manager>, name: String, config: Value) -> AppResult<Arc<dyn Module>> {
        let config: TaskRunnerConfig = if config.is_null() {
            TaskRunnerConfig::default()
        } else {
            serde_json::from_value(config)
                .map_err(|e| DaqError::Configuration(format!("module '{}': {}", name, e)))?
        };
        let protocol = config
            .protocol
            .as_deref()
            .map(|p| manager.load_protocol(p))
            .transpose()?;
        let source: Arc<dyn DeviceSource> = Arc::new(ManagerDevices(Arc::downgrade(manager)));
        Ok(Arc::new(TaskRunnerModule {
            name,
            manager: Arc::downgrade(manager),
            runner: ProtocolRunner::new(source),
            protocol: RwLock::new(protocol),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceDefinition, ModuleDefinition};
    use crate::device::mock::{Faults, MockWaveformConfig, MockWaveformDevice};
    use serde_json::json;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn rig(dir: &std::path::Path) -> ManagerConfig {
        let mut config = ManagerConfig {
            storage_dir: dir.join("data"),
            protocol_dir: dir.join("protocols"),
            ..ManagerConfig::default()
        };
        config.devices.insert(
            "Clamp1".to_string(),
            DeviceDefinition {
                driver: "MockWaveform".to_string(),
                config: json!({"rate": 1000.0}),
            },
        );
        config.devices.insert(
            "Camera".to_string(),
            DeviceDefinition {
                driver: "MockCamera".to_string(),
                config: Value::Null,
            },
        );
        config
    }

    #[tokio::test]
    async fn builds_devices_and_store() {
        let tmp = tempdir().unwrap();
        let manager = Manager::new(rig(tmp.path())).await.unwrap();
        assert_eq!(manager.list_devices(), vec!["Camera", "Clamp1"]);
        assert!(manager.get_device("Clamp1").is_ok());
        assert!(manager.get_device("Nope").is_err());
        assert!(tmp.path().join("data").is_dir());
        assert_eq!(manager.get_current_dir(), *manager.base_dir());
        manager.quit().await;
    }

    #[tokio::test]
    async fn unknown_driver_is_config_error() {
        let tmp = tempdir().unwrap();
        let mut config = rig(tmp.path());
        config.devices.insert(
            "Stage".to_string(),
            DeviceDefinition {
                driver: "Esp300".to_string(),
                config: Value::Null,
            },
        );
        let err = Manager::new(config).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn create_task_runs_on_configured_devices() {
        let tmp = tempdir().unwrap();
        let manager = Manager::new(rig(tmp.path())).await.unwrap();
        let mut task = manager
            .create_task(json!({
                "protocol": {"duration": 0.01},
                "Clamp1": {"waveform": "pulse(0.002, 0.001, 1.0)"},
            }))
            .unwrap();
        let result = task.execute().await.unwrap();
        let trace = result["Clamp1"].as_array().unwrap();
        assert_eq!(trace.shape(), vec![10]);
        manager.quit().await;
    }

    #[tokio::test]
    async fn reservation_blocks_other_owners() {
        let tmp = tempdir().unwrap();
        let manager = Manager::new(rig(tmp.path())).await.unwrap();
        let held = manager.reserve_devices(&["Clamp1"]).unwrap();
        assert!(matches!(manager.reserve_devices(&["Camera", "Clamp1"]), Err(DaqError::Busy(_))));
        assert!(!manager.get_device("Camera").unwrap().lock().is_reserved());

        let cmd = json!({
            "protocol": {"duration": 0.01},
            "Clamp1": {"waveform": "0"},
        });
        let mut other = manager.create_task(cmd.clone()).unwrap();
        assert!(matches!(other.execute().await, Err(DaqError::Busy(_))));

        let mut mine = manager.create_task(cmd).unwrap().with_owner(held.owner());
        mine.execute().await.unwrap();
        assert!(manager.get_device("Clamp1").unwrap().lock().is_reserved());

        drop(held);
        assert!(!manager.get_device("Clamp1").unwrap().lock().is_reserved());
        manager.quit().await;
    }

    #[tokio::test]
    async fn quit_is_idempotent() {
        let tmp = tempdir().unwrap();
        let manager = Manager::new(rig(tmp.path())).await.unwrap();
        let mut events = manager.subscribe();
        manager.quit().await;
        manager.quit().await;
        assert!(manager.is_shut_down());
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::ShuttingDown);
        assert!(events.try_recv().is_err());
        assert!(manager.create_task(json!({})).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_shutdown_is_logged_and_skipped() {
        let tmp = tempdir().unwrap();
        let faulty = Arc::new(MockWaveformDevice::new("Faulty", MockWaveformConfig::default()).unwrap());
        faulty.set_faults(Faults {
            fail_shutdown: true,
            ..Faults::default()
        });
        let manager = Manager::builder(rig(tmp.path()))
            .device(faulty.clone())
            .build()
            .await
            .unwrap();
        manager.quit().await;
        assert_eq!(faulty.stats().shutdowns(), 1);
        assert!(logs_contain("Device shutdown failed"));
        assert!(logs_contain("Mock camera shut down"));
    }

    #[tokio::test]
    async fn log_msg_goes_to_current_dir() {
        let tmp = tempdir().unwrap();
        let manager = Manager::new(rig(tmp.path())).await.unwrap();
        let cell = manager.base_dir().mkdir("cell", true, Attributes::new()).unwrap();
        manager.set_current_dir(cell.clone());
        manager.log_msg("patched", Attributes::new()).unwrap();
        let log = cell.read_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "patched");
        manager.quit().await;
    }

    #[tokio::test]
    async fn task_runner_module_runs_loaded_protocol() {
        let tmp = tempdir().unwrap();
        let mut config = rig(tmp.path());
        std::fs::create_dir_all(&config.protocol_dir).unwrap();
        std::fs::write(
            config.protocol_dir.join("pulse.json"),
            r#"{"protocol": {"duration": 0.01, "storeData": true}, "Clamp1": {"waveform": "1"}}"#,
        )
        .unwrap();
        config.modules.insert(
            "Runner".to_string(),
            ModuleDefinition {
                module: "TaskRunner".to_string(),
                config: json!({"protocol": "pulse"}),
            },
        );
        let manager = Manager::new(config).await.unwrap();
        let module: Arc<TaskRunnerModule> = manager.get_module_as("Runner").unwrap();
        module.run().unwrap();
        module.runner().wait().await.unwrap();
        assert_eq!(manager.base_dir().ls().unwrap(), vec!["protocol_000"]);
        manager.quit().await;
        assert!(manager.list_modules().is_empty());
    }
}
