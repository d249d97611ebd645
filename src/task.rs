//! One synchronous multi-device run.
//!
//! ```text
//!  New ─configure()→ Configured ─reserve()→ Reserved ─start()→ Running
//!  Running ─wait()→ Stopping ─get_result()→ Done ─release()→ Released
//!  (any) ─error/abort→ stop(abort = true) on every device, then Released
//! ```
//!
//! Reservation is all-or-nothing, devices start strictly in the declared
//! start order, the poll loop is bounded by the protocol timeout and results
//! are collected once and cached.

use crate::daq::DaqTask;
use crate::data::DataObject;
use crate::device::{Device, DeviceSource, DeviceTask, ReservationId, TaskContext};
use crate::error::{AppResult, DaqError};
use crate::protocol::ProtocolCommand;
use crate::store::{Attributes, DirHandle};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

/// Results of one Task keyed by device name.
pub type TaskResult = BTreeMap<String, DataObject>;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, no device tasks yet
    New,
    /// Device tasks created
    Configured,
    /// Every device reserved
    Reserved,
    /// Every device started
    Running,
    /// Devices finished; results not yet collected
    Stopping,
    /// Results collected
    Done,
    /// Devices stopped and released
    Released,
}

/// One protocol execution across several devices.
pub struct Task {
    cmd: ProtocolCommand,
    devices: Vec<Arc<dyn Device>>,
    tasks: BTreeMap<String, Box<dyn DeviceTask>>,
    start_order: Vec<String>,
    daq: DaqTask,
    state: TaskState,
    owner: ReservationId,
    abort: Arc<AtomicBool>,
    result: Option<TaskResult>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("devices", &self.cmd.devices.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Task {
    /// Resolve the devices named by `cmd`.
    pub fn new(cmd: ProtocolCommand, source: &dyn DeviceSource) -> AppResult<Self> {
        cmd.validate()?;
        let devices = cmd
            .device_names()
            .map(|name| source.get_device(name))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            cmd,
            devices,
            tasks: BTreeMap::new(),
            start_order: Vec::new(),
            daq: DaqTask::new(),
            state: TaskState::New,
            owner: ReservationId::next(),
            abort: Arc::new(AtomicBool::new(false)),
            result: None,
        })
    }

    /// Share an abort flag (e.g. a runner's) instead of a private one.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    /// Reserve devices as `owner`, for callers already holding them.
    pub fn with_owner(mut self, owner: ReservationId) -> Self {
        self.owner = owner;
        self
    }

    /// Flag that cancels the Task at its next suspension point.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Request cancellation.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The protocol this Task runs.
    pub fn command(&self) -> &ProtocolCommand {
        &self.cmd
    }

    /// Device names in start order (final after `start`).
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// The DAQ coordinator of this run.
    pub fn daq(&self) -> &DaqTask {
        &self.daq
    }

    fn expect_state(&self, expected: TaskState, op: &str) -> AppResult<()> {
        if self.state != expected {
            return Err(DaqError::InvalidState(format!(
                "cannot {} a task in state {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    fn check_abort(&self) -> AppResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(DaqError::Canceled);
        }
        Ok(())
    }

    /// Tear down after a failure and hand the error back.
    async fn fail<T>(&mut self, err: DaqError) -> AppResult<T> {
        if !err.is_cancellation() {
            tracing::warn!(error = %err, "Task failed; aborting all devices");
        }
        self.teardown(true).await;
        Err(err)
    }

    /// Create one DeviceTask per participating device.
    pub async fn configure(&mut self) -> AppResult<()> {
        self.expect_state(TaskState::New, "configure")?;
        let ctx = TaskContext {
            duration: self.cmd.protocol.duration,
            owner: self.owner,
        };
        for device in &self.devices {
            let cmd = self
                .cmd
                .devices
                .get(device.name())
                .cloned()
                .unwrap_or(Value::Null);
            let task = device.create_task(&cmd, &ctx)?;
            self.start_order.push(device.name().to_string());
            self.tasks.insert(device.name().to_string(), task);
        }
        self.state = TaskState::Configured;
        Ok(())
    }

    /// Reserve every device, or none.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn reserve(&mut self) -> AppResult<()> {
        self.expect_state(TaskState::Configured, "reserve")?;
        let mut reserved: Vec<String> = Vec::new();
        let mut failure = None;
        for name in &self.start_order {
            if let Err(e) = self.check_abort() {
                failure = Some(e);
                break;
            }
            let Some(task) = self.tasks.get_mut(name) else {
                continue;
            };
            match task.reserve().await {
                Ok(()) => reserved.push(name.clone()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for name in reserved.iter().rev() {
                if let Some(task) = self.tasks.get_mut(name) {
                    if let Err(e) = task.release().await {
                        tracing::warn!(device = %name, error = %e, "Release after failed reservation failed");
                    }
                }
            }
            return self.fail(err).await;
        }
        tracing::debug!(devices = reserved.len(), "All devices reserved");
        self.state = TaskState::Reserved;
        Ok(())
    }

    /// Configure devices against their peers, synchronize channels and start
    /// every device in order.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn start(&mut self) -> AppResult<()> {
        self.expect_state(TaskState::Reserved, "start")?;
        if let Err(e) = self.launch().await {
            return self.fail(e).await;
        }
        self.state = TaskState::Running;
        Ok(())
    }

    async fn launch(&mut self) -> AppResult<()> {
        self.prepare().await?;
        for name in &self.start_order {
            self.check_abort()?;
            let Some(task) = self.tasks.get_mut(name) else {
                continue;
            };
            tracing::debug!(device = %name, "Starting device");
            task.start(&self.daq).await?;
        }
        Ok(())
    }

    async fn prepare(&mut self) -> AppResult<()> {
        let names = self.start_order.clone();
        for name in &names {
            if let Some(task) = self.tasks.get_mut(name) {
                task.configure(&self.cmd.devices, &mut self.start_order).await?;
            }
        }
        let mut sorted = self.start_order.clone();
        sorted.sort();
        if sorted.len() != self.tasks.len() || !sorted.iter().eq(self.tasks.keys()) {
            return Err(DaqError::InvalidState(format!(
                "device configure produced an invalid start order {:?}",
                self.start_order
            )));
        }

        let triggers: Vec<String> = self
            .start_order
            .iter()
            .filter(|name| self.tasks.get(*name).map_or(false, |t| t.is_trigger_source()))
            .cloned()
            .collect();
        if triggers.len() > 1 {
            return Err(DaqError::TriggerMismatch(format!(
                "devices {:?} all claim to trigger the task",
                triggers
            )));
        }
        if let Some(trigger) = triggers.first() {
            self.daq.set_trigger_device(trigger)?;
            self.start_order.retain(|n| n != trigger);
            self.start_order.push(trigger.clone());
        }

        for name in &self.start_order {
            if let Some(task) = self.tasks.get_mut(name) {
                task.create_channels(&mut self.daq).await?;
            }
        }
        self.daq.finalize()?;
        tracing::debug!(order = ?self.start_order, trigger = ?self.daq.trigger_device(), "Task prepared");
        Ok(())
    }

    /// Poll until every device is done, bounded by the protocol timeout.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn wait(&mut self) -> AppResult<()> {
        self.expect_state(TaskState::Running, "wait for")?;
        if let Err(e) = self.poll().await {
            return self.fail(e).await;
        }
        for name in &self.start_order {
            if let Some(task) = self.tasks.get_mut(name) {
                if let Err(e) = task.stop(false).await {
                    tracing::warn!(device = %name, error = %e, "Stop failed");
                }
            }
        }
        self.state = TaskState::Stopping;
        Ok(())
    }

    async fn poll(&mut self) -> AppResult<()> {
        let timeout = self.cmd.protocol.effective_timeout();
        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        loop {
            self.check_abort()?;
            let mut all_done = true;
            for name in &self.start_order {
                let Some(task) = self.tasks.get_mut(name) else {
                    continue;
                };
                if !task.is_done().await? {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::Timeout(timeout));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Collect device results. Later calls return the cached result.
    pub async fn get_result(&mut self) -> AppResult<TaskResult> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        self.expect_state(TaskState::Stopping, "collect results of")?;
        match self.collect().await {
            Ok(result) => {
                self.result = Some(result.clone());
                self.state = TaskState::Done;
                Ok(result)
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn collect(&mut self) -> AppResult<TaskResult> {
        let mut result = TaskResult::new();
        for name in &self.start_order {
            let Some(task) = self.tasks.get_mut(name) else {
                continue;
            };
            if let Some(obj) = task.get_result().await? {
                result.insert(name.clone(), obj);
            }
        }
        Ok(result)
    }

    /// Write results and the protocol descriptor into `dir`.
    ///
    /// Each device may store its own result; otherwise the Task writes it
    /// under the device name. Failures do not stop the remaining writes:
    /// they are recorded in the directory's info and log, and the first one
    /// is returned.
    #[instrument(skip(self, dir), fields(dir = %dir.path().display()))]
    pub async fn store_results(&mut self, dir: &DirHandle) -> AppResult<()> {
        let result = self.get_result().await?;
        let mut errors: Vec<(String, DaqError)> = Vec::new();
        for name in &self.start_order {
            let Some(task) = self.tasks.get_mut(name) else {
                continue;
            };
            let handled = match task.store_result(dir).await {
                Ok(handled) => handled,
                Err(e) => {
                    errors.push((name.clone(), e));
                    continue;
                }
            };
            if handled {
                continue;
            }
            if let Some(obj) = result.get(name) {
                if let Err(e) = dir.write_object(obj, name, Attributes::new()) {
                    errors.push((name.clone(), e));
                }
            }
        }

        let mut info = Attributes::new();
        if let Value::Object(descriptor) = self.cmd.to_value() {
            info.extend(descriptor);
        }
        if !errors.is_empty() {
            let records: Vec<Value> = errors
                .iter()
                .map(|(device, e)| serde_json::json!({"device": device, "error": e.to_string()}))
                .collect();
            info.insert("storageErrors".to_string(), Value::Array(records));
        }
        dir.set_info(info)?;

        if let Some((device, err)) = errors.into_iter().next() {
            let mut tags = Attributes::new();
            tags.insert("msgType".to_string(), Value::from("error"));
            tags.insert("device".to_string(), Value::from(device.as_str()));
            if let Err(e) = dir.log_msg(&format!("Storing result of {} failed: {}", device, err), tags) {
                tracing::warn!(error = %e, "Could not log storage failure");
            }
            return Err(err);
        }
        tracing::debug!(results = result.len(), "Results stored");
        Ok(())
    }

    /// Stop and release every device after a normal run.
    pub async fn release(&mut self) -> AppResult<()> {
        if self.state == TaskState::Released {
            return Ok(());
        }
        self.teardown(false).await;
        Ok(())
    }

    /// Stop then release every DeviceTask. Errors are logged, never raised.
    pub async fn teardown(&mut self, abort: bool) {
        if self.state == TaskState::Released {
            return;
        }
        for name in &self.start_order {
            let Some(task) = self.tasks.get_mut(name) else {
                continue;
            };
            if abort {
                if let Err(e) = task.stop(true).await {
                    tracing::warn!(device = %name, error = %e, "Abort failed");
                }
            }
            if let Err(e) = task.release().await {
                tracing::warn!(device = %name, error = %e, "Release failed");
            }
        }
        self.state = TaskState::Released;
    }

    /// Run the whole lifecycle: configure, reserve, start, wait, collect,
    /// store (when `storeData` is set and a storage directory is given) and
    /// release.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn execute(&mut self) -> AppResult<TaskResult> {
        if let Err(e) = self.configure().await {
            return self.fail(e).await;
        }
        self.reserve().await?;
        self.start().await?;
        self.wait().await?;
        let result = self.get_result().await?;

        let stored = match (self.cmd.protocol.store_data, self.cmd.protocol.storage_dir.clone()) {
            (true, Some(dir)) => self.store_results(&dir).await,
            _ => Ok(()),
        };
        self.release().await?;
        stored?;
        Ok(result)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TaskState::Reserved | TaskState::Running | TaskState::Stopping | TaskState::Done
        ) {
            tracing::warn!(state = ?self.state, "Task dropped without release");
            for device in &self.devices {
                device.lock().release(self.owner);
            }
        }
    }
}
