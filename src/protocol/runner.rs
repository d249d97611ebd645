//! ProtocolRunner - background execution of protocols
//!
//! The runner drives Tasks on a spawned worker in one of three modes:
//!
//! - **single**: one Task, one frame
//! - **loop**: repeat until stopped; successive start times are spaced by
//!   `max(duration + leadTime, loopCycleTime)` (no gap when `continuous`)
//! - **sequence**: one Task per point of a frozen [`SequenceGrid`], in
//!   row-major order, paced by `cycleTime`
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start_*()  ┌─────────┐  pause()   ┌────────┐
//! │ Idle │────────────▶│ Running │───────────▶│ Paused │
//! └──────┘             └────┬────┘◀──resume()─└────────┘
//!    ▲                      │ stop() / abort()
//!    │                      ▼
//!    │              ┌───────────────────┐
//!    └──────────────│ Stopping/Aborting │
//!      worker exits └───────────────────┘
//! ```
//!
//! `stop()` exits at the next iteration boundary. `abort()` also cancels
//! the running Task, which stops every device with `abort = true`. Both are
//! idempotent. Consumers follow progress through [`RunnerEvent`]s on a
//! broadcast channel; errors never propagate past the worker, they end the
//! run with [`RunnerEvent::ExitFromError`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let runner = ProtocolRunner::new(devices);
//! let mut events = runner.subscribe();
//! runner.start_sequence(cmd, params, Some(current_dir))?;
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RunnerEvent::NewFrame(frame) => println!("{:?}", frame.coords),
//!         RunnerEvent::Finished { .. } | RunnerEvent::ExitFromError { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use crate::device::DeviceSource;
use crate::error::{AppResult, DaqError};
use crate::protocol::sequence::{ParamKey, SequenceGrid, SequenceParam};
use crate::protocol::{ProtocolCommand, PROTOCOL_KEY};
use crate::store::{Attributes, DirHandle};
use crate::task::{Task, TaskResult};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const EVENT_CAPACITY: usize = 1024;
const SLEEP_SLICE: Duration = Duration::from_millis(1);

/// Runner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No run in progress
    Idle,
    /// Executing iterations
    Running,
    /// Suspended at an iteration boundary
    Paused,
    /// Exiting at the next iteration boundary
    Stopping,
    /// Tearing down the current Task
    Aborting,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Idle => write!(f, "idle"),
            RunnerState::Running => write!(f, "running"),
            RunnerState::Paused => write!(f, "paused"),
            RunnerState::Stopping => write!(f, "stopping"),
            RunnerState::Aborting => write!(f, "aborting"),
        }
    }
}

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Iteration number, from 0
    pub index: usize,
    /// Grid coordinates (loop: the iteration number; single: empty)
    pub coords: Vec<usize>,
    /// Sweep values applied to this iteration
    pub params: Vec<(ParamKey, f64)>,
    /// Protocol descriptor that ran
    pub cmd: Value,
    /// Device results
    pub result: Arc<TaskResult>,
    /// Storage directory of this iteration
    pub dir: Option<PathBuf>,
}

/// Notifications emitted by the runner worker.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// Iteration `index` is about to run
    TaskStarted {
        /// Iteration number
        index: usize,
    },
    /// Sequence precomputation progress
    Progress {
        /// Points prepared
        done: usize,
        /// Points in the grid
        total: usize,
    },
    /// An iteration finished
    NewFrame(Frame),
    /// The runner entered the paused state
    Paused,
    /// The runner left the paused state
    Resumed,
    /// The run ended without error
    Finished {
        /// False when stopped or aborted early
        completed: bool,
    },
    /// The run ended because an iteration failed
    ExitFromError {
        /// Error description
        error: String,
    },
}

struct Control {
    state: Mutex<RunnerState>,
    stop: AtomicBool,
    pause: AtomicBool,
    abort: Arc<AtomicBool>,
    last_error: Mutex<Option<String>>,
}

enum Plan {
    Single(ProtocolCommand),
    Loop(ProtocolCommand),
    Sequence(ProtocolCommand, SequenceGrid),
}

enum Exit {
    Completed,
    Stopped,
    Aborted,
    Failed(DaqError),
}

/// Executes protocols on a background worker.
pub struct ProtocolRunner {
    source: Arc<dyn DeviceSource>,
    events: broadcast::Sender<RunnerEvent>,
    control: Arc<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProtocolRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRunner")
            .field("state", &self.status())
            .finish()
    }
}

impl ProtocolRunner {
    /// Runner resolving devices through `source`.
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            events,
            control: Arc::new(Control {
                state: Mutex::new(RunnerState::Idle),
                stop: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                abort: Arc::new(AtomicBool::new(false)),
                last_error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Receive runner events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Current state.
    pub fn status(&self) -> RunnerState {
        *self.control.state.lock()
    }

    /// Error that ended the most recent run, if any.
    pub fn last_error(&self) -> Option<String> {
        self.control.last_error.lock().clone()
    }

    /// Run `cmd` once. With `storeData`, results go to a new
    /// autoincremented child of `storage_parent`.
    pub fn start_single(&self, cmd: ProtocolCommand, storage_parent: Option<DirHandle>) -> AppResult<()> {
        let parent = self.check_command(&cmd, storage_parent)?;
        self.launch(Plan::Single(cmd), parent)
    }

    /// Repeat `cmd` until stopped. Each stored iteration gets its own
    /// autoincremented directory.
    pub fn start_loop(&self, cmd: ProtocolCommand, storage_parent: Option<DirHandle>) -> AppResult<()> {
        let parent = self.check_command(&cmd, storage_parent)?;
        self.launch(Plan::Loop(cmd), parent)
    }

    /// Run `cmd` once per point of the grid spanned by `params`.
    ///
    /// The grid is frozen here; later changes to the params have no effect
    /// on the running sequence.
    pub fn start_sequence(
        &self,
        cmd: ProtocolCommand,
        params: Vec<SequenceParam>,
        storage_parent: Option<DirHandle>,
    ) -> AppResult<()> {
        let parent = self.check_command(&cmd, storage_parent)?;
        for p in &params {
            if p.key.device != PROTOCOL_KEY && !cmd.devices.contains_key(&p.key.device) {
                return Err(DaqError::Configuration(format!(
                    "sequence parameter {} names a device that is not part of the protocol",
                    p.key
                )));
            }
        }
        let grid = SequenceGrid::new(params, cmd.protocol.repetitions)?;
        self.launch(Plan::Sequence(cmd, grid), parent)
    }

    /// Exit at the next iteration boundary. Idempotent.
    pub fn stop(&self) {
        let mut state = self.control.state.lock();
        if matches!(*state, RunnerState::Running | RunnerState::Paused) {
            info!("Runner stop requested");
            *state = RunnerState::Stopping;
        }
        self.control.stop.store(true, Ordering::SeqCst);
    }

    /// Cancel the running Task and skip remaining iterations. Idempotent.
    pub fn abort(&self) {
        let mut state = self.control.state.lock();
        if *state != RunnerState::Idle {
            if *state != RunnerState::Aborting {
                info!("Runner abort requested");
            }
            *state = RunnerState::Aborting;
            self.control.abort.store(true, Ordering::SeqCst);
        }
    }

    /// Suspend at the next iteration boundary.
    pub fn pause(&self) -> AppResult<()> {
        let state = self.status();
        if !matches!(state, RunnerState::Running | RunnerState::Paused) {
            return Err(DaqError::InvalidState(format!("cannot pause: runner is {}", state)));
        }
        self.control.pause.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Leave the paused state.
    pub fn resume(&self) {
        self.control.pause.store(false, Ordering::SeqCst);
    }

    /// Wait for the worker to exit.
    pub async fn wait(&self) -> AppResult<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| DaqError::InvalidState(format!("runner worker failed: {}", e)))?;
        }
        Ok(())
    }

    fn check_command(
        &self,
        cmd: &ProtocolCommand,
        storage_parent: Option<DirHandle>,
    ) -> AppResult<Option<DirHandle>> {
        cmd.validate()?;
        for name in cmd.device_names() {
            self.source.get_device(name)?;
        }
        let parent = storage_parent.or_else(|| cmd.protocol.storage_dir.clone());
        if cmd.protocol.store_data && parent.is_none() {
            return Err(DaqError::Configuration(
                "storeData is set but no storage directory was given".to_string(),
            ));
        }
        Ok(parent)
    }

    fn launch(&self, plan: Plan, parent: Option<DirHandle>) -> AppResult<()> {
        {
            let mut state = self.control.state.lock();
            if *state != RunnerState::Idle {
                return Err(DaqError::InvalidState(format!(
                    "cannot start: runner is {}",
                    *state
                )));
            }
            *state = RunnerState::Running;
        }
        self.control.stop.store(false, Ordering::SeqCst);
        self.control.pause.store(false, Ordering::SeqCst);
        self.control.abort.store(false, Ordering::SeqCst);
        *self.control.last_error.lock() = None;

        let worker = Worker {
            source: self.source.clone(),
            events: self.events.clone(),
            control: self.control.clone(),
        };
        let handle = tokio::spawn(worker.run(plan, parent));
        *self.worker.lock() = Some(handle);
        Ok(())
    }
}

fn annotate(dir: &DirHandle, info: Attributes) {
    if let Err(e) = dir.set_info(info) {
        warn!(dir = %dir.path().display(), error = %e, "Could not annotate run directory");
    }
}

struct Worker {
    source: Arc<dyn DeviceSource>,
    events: broadcast::Sender<RunnerEvent>,
    control: Arc<Control>,
}

impl Worker {
    fn emit(&self, event: RunnerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn aborting(&self) -> bool {
        self.control.abort.load(Ordering::SeqCst)
    }

    fn stopping(&self) -> bool {
        self.control.stop.load(Ordering::SeqCst)
    }

    async fn run(self, plan: Plan, parent: Option<DirHandle>) {
        let (exit, dir) = match plan {
            Plan::Single(cmd) => self.run_single(cmd, parent).await,
            Plan::Loop(cmd) => self.run_loop(cmd, parent).await,
            Plan::Sequence(cmd, grid) => self.run_sequence(cmd, grid, parent).await,
        };
        self.finish(exit, dir);
    }

    fn finish(&self, exit: Exit, dir: Option<DirHandle>) {
        let mut info = Attributes::new();
        let aborted = matches!(exit, Exit::Aborted);
        let event = match exit {
            Exit::Completed => {
                info.insert("completed".to_string(), Value::Bool(true));
                info!("Protocol run completed");
                RunnerEvent::Finished { completed: true }
            }
            Exit::Stopped | Exit::Aborted => {
                info.insert("incomplete".to_string(), Value::Bool(true));
                info!(aborted, "Protocol run ended early");
                RunnerEvent::Finished { completed: false }
            }
            Exit::Failed(err) => {
                let message = err.to_string();
                error!(error = %message, "Protocol run failed");
                info.insert("incomplete".to_string(), Value::Bool(true));
                info.insert("error".to_string(), Value::from(message.as_str()));
                if let Some(dir) = &dir {
                    let mut tags = Attributes::new();
                    tags.insert("msgType".to_string(), Value::from("error"));
                    tags.insert("importance".to_string(), Value::from(9));
                    if let Err(e) = dir.log_msg(&format!("Protocol failed: {}", message), tags) {
                        warn!(error = %e, "Could not log run failure");
                    }
                }
                *self.control.last_error.lock() = Some(message.clone());
                RunnerEvent::ExitFromError { error: message }
            }
        };
        if let Some(dir) = &dir {
            annotate(dir, info);
        }
        *self.control.state.lock() = RunnerState::Idle;
        self.emit(event);
    }

    /// Boundary check: honors abort, stop and pause.
    async fn checkpoint(&self) -> Option<Exit> {
        if self.aborting() {
            return Some(Exit::Aborted);
        }
        if self.stopping() {
            return Some(Exit::Stopped);
        }
        if !self.control.pause.load(Ordering::SeqCst) {
            return None;
        }

        {
            let mut state = self.control.state.lock();
            if *state == RunnerState::Running {
                *state = RunnerState::Paused;
            }
        }
        info!("Runner paused");
        self.emit(RunnerEvent::Paused);
        let exit = loop {
            sleep(SLEEP_SLICE).await;
            if self.aborting() {
                break Some(Exit::Aborted);
            }
            if self.stopping() {
                break Some(Exit::Stopped);
            }
            if !self.control.pause.load(Ordering::SeqCst) {
                break None;
            }
        };
        if exit.is_none() {
            let mut state = self.control.state.lock();
            if *state == RunnerState::Paused {
                *state = RunnerState::Running;
            }
            drop(state);
            info!("Runner resumed");
            self.emit(RunnerEvent::Resumed);
        }
        exit
    }

    /// Sleep until `deadline` in short slices, checking control flags.
    async fn sleep_until(&self, deadline: Instant) -> Option<Exit> {
        loop {
            if let Some(exit) = self.checkpoint().await {
                return Some(exit);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(SLEEP_SLICE.min(deadline - now)).await;
        }
    }

    fn storage_dir(
        &self,
        cmd: &ProtocolCommand,
        parent: Option<&DirHandle>,
        info: Attributes,
    ) -> AppResult<Option<DirHandle>> {
        match parent {
            Some(parent) if cmd.protocol.store_data => parent
                .mkdir(cmd.protocol.base_name(), true, info)
                .map(Some),
            _ => Ok(None),
        }
    }

    async fn execute_point(
        &self,
        index: usize,
        coords: Vec<usize>,
        params: Vec<(ParamKey, f64)>,
        mut cmd: ProtocolCommand,
        dir: Option<DirHandle>,
    ) -> Result<(), Exit> {
        cmd.protocol.storage_dir = dir.clone();
        let descriptor = cmd.to_value();
        self.emit(RunnerEvent::TaskStarted { index });
        debug!(index, ?coords, "Running iteration");

        let outcome = match Task::new(cmd, self.source.as_ref()) {
            Ok(task) => {
                let mut task = task.with_abort_flag(self.control.abort.clone());
                task.execute().await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => {
                self.emit(RunnerEvent::NewFrame(Frame {
                    index,
                    coords,
                    params,
                    cmd: descriptor,
                    result: Arc::new(result),
                    dir: dir.map(|d| d.path()),
                }));
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(Exit::Aborted),
            Err(e) => Err(Exit::Failed(e)),
        }
    }

    #[instrument(skip_all, fields(mode = "single"))]
    async fn run_single(&self, cmd: ProtocolCommand, parent: Option<DirHandle>) -> (Exit, Option<DirHandle>) {
        if let Some(exit) = self.checkpoint().await {
            return (exit, None);
        }
        let dir = match self.storage_dir(&cmd, parent.as_ref(), cmd.descriptor_info("Protocol")) {
            Ok(dir) => dir,
            Err(e) => return (Exit::Failed(e), None),
        };
        match self.execute_point(0, Vec::new(), Vec::new(), cmd, dir.clone()).await {
            Ok(()) => (Exit::Completed, dir),
            Err(exit) => (exit, dir),
        }
    }

    #[instrument(skip_all, fields(mode = "loop"))]
    async fn run_loop(&self, cmd: ProtocolCommand, parent: Option<DirHandle>) -> (Exit, Option<DirHandle>) {
        let period = Duration::from_secs_f64(cmd.protocol.loop_period());
        let mut index = 0;
        loop {
            match self.checkpoint().await {
                Some(Exit::Stopped) => return (Exit::Completed, None),
                Some(exit) => return (exit, None),
                None => {}
            }
            let started = Instant::now();
            let dir = match self.storage_dir(&cmd, parent.as_ref(), cmd.descriptor_info("Protocol")) {
                Ok(dir) => dir,
                Err(e) => return (Exit::Failed(e), None),
            };
            if let Err(exit) = self
                .execute_point(index, vec![index], Vec::new(), cmd.clone(), dir.clone())
                .await
            {
                return (exit, dir);
            }
            if let Some(dir) = &dir {
                let mut info = Attributes::new();
                info.insert("completed".to_string(), Value::Bool(true));
                annotate(dir, info);
            }
            index += 1;
            match self.sleep_until(started + period).await {
                Some(Exit::Stopped) => return (Exit::Completed, None),
                Some(exit) => return (exit, None),
                None => {}
            }
        }
    }

    /// Per-point command with the point's values substituted by each device.
    fn point_command(&self, cmd: &ProtocolCommand, values: &[(ParamKey, f64)]) -> AppResult<ProtocolCommand> {
        let mut by_device: BTreeMap<&str, BTreeMap<String, f64>> = BTreeMap::new();
        for (key, value) in values {
            if key.device == PROTOCOL_KEY {
                continue;
            }
            by_device
                .entry(key.device.as_str())
                .or_default()
                .insert(key.param.clone(), *value);
        }
        let mut point = cmd.clone();
        for (device, params) in by_device {
            let handle = self.source.get_device(device)?;
            let sub = point.devices.entry(device.to_string()).or_insert(Value::Null);
            handle.apply_sequence_params(sub, &params)?;
        }
        Ok(point)
    }

    #[instrument(skip_all, fields(mode = "sequence", points = grid.len()))]
    async fn run_sequence(
        &self,
        cmd: ProtocolCommand,
        grid: SequenceGrid,
        parent: Option<DirHandle>,
    ) -> (Exit, Option<DirHandle>) {
        let total = grid.len();
        let mut info = cmd.descriptor_info("ProtocolSequence");
        info.insert("sequenceParams".to_string(), grid.describe());
        info.insert("sequenceShape".to_string(), Value::from(grid.shape()));
        let seeds = grid.shuffle_seeds();
        if !seeds.is_empty() {
            info.insert("shuffleSeeds".to_string(), Value::Object(seeds));
        }
        let parent_dir = match self.storage_dir(&cmd, parent.as_ref(), info) {
            Ok(dir) => dir,
            Err(e) => return (Exit::Failed(e), None),
        };
        info!(points = total, shape = ?grid.shape(), "Starting sequence");

        let mut points = Vec::with_capacity(total);
        for (done, coords) in grid.points().into_iter().enumerate() {
            if self.aborting() {
                return (Exit::Aborted, parent_dir);
            }
            if self.stopping() {
                return (Exit::Stopped, parent_dir);
            }
            let prepared = grid
                .values_at(&coords)
                .and_then(|values| self.point_command(&cmd, &values).map(|c| (values, c)));
            match prepared {
                Ok((values, point)) => points.push((coords, values, point)),
                Err(e) => return (Exit::Failed(e), parent_dir),
            }
            self.emit(RunnerEvent::Progress { done: done + 1, total });
            tokio::task::yield_now().await;
        }

        let cycle = Duration::from_secs_f64(cmd.protocol.cycle_time);
        let mut last_start: Option<Instant> = None;
        for (index, (coords, values, point)) in points.into_iter().enumerate() {
            if let Some(exit) = self.checkpoint().await {
                return (exit, parent_dir);
            }
            if let Some(previous) = last_start {
                if let Some(exit) = self.sleep_until(previous + cycle).await {
                    return (exit, parent_dir);
                }
            }
            last_start = Some(Instant::now());

            let child = match &parent_dir {
                Some(parent) => {
                    let mut child_info = point.descriptor_info("Protocol");
                    child_info.insert("sequenceIndex".to_string(), Value::from(coords.clone()));
                    let point_values: Map<String, Value> = values
                        .iter()
                        .map(|(k, v)| (k.to_string(), Value::from(*v)))
                        .collect();
                    child_info.insert("sequenceValues".to_string(), Value::Object(point_values));
                    match parent.mkdir(&SequenceGrid::dir_name(&coords), false, child_info) {
                        Ok(dir) => Some(dir),
                        Err(e) => return (Exit::Failed(e), parent_dir),
                    }
                }
                None => None,
            };
            if let Err(exit) = self.execute_point(index, coords, values, point, child).await {
                return (exit, parent_dir);
            }
        }
        (Exit::Completed, parent_dir)
    }
}
