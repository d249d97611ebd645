//! # neurodaq Core Library
//!
//! Device orchestration, protocol sequencing and self-describing experiment
//! storage for neurophysiology rigs. The `neurodaq` binary is a thin CLI
//! over this library; anything embedding the acquisition core (a GUI, a
//! scripting host) links against it directly.
//!
//! ## Crate Structure
//!
//! - **`manager`**: the process-wide `Manager` that owns devices, modules and
//!   the data store, and guarantees orderly shutdown.
//! - **`device`**: the `Device`/`DeviceTask` contract every driver implements,
//!   reservation locks, driver factories, and the mock drivers in
//!   `device::mock`.
//! - **`daq`**: the DAQ coordinator that merges per-device channel requests
//!   into one hardware-timed acquisition per clock domain.
//! - **`task`**: one synchronized acquisition across several devices.
//! - **`protocol`**: protocol descriptors, parameter sweeps and the
//!   background `ProtocolRunner`.
//! - **`stimulus`**: the waveform expression language and sequence-line
//!   parser.
//! - **`store`**: the hierarchical data store (directory index, timestamps,
//!   per-directory logs, handle cache).
//! - **`data`**: in-memory result types (`MetaArray`, `ImageData`) and the
//!   filetype registry that reads and writes them.
//! - **`config`**: `ManagerConfig` loaded with figment.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `DaqError`.

pub mod config;
pub mod daq;
pub mod data;
pub mod device;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod stimulus;
pub mod store;
pub mod task;

pub use crate::config::ManagerConfig;
pub use crate::error::{AppResult, DaqError};
pub use crate::manager::{Manager, ManagerBuilder, Module, TaskRunnerModule};
pub use crate::protocol::{ProtocolCommand, ProtocolRunner, RunnerEvent, SequenceParam};
pub use crate::store::{DataStore, DirHandle};
pub use crate::task::Task;
