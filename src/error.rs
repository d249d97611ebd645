//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, shared by the data
//! store, the filetype registry, the device layer, tasks and the protocol
//! runner. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report the failure kinds the system distinguishes.
//!
//! ## Error Hierarchy
//!
//! - **Configuration**: `Config`, `Configuration`. Startup misconfiguration,
//!   fatal for the process.
//! - **Storage**: `NotFound`, `NotADirectory`, `NotAFile`, `AlreadyExists`,
//!   `CorruptIndex`, `Deleted`, `DirectoryNotEmpty`, `NoWriter`, `NoReader`.
//! - **Synchronization**: `Busy`, `TriggerMismatch`, `ClockMismatch`. Raised
//!   by device reservation and DAQ channel aggregation.
//! - **Execution**: `Timeout`, `Canceled`, `InvalidState`.
//! - **Drivers**: `Device` carries the failing device name and a detail string.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying I/O,
//! serialization and configuration errors with the `?` operator.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A path does not exist.
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A directory was requested but the path names something else.
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A file was requested but the path names a directory.
    #[error("Not a file: {}", .0.display())]
    NotAFile(PathBuf),

    /// The target of a create, move or rename already exists.
    #[error("Already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The `.index` file of a managed directory could not be parsed.
    ///
    /// The store never rewrites a damaged index implicitly.
    #[error("Corrupt index in {}: {detail}", .path.display())]
    CorruptIndex {
        /// Directory whose index is damaged
        path: PathBuf,
        /// Parser message
        detail: String,
    },

    /// The handle's path has been deleted.
    #[error("Handle has been deleted: {}", .0.display())]
    Deleted(PathBuf),

    /// Non-recursive delete of a directory that still has children.
    #[error("Directory not empty: {}", .0.display())]
    DirectoryNotEmpty(PathBuf),

    /// No registered filetype accepts the object.
    #[error("No writer accepts object of kind '{0}'")]
    NoWriter(String),

    /// No registered filetype can read the file.
    #[error("No reader for file {}", .0.display())]
    NoReader(PathBuf),

    /// The device is already reserved by another task.
    #[error("Device '{0}' is busy")]
    Busy(String),

    /// Two devices disagree on how the task is triggered.
    #[error("Trigger mismatch: {0}")]
    TriggerMismatch(String),

    /// Channels on one clock domain requested different sample rates.
    #[error("Clock mismatch on '{domain}': {existing} Hz vs {requested} Hz")]
    ClockMismatch {
        /// Clock domain (DAQ device) name
        domain: String,
        /// Rate already set on the domain
        existing: f64,
        /// Rate requested by the new channel
        requested: f64,
    },

    /// The task poll loop exceeded its bound.
    #[error("Timed out after {0:.3} s waiting for task completion")]
    Timeout(f64),

    /// Cooperative cancellation.
    #[error("Canceled")]
    Canceled,

    /// Any other driver failure.
    #[error("Device '{device}' error: {detail}")]
    Device {
        /// Device name
        device: String,
        /// Driver message
        detail: String,
    },

    /// Stimulus or sequence text could not be parsed or evaluated.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation is not valid in the object's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Raster image encoding or decoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DaqError {
    /// Build a [`DaqError::Device`] from any displayable detail.
    pub fn device(device: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        DaqError::Device {
            device: device.into(),
            detail: detail.to_string(),
        }
    }

    /// True for cooperative cancellation (stop/abort), false for failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DaqError::Canceled)
    }

    /// Short machine-readable kind label, written into error records on disk.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => "ConfigError",
            DaqError::NotFound(_) => "NotFoundError",
            DaqError::NotADirectory(_) => "NotADirectoryError",
            DaqError::NotAFile(_) => "NotAFileError",
            DaqError::AlreadyExists(_) => "AlreadyExists",
            DaqError::CorruptIndex { .. } => "CorruptIndexError",
            DaqError::Deleted(_) => "DeletedError",
            DaqError::DirectoryNotEmpty(_) => "DirectoryNotEmpty",
            DaqError::NoWriter(_) => "NoWriterError",
            DaqError::NoReader(_) => "NoReaderError",
            DaqError::Busy(_) => "Busy",
            DaqError::TriggerMismatch(_) => "TriggerMismatch",
            DaqError::ClockMismatch { .. } => "ClockMismatch",
            DaqError::Timeout(_) => "Timeout",
            DaqError::Canceled => "Canceled",
            DaqError::Device { .. } => "DeviceError",
            DaqError::Parse(_) => "ParseError",
            DaqError::InvalidState(_) => "InvalidState",
            DaqError::Io(_) => "IoError",
            DaqError::Serialization(_) => "SerializationError",
            DaqError::Image(_) => "ImageError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_carries_name_and_detail() {
        let err = DaqError::device("Clamp1", "amplifier offline");
        assert_eq!(err.to_string(), "Device 'Clamp1' error: amplifier offline");
        assert_eq!(err.kind(), "DeviceError");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(DaqError::Canceled.is_cancellation());
        assert!(!DaqError::Timeout(1.0).is_cancellation());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))?;
            Ok(())
        }
        match fails() {
            Err(DaqError::Io(e)) => assert!(e.to_string().contains("disk gone")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
