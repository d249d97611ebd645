//! Integration tests for Task reservation, start ordering and cancellation
//!
//! Uses the mock drivers from `neurodaq::device::mock` with injected faults
//! and a shared start recorder.

use neurodaq::device::mock::{
    Faults, MockCameraConfig, MockCameraDevice, MockWaveformConfig, MockWaveformDevice, StartRecorder,
};
use neurodaq::device::Device;
use neurodaq::protocol::{ProtocolCommand, ProtocolOptions};
use neurodaq::store::{Attributes, DataStore};
use neurodaq::task::TaskState;
use neurodaq::{DaqError, Task};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

type Source = BTreeMap<String, Arc<dyn Device>>;

fn waveform(name: &str, channel: &str) -> Arc<MockWaveformDevice> {
    let config = MockWaveformConfig {
        rate: 1000.0,
        channel: channel.to_string(),
        ..MockWaveformConfig::default()
    };
    Arc::new(MockWaveformDevice::new(name, config).unwrap())
}

fn protocol(duration: f64, devices: &[&str]) -> ProtocolCommand {
    devices.iter().fold(
        ProtocolCommand::new(ProtocolOptions {
            duration,
            ..ProtocolOptions::default()
        }),
        |cmd, name| cmd.with_device(name, json!({"waveform": "pulse(0.001, 0.002, 1.0)"})),
    )
}

// =============================================================================
// Reservation
// =============================================================================

#[tokio::test]
async fn test_failed_reserve_leaves_nothing_reserved() {
    let clamp1 = waveform("Clamp1", "ao0");
    let clamp2 = waveform("Clamp2", "ao1");
    let camera = Arc::new(MockCameraDevice::new("Camera", MockCameraConfig::default()).unwrap());
    camera.set_faults(Faults {
        fail_reserve: true,
        ..Faults::default()
    });

    let mut source = Source::new();
    source.insert("Clamp1".into(), clamp1.clone());
    source.insert("Clamp2".into(), clamp2.clone());
    source.insert("Camera".into(), camera.clone());

    let cmd = protocol(0.01, &["Clamp1", "Clamp2"]).with_device("Camera", json!({"frames": 1}));
    let mut task = Task::new(cmd, &source).unwrap();
    assert!(matches!(task.execute().await, Err(DaqError::Device { .. })));

    assert!(!clamp1.lock().is_reserved());
    assert!(!clamp2.lock().is_reserved());
    assert!(!camera.lock().is_reserved());
    assert_eq!(clamp1.stats().starts(), 0);
    assert_eq!(task.state(), TaskState::Released);
}

#[tokio::test]
async fn test_overlapping_tasks_fail_busy() {
    let clamp = waveform("Clamp1", "ao0");
    let mut source = Source::new();
    source.insert("Clamp1".into(), clamp.clone());

    let mut long = Task::new(protocol(0.2, &["Clamp1"]), &source).unwrap();
    long.configure().await.unwrap();
    long.reserve().await.unwrap();

    let mut short = Task::new(protocol(0.01, &["Clamp1"]), &source).unwrap();
    assert!(matches!(short.execute().await, Err(DaqError::Busy(name)) if name == "Clamp1"));
    assert!(clamp.lock().is_reserved());

    long.teardown(false).await;
    assert!(!clamp.lock().is_reserved());
}

// =============================================================================
// Start Order
// =============================================================================

#[tokio::test]
async fn test_devices_start_in_declared_order() {
    let recorder = StartRecorder::new();
    let mut source = Source::new();
    for (name, channel) in [("A", "ao0"), ("B", "ao1"), ("C", "ao2")] {
        let config = MockWaveformConfig {
            rate: 1000.0,
            channel: channel.to_string(),
            start_delay: 0.005,
            ..MockWaveformConfig::default()
        };
        let device = Arc::new(MockWaveformDevice::new(name, config).unwrap());
        device.set_recorder(recorder.clone());
        source.insert(name.to_string(), device);
    }

    let mut task = Task::new(protocol(0.01, &["A", "B", "C"]), &source).unwrap();
    task.execute().await.unwrap();

    assert_eq!(
        recorder.entries(),
        vec!["A:begin", "A:end", "B:begin", "B:end", "C:begin", "C:end"]
    );
}

#[tokio::test]
async fn test_shared_clock_outputs_are_padded() {
    let mut source = Source::new();
    source.insert("Clamp1".into(), waveform("Clamp1", "ao0"));
    source.insert("Clamp2".into(), waveform("Clamp2", "ao1"));

    let mut task = Task::new(protocol(0.02, &["Clamp1", "Clamp2"]), &source).unwrap();
    let result = task.execute().await.unwrap();
    for name in ["Clamp1", "Clamp2"] {
        assert_eq!(result[name].as_array().unwrap().shape(), &[20]);
    }
    assert_eq!(task.daq().channels().count(), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_abort_releases_within_timeout() {
    let clamp = waveform("Clamp1", "ao0");
    let camera = Arc::new(MockCameraDevice::new("Camera", MockCameraConfig::default()).unwrap());
    let mut source = Source::new();
    source.insert("Clamp1".into(), clamp.clone());
    source.insert("Camera".into(), camera.clone());

    let cmd = protocol(5.0, &["Clamp1"]).with_device("Camera", json!({"frames": 3}));
    let timeout = cmd.protocol.effective_timeout();
    let mut task = Task::new(cmd, &source).unwrap();
    let flag = task.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    assert!(matches!(task.execute().await, Err(DaqError::Canceled)));
    assert!(started.elapsed().as_secs_f64() < timeout);
    assert_eq!(task.state(), TaskState::Released);

    for stats in [clamp.stats(), camera.stats()] {
        assert_eq!(stats.aborts(), 1);
        assert_eq!(stats.releases(), 1);
    }
    assert!(!clamp.lock().is_reserved());
    assert!(!camera.lock().is_reserved());
}

#[tokio::test]
async fn test_start_failure_aborts_peers() {
    let clamp1 = waveform("Clamp1", "ao0");
    let clamp2 = waveform("Clamp2", "ao1");
    clamp2.set_faults(Faults {
        fail_start: true,
        ..Faults::default()
    });
    let mut source = Source::new();
    source.insert("Clamp1".into(), clamp1.clone());
    source.insert("Clamp2".into(), clamp2.clone());

    let mut task = Task::new(protocol(0.01, &["Clamp1", "Clamp2"]), &source).unwrap();
    let err = task.execute().await.unwrap_err();
    assert!(matches!(err, DaqError::Device { ref device, .. } if device == "Clamp2"));
    assert_eq!(clamp1.stats().aborts(), 1);
    assert!(!clamp1.lock().is_reserved());
    assert!(!clamp2.lock().is_reserved());
}

// =============================================================================
// Storage
// =============================================================================

#[tokio::test]
async fn test_store_results_writes_descriptor_and_files() {
    let tmp = tempdir().unwrap();
    let store = DataStore::new();
    let root = store.dir(tmp.path(), true).unwrap();
    let dir = root.mkdir("protocol", true, Attributes::new()).unwrap();

    let mut source = Source::new();
    source.insert("Clamp1".into(), waveform("Clamp1", "ao0"));
    source.insert(
        "Camera".into(),
        Arc::new(MockCameraDevice::new("Camera", MockCameraConfig::default()).unwrap()),
    );
    let cmd = protocol(0.01, &["Clamp1"]).with_device("Camera", json!({"frames": 2}));
    let mut task = Task::new(cmd, &source).unwrap();
    task.configure().await.unwrap();
    task.reserve().await.unwrap();
    task.start().await.unwrap();
    task.wait().await.unwrap();
    task.store_results(&dir).await.unwrap();
    task.release().await.unwrap();

    let names = dir.ls().unwrap();
    assert!(names.contains(&"Clamp1.ma".to_string()));
    assert!(names.contains(&"Camera".to_string()));
    let info = dir.info().unwrap();
    assert_eq!(info["protocol"]["duration"], json!(0.01));
    assert!(info.contains_key("Clamp1"));
    assert!(!info.contains_key("storageErrors"));
}
