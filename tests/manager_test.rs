//! Integration tests for Manager construction, modules and shutdown

use neurodaq::device::mock::{Faults, MockWaveformConfig, MockWaveformDevice};
use neurodaq::manager::ManagerEvent;
use neurodaq::protocol::{RunnerEvent, SequenceParam};
use neurodaq::{DaqError, Manager, ManagerConfig, TaskRunnerModule};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const RIG: &str = r#"
storage_dir = "data"
protocol_dir = "protocols"

[devices.Clamp1]
driver = "MockWaveform"
config = { rate = 2000.0, channel = "ao0" }

[devices.Camera]
driver = "MockCamera"
config = { width = 8, height = 8 }

[modules.Runner]
module = "TaskRunner"
"#;

fn write_rig(dir: &Path) -> ManagerConfig {
    let text = RIG
        .replace("\"data\"", &format!("{:?}", dir.join("data")))
        .replace("\"protocols\"", &format!("{:?}", dir.join("protocols")));
    let path = dir.join("rig.toml");
    std::fs::write(&path, text).unwrap();
    ManagerConfig::load_from(&path).unwrap()
}

fn mock(name: &str, channel: &str) -> Arc<MockWaveformDevice> {
    let config = MockWaveformConfig {
        channel: channel.to_string(),
        ..MockWaveformConfig::default()
    };
    Arc::new(MockWaveformDevice::new(name, config).unwrap())
}

#[tokio::test]
async fn test_manager_from_toml() {
    let tmp = tempdir().unwrap();
    let manager = Manager::new(write_rig(tmp.path())).await.unwrap();

    assert_eq!(manager.list_devices(), vec!["Camera", "Clamp1"]);
    assert_eq!(manager.list_modules(), vec!["Runner"]);
    assert_eq!(manager.base_dir().path(), tmp.path().join("data"));
    assert_eq!(
        manager.get_device("Clamp1").unwrap().get_param("rate").unwrap(),
        serde_json::json!(2000.0)
    );
    manager.quit().await;
}

#[tokio::test]
async fn test_quit_twice_shuts_devices_down_once() {
    let tmp = tempdir().unwrap();
    let clamp1 = mock("Clamp1", "ao0");
    let clamp2 = mock("Clamp2", "ao1");
    let manager = Manager::builder(write_rig(tmp.path()).without_devices())
        .device(clamp1.clone())
        .device(clamp2.clone())
        .build()
        .await
        .unwrap();

    manager.quit().await;
    manager.quit().await;

    assert!(manager.is_shut_down());
    assert_eq!(clamp1.stats().shutdowns(), 1);
    assert_eq!(clamp2.stats().shutdowns(), 1);
}

#[tokio::test]
async fn test_failing_device_does_not_block_shutdown() {
    let tmp = tempdir().unwrap();
    let clamp1 = mock("Clamp1", "ao0");
    let clamp2 = mock("Clamp2", "ao1");
    clamp2.set_faults(Faults {
        fail_shutdown: true,
        ..Faults::default()
    });
    let manager = Manager::builder(write_rig(tmp.path()).without_devices())
        .device(clamp1.clone())
        .device(clamp2.clone())
        .build()
        .await
        .unwrap();

    manager.quit().await;
    assert_eq!(clamp1.stats().shutdowns(), 1);
    assert_eq!(clamp2.stats().shutdowns(), 1);
}

#[tokio::test]
async fn test_runner_module_sequence_under_current_dir() {
    let tmp = tempdir().unwrap();
    let config = write_rig(tmp.path());
    std::fs::create_dir_all(&config.protocol_dir).unwrap();
    std::fs::write(
        config.protocol_dir.join("steps.json"),
        r#"{"protocol": {"duration": 0.005, "storeData": true}, "Clamp1": {"waveform": "steps(0, 0.001, amp, 0)"}}"#,
    )
    .unwrap();

    let manager = Manager::new(config).await.unwrap();
    let mut manager_events = manager.subscribe();
    let cell = manager
        .base_dir()
        .mkdir("cell", true, Default::default())
        .unwrap();
    manager.set_current_dir(cell.clone());
    assert_eq!(
        manager_events.recv().await.unwrap(),
        ManagerEvent::CurrentDirChanged(cell.path())
    );

    let module: Arc<TaskRunnerModule> = manager.get_module_as("Runner").unwrap();
    module.set_protocol(manager.load_protocol("steps").unwrap());
    let mut events = module.runner().subscribe();
    module
        .run_sequence(vec![SequenceParam::parse("Clamp1.amp = 0 ; [1, 2, 3]", 0).unwrap()])
        .unwrap();

    let mut frames = 0;
    loop {
        match events.recv().await.unwrap() {
            RunnerEvent::NewFrame(_) => frames += 1,
            RunnerEvent::Finished { completed } => {
                assert!(completed);
                break;
            }
            RunnerEvent::ExitFromError { error } => panic!("sequence failed: {}", error),
            _ => {}
        }
    }
    module.runner().wait().await.unwrap();
    assert_eq!(frames, 3);
    assert_eq!(cell.ls().unwrap(), vec!["protocol_000"]);
    let parent = cell.get_dir("protocol_000", false).unwrap();
    assert_eq!(parent.ls().unwrap(), vec!["000", "001", "002"]);

    manager.quit().await;
}

#[tokio::test]
async fn test_missing_protocol_file() {
    let tmp = tempdir().unwrap();
    let manager = Manager::new(write_rig(tmp.path())).await.unwrap();
    assert!(matches!(manager.load_protocol("absent"), Err(DaqError::NotFound(_))));
    manager.quit().await;
}

#[tokio::test]
async fn test_global_install() {
    let tmp = tempdir().unwrap();
    let manager = Manager::new(write_rig(tmp.path())).await.unwrap();
    manager.install().unwrap();
    assert!(Arc::ptr_eq(&Manager::global().unwrap(), &manager));
    assert!(manager.install().is_err());
    manager.quit().await;
}

trait WithoutDevices {
    fn without_devices(self) -> Self;
}

impl WithoutDevices for ManagerConfig {
    fn without_devices(mut self) -> Self {
        self.devices.clear();
        self
    }
}
