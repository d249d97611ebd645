//! Mock devices
//!
//! Simulated instruments for running protocols without hardware.
//! All waiting uses `tokio::time`, never `std::thread::sleep`.
//!
//! # Available Mocks
//!
//! - `MockWaveformDevice` - analog output driven by a stimulus expression
//! - `MockCameraDevice` - camera returning deterministic frames
//!
//! Both count lifecycle calls in [`DeviceStats`] and accept injected
//! [`Faults`], which the Task and Runner tests rely on.

use crate::daq::{ChannelRequest, DaqTask, Direction};
use crate::data::{ArrayData, AxisInfo, ColumnInfo, DataObject, Dtype, ImageData, MetaArray, Pixels};
use crate::device::{
    parse_config, ChannelInfo, Device, DeviceFactory, DeviceLock, DeviceTask, ReservationId,
    TaskContext,
};
use crate::error::{AppResult, DaqError};
use crate::stimulus::{self, Stimulus};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Lifecycle call counters shared between a mock device and its tasks.
#[derive(Debug, Default)]
pub struct DeviceStats {
    tasks: AtomicUsize,
    reserves: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    aborts: AtomicUsize,
    releases: AtomicUsize,
    shutdowns: AtomicUsize,
}

macro_rules! counter {
    ($($field:ident => $doc:literal),* $(,)?) => {
        impl DeviceStats {
            $(
                #[doc = $doc]
                pub fn $field(&self) -> usize {
                    self.$field.load(Ordering::SeqCst)
                }
            )*
        }
    };
}

counter! {
    tasks => "DeviceTasks created",
    reserves => "Successful reservations",
    starts => "Successful starts",
    stops => "`stop` calls",
    aborts => "`stop(abort = true)` calls",
    releases => "`release` calls",
    shutdowns => "`shutdown` calls",
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Failures to inject into a mock device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Faults {
    /// `reserve` fails
    pub fail_reserve: bool,
    /// `start` fails
    pub fail_start: bool,
    /// `get_result` fails
    pub fail_result: bool,
    /// `is_done` never reports completion
    pub never_done: bool,
    /// `shutdown` fails
    pub fail_shutdown: bool,
}

/// Shared log of `start` entry and exit, in call order.
#[derive(Debug, Clone, Default)]
pub struct StartRecorder(Arc<Mutex<Vec<String>>>);

impl StartRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, device: &str, event: &str) {
        self.0.lock().push(format!("{}:{}", device, event));
    }

    /// Entries such as `"Clamp1:begin"`, `"Clamp1:end"`.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// True once `device` has returned from `start`.
    pub fn has_started(&self, device: &str) -> bool {
        let end = format!("{}:end", device);
        self.0.lock().iter().any(|e| *e == end)
    }
}

/// Reservation plus instrumentation shared by both mock task types.
struct MockCore {
    device: String,
    lock: DeviceLock,
    owner: ReservationId,
    stats: Arc<DeviceStats>,
    faults: Faults,
    started: Option<Instant>,
    duration: f64,
    held: bool,
}

impl MockCore {
    fn reserve(&mut self) -> AppResult<()> {
        if self.held {
            return Ok(());
        }
        if self.faults.fail_reserve {
            return Err(DaqError::device(&self.device, "injected reservation failure"));
        }
        self.lock.try_acquire(self.owner)?;
        self.held = true;
        bump(&self.stats.reserves);
        Ok(())
    }

    fn is_done(&self) -> bool {
        if self.faults.never_done {
            return false;
        }
        self.started
            .map_or(false, |t| t.elapsed().as_secs_f64() >= self.duration)
    }

    fn stop(&mut self, abort: bool) {
        bump(&self.stats.stops);
        if abort {
            bump(&self.stats.aborts);
        }
        self.started = None;
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.lock.release(self.owner);
        }
        bump(&self.stats.releases);
    }
}

// =============================================================================
// MockWaveformDevice - analog output
// =============================================================================

/// Configuration of [`MockWaveformDevice`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockWaveformConfig {
    /// Output sample rate in Hz
    pub rate: f64,
    /// Clock domain (DAQ board) name
    pub daq: String,
    /// Output channel on the DAQ board
    pub channel: String,
    /// Optional input channel recorded alongside the output. The mock feeds
    /// the command back as the recorded `primary` signal, and the result
    /// becomes a two-row array with `command` and `primary` columns.
    pub input: Option<String>,
    /// Channel sample type
    pub dtype: Dtype,
    /// Scale applied to the rendered stimulus
    pub gain: f64,
    /// Emit the hardware start edge
    pub trigger: bool,
    /// Time spent inside `start`, in seconds
    pub start_delay: f64,
    /// Injected failures
    pub faults: Faults,
}

impl Default for MockWaveformConfig {
    fn default() -> Self {
        Self {
            rate: 10_000.0,
            daq: "DAQ".to_string(),
            channel: "ao0".to_string(),
            input: None,
            dtype: Dtype::F64,
            gain: 1.0,
            trigger: false,
            start_delay: 0.0,
            faults: Faults::default(),
        }
    }
}

/// Analog output device that plays a stimulus expression.
///
/// Sub-command: `{"waveform": "<expression>", "params": {"amp": 0.5}}`.
/// Numeric device parameters (see [`Device::set_param`]) are visible to the
/// expression and are overridden by the command's `params`. The result is
/// the padded output buffer as a waveform array.
pub struct MockWaveformDevice {
    name: String,
    config: MockWaveformConfig,
    lock: DeviceLock,
    params: Mutex<Map<String, Value>>,
    stats: Arc<DeviceStats>,
    faults: Mutex<Faults>,
    recorder: Mutex<Option<StartRecorder>>,
}

impl MockWaveformDevice {
    /// Device with the given configuration.
    pub fn new(name: &str, config: MockWaveformConfig) -> AppResult<Self> {
        if !(config.rate.is_finite() && config.rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "device '{}': rate must be positive, got {}",
                name, config.rate
            )));
        }
        let faults = config.faults.clone();
        Ok(Self {
            name: name.to_string(),
            config,
            lock: DeviceLock::new(name),
            params: Mutex::new(Map::new()),
            stats: Arc::new(DeviceStats::default()),
            faults: Mutex::new(faults),
            recorder: Mutex::new(None),
        })
    }

    /// Device with default configuration.
    pub fn with_defaults(name: &str) -> AppResult<Self> {
        Self::new(name, MockWaveformConfig::default())
    }

    /// Lifecycle counters.
    pub fn stats(&self) -> Arc<DeviceStats> {
        self.stats.clone()
    }

    /// Replace the injected faults; affects tasks created afterwards.
    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    /// Record `start` entry/exit of tasks created afterwards.
    pub fn set_recorder(&self, recorder: StartRecorder) {
        *self.recorder.lock() = Some(recorder);
    }

    fn channel_path(&self) -> String {
        format!("{}/{}", self.config.daq, self.config.channel)
    }

    fn numeric_params(&self) -> BTreeMap<String, f64> {
        self.params
            .lock()
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
            .collect()
    }
}

#[async_trait]
impl Device for MockWaveformDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &str {
        "MockWaveform"
    }

    fn list_channels(&self) -> BTreeMap<String, ChannelInfo> {
        let mut channels = BTreeMap::new();
        channels.insert(
            "command".to_string(),
            ChannelInfo {
                direction: Direction::Output,
                units: "V".to_string(),
                limits: Some((-10.0, 10.0)),
                dtype: self.config.dtype,
            },
        );
        if self.config.input.is_some() {
            channels.insert(
                "primary".to_string(),
                ChannelInfo {
                    direction: Direction::Input,
                    units: "V".to_string(),
                    limits: Some((-10.0, 10.0)),
                    dtype: Dtype::F64,
                },
            );
        }
        channels
    }

    fn get_param(&self, name: &str) -> AppResult<Value> {
        match name {
            "rate" => Ok(Value::from(self.config.rate)),
            "gain" => Ok(Value::from(self.config.gain)),
            _ => self
                .params
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| DaqError::device(&self.name, format!("unknown parameter '{}'", name))),
        }
    }

    async fn set_param(&self, name: &str, value: Value, auto_restart: bool) -> AppResult<()> {
        if matches!(name, "rate" | "gain") {
            return Err(DaqError::device(
                &self.name,
                format!("parameter '{}' is fixed by configuration", name),
            ));
        }
        tracing::debug!(device = %self.name, param = name, %value, auto_restart, "Set parameter");
        self.params.lock().insert(name.to_string(), value);
        Ok(())
    }

    fn create_task(&self, cmd: &Value, ctx: &TaskContext) -> AppResult<Box<dyn DeviceTask>> {
        let stimulus = match cmd.get("waveform") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(
                Stimulus::parse(text).map_err(|e| DaqError::device(&self.name, e))?,
            ),
            Some(other) => {
                return Err(DaqError::device(
                    &self.name,
                    format!("waveform must be an expression string, got {}", other),
                ))
            }
        };
        let mut params = self.numeric_params();
        if let Some(overrides) = cmd.get("params").and_then(Value::as_object) {
            for (k, v) in overrides {
                let v = v.as_f64().ok_or_else(|| {
                    DaqError::device(&self.name, format!("parameter '{}' is not a number", k))
                })?;
                params.insert(k.clone(), v);
            }
        }

        bump(&self.stats.tasks);
        Ok(Box::new(MockWaveformTask {
            core: MockCore {
                device: self.name.clone(),
                lock: self.lock.clone(),
                owner: ctx.owner,
                stats: self.stats.clone(),
                faults: self.faults.lock().clone(),
                started: None,
                duration: ctx.duration,
                held: false,
            },
            config: self.config.clone(),
            path: self.channel_path(),
            stimulus,
            params,
            recorder: self.recorder.lock().clone(),
            output: None,
        }))
    }

    fn lock(&self) -> &DeviceLock {
        &self.lock
    }

    async fn shutdown(&self) -> AppResult<()> {
        bump(&self.stats.shutdowns);
        if self.faults.lock().fail_shutdown {
            return Err(DaqError::device(&self.name, "injected shutdown failure"));
        }
        tracing::info!(device = %self.name, "Mock waveform device shut down");
        Ok(())
    }
}

struct MockWaveformTask {
    core: MockCore,
    config: MockWaveformConfig,
    path: String,
    stimulus: Option<Stimulus>,
    params: BTreeMap<String, f64>,
    recorder: Option<StartRecorder>,
    output: Option<Vec<f64>>,
}

#[async_trait]
impl DeviceTask for MockWaveformTask {
    fn device_name(&self) -> &str {
        &self.core.device
    }

    async fn reserve(&mut self) -> AppResult<()> {
        self.core.reserve()
    }

    fn is_trigger_source(&self) -> bool {
        self.config.trigger
    }

    async fn create_channels(&mut self, daq: &mut DaqTask) -> AppResult<()> {
        let samples = match &self.stimulus {
            Some(stimulus) => stimulus
                .render(self.core.duration, self.config.rate, &self.params)
                .map_err(|e| DaqError::device(&self.core.device, e))?,
            None => vec![0.0; Stimulus::sample_count(self.core.duration, self.config.rate)?],
        };
        let samples: Vec<f64> = samples.into_iter().map(|v| v * self.config.gain).collect();
        let n = samples.len();
        daq.add_channel(
            &self.core.device,
            ChannelRequest::output(&self.path, self.config.rate, samples).with_dtype(self.config.dtype),
        )?;
        if let Some(input) = &self.config.input {
            let path = format!("{}/{}", self.config.daq, input);
            daq.add_channel(&self.core.device, ChannelRequest::input(&path, self.config.rate, n))?;
        }
        Ok(())
    }

    async fn start(&mut self, daq: &DaqTask) -> AppResult<()> {
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.core.device, "begin");
        }
        if self.core.faults.fail_start {
            return Err(DaqError::device(&self.core.device, "injected start failure"));
        }
        let output = daq
            .output_f64(&self.path)
            .ok_or_else(|| DaqError::device(&self.core.device, "output channel was not registered"))?;
        self.output = Some(output.to_vec());
        if self.config.start_delay > 0.0 {
            sleep(Duration::from_secs_f64(self.config.start_delay)).await;
        }
        self.core.started = Some(Instant::now());
        bump(&self.core.stats.starts);
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.core.device, "end");
        }
        Ok(())
    }

    async fn is_done(&mut self) -> AppResult<bool> {
        Ok(self.core.is_done())
    }

    async fn get_result(&mut self) -> AppResult<Option<DataObject>> {
        if self.core.faults.fail_result {
            return Err(DaqError::device(&self.core.device, "injected result failure"));
        }
        let Some(output) = &self.output else {
            return Ok(None);
        };
        let mut array = match &self.config.input {
            None => MetaArray::waveform(stimulus::cast(output, self.config.dtype), self.config.rate),
            Some(_) => {
                let rows = [output.as_slice(), output.as_slice()].concat();
                let cols = ["command", "primary"]
                    .iter()
                    .map(|name| ColumnInfo {
                        name: name.to_string(),
                        units: Some("V".to_string()),
                    })
                    .collect();
                MetaArray::new(ArrayData::F64(rows), vec![2, output.len()])?
                    .with_axis(0, AxisInfo::named("Channel").with_cols(cols))?
                    .with_axis(1, AxisInfo::named("Time").with_units("s"))?
                    .with_attr("rate", self.config.rate)
            }
        }
        .with_attr("device", self.core.device.as_str())
        .with_attr("channel", self.path.as_str());
        if let Some(input) = &self.config.input {
            array = array.with_attr("input", format!("{}/{}", self.config.daq, input));
        }
        if let Some(stimulus) = &self.stimulus {
            array = array.with_attr("waveform", stimulus.text());
        }
        Ok(Some(DataObject::Array(array)))
    }

    async fn stop(&mut self, abort: bool) -> AppResult<()> {
        self.core.stop(abort);
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        self.core.release();
        Ok(())
    }
}

/// Factory for [`MockWaveformDevice`] (driver type `MockWaveform`).
pub struct MockWaveformFactory;

impl DeviceFactory for MockWaveformFactory {
    fn driver_type(&self) -> &'static str {
        "MockWaveform"
    }

    fn validate(&self, config: &Value) -> AppResult<()> {
        parse_config::<MockWaveformConfig>("MockWaveform", config).map(|_| ())
    }

    fn build(&self, name: String, config: Value) -> BoxFuture<'static, AppResult<Arc<dyn Device>>> {
        Box::pin(async move {
            let config = parse_config::<MockWaveformConfig>(&name, &config)?;
            let device = MockWaveformDevice::new(&name, config)?;
            Ok(Arc::new(device) as Arc<dyn Device>)
        })
    }
}

// =============================================================================
// MockCameraDevice - frame producer
// =============================================================================

/// Configuration of [`MockCameraDevice`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockCameraConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Physical pixel size in meters
    pub pixel_size: f64,
    /// Exposure in seconds
    pub exposure: f64,
    /// Emit the hardware start edge
    pub trigger: bool,
    /// Injected failures
    pub faults: Faults,
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            pixel_size: 1e-6,
            exposure: 0.01,
            trigger: false,
            faults: Faults::default(),
        }
    }
}

/// Camera returning deterministic 16-bit frames.
///
/// Sub-command: `{"frames": 2}` (default 1). The result is a group holding
/// one image per frame (`frame_000`, ...) and an `info` mapping.
pub struct MockCameraDevice {
    name: String,
    config: MockCameraConfig,
    lock: DeviceLock,
    exposure: Mutex<f64>,
    stats: Arc<DeviceStats>,
    faults: Mutex<Faults>,
}

impl MockCameraDevice {
    /// Camera with the given configuration.
    pub fn new(name: &str, config: MockCameraConfig) -> AppResult<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(DaqError::Configuration(format!(
                "device '{}': frame size must be non-zero",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            lock: DeviceLock::new(name),
            exposure: Mutex::new(config.exposure),
            stats: Arc::new(DeviceStats::default()),
            faults: Mutex::new(config.faults.clone()),
            config,
        })
    }

    /// Lifecycle counters.
    pub fn stats(&self) -> Arc<DeviceStats> {
        self.stats.clone()
    }

    /// Replace the injected faults; affects tasks created afterwards.
    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }
}

#[async_trait]
impl Device for MockCameraDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &str {
        "MockCamera"
    }

    fn list_channels(&self) -> BTreeMap<String, ChannelInfo> {
        let mut channels = BTreeMap::new();
        channels.insert(
            "frames".to_string(),
            ChannelInfo {
                direction: Direction::Input,
                units: "counts".to_string(),
                limits: Some((0.0, f64::from(u16::MAX))),
                dtype: Dtype::U16,
            },
        );
        channels
    }

    fn get_param(&self, name: &str) -> AppResult<Value> {
        match name {
            "exposure" => Ok(Value::from(*self.exposure.lock())),
            "width" => Ok(Value::from(self.config.width)),
            "height" => Ok(Value::from(self.config.height)),
            _ => Err(DaqError::device(&self.name, format!("unknown parameter '{}'", name))),
        }
    }

    async fn set_param(&self, name: &str, value: Value, auto_restart: bool) -> AppResult<()> {
        match (name, value.as_f64()) {
            ("exposure", Some(seconds)) if seconds > 0.0 => {
                *self.exposure.lock() = seconds;
                tracing::debug!(device = %self.name, seconds, auto_restart, "Exposure changed");
                Ok(())
            }
            _ => Err(DaqError::device(
                &self.name,
                format!("cannot set '{}' to {}", name, value),
            )),
        }
    }

    fn create_task(&self, cmd: &Value, ctx: &TaskContext) -> AppResult<Box<dyn DeviceTask>> {
        let frames = match cmd.get("frames") {
            None | Some(Value::Null) => 1,
            Some(v) => v.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                DaqError::device(&self.name, format!("frames must be a positive integer, got {}", v))
            })? as usize,
        };
        bump(&self.stats.tasks);
        Ok(Box::new(MockCameraTask {
            core: MockCore {
                device: self.name.clone(),
                lock: self.lock.clone(),
                owner: ctx.owner,
                stats: self.stats.clone(),
                faults: self.faults.lock().clone(),
                started: None,
                duration: ctx.duration,
                held: false,
            },
            config: self.config.clone(),
            exposure: *self.exposure.lock(),
            frames,
            acquired: false,
        }))
    }

    fn lock(&self) -> &DeviceLock {
        &self.lock
    }

    async fn shutdown(&self) -> AppResult<()> {
        bump(&self.stats.shutdowns);
        if self.faults.lock().fail_shutdown {
            return Err(DaqError::device(&self.name, "injected shutdown failure"));
        }
        tracing::info!(device = %self.name, "Mock camera shut down");
        Ok(())
    }
}

struct MockCameraTask {
    core: MockCore,
    config: MockCameraConfig,
    exposure: f64,
    frames: usize,
    acquired: bool,
}

impl MockCameraTask {
    fn frame(&self, index: usize) -> AppResult<ImageData> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let pixels = (0..w * h)
            .map(|i| ((i % w) + (i / w) * 3 + index * 7) as u16 % 4096)
            .collect();
        let mut image = ImageData::new(self.config.width, self.config.height, Pixels::Gray16(pixels))?
            .with_pixel_size(self.config.pixel_size, self.config.pixel_size)
            .with_position(0.0, 0.0);
        image.attrs.insert("frame".to_string(), Value::from(index));
        image.attrs.insert("exposure".to_string(), Value::from(self.exposure));
        Ok(image)
    }
}

#[async_trait]
impl DeviceTask for MockCameraTask {
    fn device_name(&self) -> &str {
        &self.core.device
    }

    async fn reserve(&mut self) -> AppResult<()> {
        self.core.reserve()
    }

    fn is_trigger_source(&self) -> bool {
        self.config.trigger
    }

    async fn start(&mut self, _daq: &DaqTask) -> AppResult<()> {
        if self.core.faults.fail_start {
            return Err(DaqError::device(&self.core.device, "injected start failure"));
        }
        self.core.started = Some(Instant::now());
        self.acquired = true;
        bump(&self.core.stats.starts);
        Ok(())
    }

    async fn is_done(&mut self) -> AppResult<bool> {
        Ok(self.core.is_done())
    }

    async fn get_result(&mut self) -> AppResult<Option<DataObject>> {
        if self.core.faults.fail_result {
            return Err(DaqError::device(&self.core.device, "injected result failure"));
        }
        if !self.acquired {
            return Ok(None);
        }
        let mut group = BTreeMap::new();
        for index in 0..self.frames {
            group.insert(format!("frame_{:03}", index), DataObject::Image(self.frame(index)?));
        }
        let mut info = Map::new();
        info.insert("frames".to_string(), Value::from(self.frames));
        info.insert("exposure".to_string(), Value::from(self.exposure));
        info.insert("triggered".to_string(), Value::from(self.config.trigger));
        group.insert("info".to_string(), DataObject::Mapping(info));
        Ok(Some(DataObject::Group(group)))
    }

    async fn stop(&mut self, abort: bool) -> AppResult<()> {
        self.core.stop(abort);
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        self.core.release();
        Ok(())
    }
}

/// Factory for [`MockCameraDevice`] (driver type `MockCamera`).
pub struct MockCameraFactory;

impl DeviceFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        "MockCamera"
    }

    fn validate(&self, config: &Value) -> AppResult<()> {
        parse_config::<MockCameraConfig>("MockCamera", config).map(|_| ())
    }

    fn build(&self, name: String, config: Value) -> BoxFuture<'static, AppResult<Arc<dyn Device>>> {
        Box::pin(async move {
            let config = parse_config::<MockCameraConfig>(&name, &config)?;
            let device = MockCameraDevice::new(&name, config)?;
            Ok(Arc::new(device) as Arc<dyn Device>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(duration: f64) -> TaskContext {
        TaskContext {
            duration,
            owner: ReservationId::next(),
        }
    }

    #[tokio::test]
    async fn test_waveform_task_lifecycle() {
        let device = MockWaveformDevice::with_defaults("Clamp1").unwrap();
        let cmd = json!({"waveform": "pulse(0.002, 0.001, amp)", "params": {"amp": 2.0}});
        let mut task = device.create_task(&cmd, &ctx(0.01)).unwrap();

        task.reserve().await.unwrap();
        assert!(device.lock().is_reserved());

        let mut daq = DaqTask::new();
        task.create_channels(&mut daq).await.unwrap();
        daq.finalize().unwrap();
        task.start(&daq).await.unwrap();
        while !task.is_done().await.unwrap() {
            sleep(Duration::from_millis(1)).await;
        }

        let result = task.get_result().await.unwrap().unwrap();
        let array = result.as_array().unwrap();
        assert_eq!(array.shape(), &[100]);
        let samples = array.data().to_f64_vec();
        assert_eq!(samples[20], 2.0);
        assert_eq!(samples[30], 0.0);

        task.stop(false).await.unwrap();
        task.release().await.unwrap();
        assert!(!device.lock().is_reserved());
        let stats = device.stats();
        assert_eq!((stats.tasks(), stats.starts(), stats.releases()), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_input_channel_is_recorded() {
        let config = MockWaveformConfig {
            rate: 1000.0,
            input: Some("ai0".to_string()),
            ..MockWaveformConfig::default()
        };
        let device = MockWaveformDevice::new("Clamp1", config).unwrap();
        assert!(device.list_channels().contains_key("primary"));
        let mut task = device.create_task(&json!({"waveform": "0.5"}), &ctx(0.005)).unwrap();

        let mut daq = DaqTask::new();
        task.create_channels(&mut daq).await.unwrap();
        assert_eq!(daq.channels_of("Clamp1").count(), 2);
        daq.finalize().unwrap();
        task.start(&daq).await.unwrap();
        while !task.is_done().await.unwrap() {
            sleep(Duration::from_millis(1)).await;
        }

        let result = task.get_result().await.unwrap().unwrap();
        let array = result.as_array().unwrap();
        assert_eq!(array.shape(), &[2, 5]);
        let cols = array.axes()[0].cols.as_ref().unwrap();
        assert_eq!(cols[1].name, "primary");
        assert_eq!(array.attrs["input"], json!("DAQ/ai0"));
        assert_eq!(array.data().to_f64_vec(), vec![0.5; 10]);
        task.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_params_feed_expression() {
        let device = MockWaveformDevice::with_defaults("Stim").unwrap();
        device.set_param("level", json!(0.25), false).await.unwrap();
        assert_eq!(device.get_param("level").unwrap(), json!(0.25));
        assert!(device.set_param("rate", json!(1.0), false).await.is_err());

        let mut task = device.create_task(&json!({"waveform": "level"}), &ctx(0.001)).unwrap();
        let mut daq = DaqTask::new();
        task.create_channels(&mut daq).await.unwrap();
        assert_eq!(daq.output_f64("DAQ/ao0").unwrap(), &[0.25; 10]);
    }

    #[tokio::test]
    async fn test_bad_waveform_is_device_error() {
        let device = MockWaveformDevice::with_defaults("Stim").unwrap();
        let err = device
            .create_task(&json!({"waveform": "pulse(0,"}), &ctx(0.01))
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Device { device, .. } if device == "Stim"));
    }

    #[tokio::test]
    async fn test_injected_reserve_failure() {
        let device = MockWaveformDevice::with_defaults("Stim").unwrap();
        device.set_faults(Faults {
            fail_reserve: true,
            ..Faults::default()
        });
        let mut task = device.create_task(&json!({}), &ctx(0.01)).unwrap();
        assert!(task.reserve().await.is_err());
        assert!(!device.lock().is_reserved());
    }

    #[tokio::test]
    async fn test_camera_frames() {
        let camera = MockCameraDevice::new(
            "Camera",
            MockCameraConfig {
                width: 4,
                height: 3,
                ..MockCameraConfig::default()
            },
        )
        .unwrap();
        let mut task = camera.create_task(&json!({"frames": 2}), &ctx(0.0)).unwrap();
        task.reserve().await.unwrap();
        task.start(&DaqTask::new()).await.unwrap();
        assert!(task.is_done().await.unwrap());

        let Some(DataObject::Group(group)) = task.get_result().await.unwrap() else {
            panic!("camera should return a group");
        };
        assert_eq!(
            group.keys().collect::<Vec<_>>(),
            vec!["frame_000", "frame_001", "info"]
        );
        let frame = group["frame_001"].as_image().unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.pixel_size, Some([1e-6, 1e-6]));
    }

    #[tokio::test]
    async fn test_factory_builds_from_config() {
        let device = MockWaveformFactory
            .build("Clamp2".to_string(), json!({"rate": 20000.0, "channel": "ao1"}))
            .await
            .unwrap();
        assert_eq!(device.name(), "Clamp2");
        assert_eq!(device.get_param("rate").unwrap(), json!(20000.0));
        assert!(MockCameraFactory.validate(&json!({"width": "wide"})).is_err());
    }
}
