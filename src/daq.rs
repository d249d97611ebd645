//! DAQ coordinator: shared clock domains for one Task.
//!
//! Device tasks register their analog and digital channels here during
//! `create_channels`. A channel path has the form `domain/channel`
//! (e.g. `DAQ/ao0`); every channel on one domain shares that domain's sample
//! clock. Registering a channel at a different rate than the domain already
//! runs at is a [`DaqError::ClockMismatch`].
//!
//! Once every device has registered, [`DaqTask::finalize`] pads each output
//! waveform on a domain to the domain's longest channel by repeating its
//! final sample, and fixes the number of samples acquired on every input
//! channel. After that the buffers are read back with [`DaqTask::output`].
//!
//! Exactly one device may be the trigger source (it emits the hardware start
//! edge; the others arm first and wait for it).

use crate::data::{ArrayData, Dtype};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signal direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Host reads samples
    Input,
    /// Host drives samples
    Output,
}

/// A channel registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    /// `domain/channel`
    pub path: String,
    /// Input or output
    pub direction: Direction,
    /// Requested sample rate in Hz
    pub rate: f64,
    /// Samples requested (outputs: the waveform length)
    pub samples: usize,
    /// Output samples
    pub waveform: Option<Vec<f64>>,
    /// Hardware sample type
    pub dtype: Dtype,
}

impl ChannelRequest {
    /// Output channel driving `waveform`.
    pub fn output(path: &str, rate: f64, waveform: Vec<f64>) -> Self {
        Self {
            path: path.to_string(),
            direction: Direction::Output,
            rate,
            samples: waveform.len(),
            waveform: Some(waveform),
            dtype: Dtype::F64,
        }
    }

    /// Input channel acquiring `samples` samples.
    pub fn input(path: &str, rate: f64, samples: usize) -> Self {
        Self {
            path: path.to_string(),
            direction: Direction::Input,
            rate,
            samples,
            waveform: None,
            dtype: Dtype::F64,
        }
    }

    /// Set the hardware sample type.
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }
}

/// One hardware clock shared by several channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockDomain {
    /// Sample rate in Hz
    pub rate: f64,
    /// Samples per channel (final after [`DaqTask::finalize`])
    pub samples: usize,
}

#[derive(Debug, Clone)]
struct Channel {
    owner: String,
    request: ChannelRequest,
    domain: String,
}

/// Channel aggregation for one Task.
#[derive(Debug, Default)]
pub struct DaqTask {
    channels: Vec<Channel>,
    domains: BTreeMap<String, ClockDomain>,
    trigger_device: Option<String>,
    finalized: bool,
}

fn domain_of(path: &str) -> &str {
    path.split_once('/').map_or(path, |(domain, _)| domain)
}

fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

impl DaqTask {
    /// Empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel on behalf of device `owner`.
    pub fn add_channel(&mut self, owner: &str, request: ChannelRequest) -> AppResult<()> {
        if self.finalized {
            return Err(DaqError::InvalidState(format!(
                "cannot add channel {} after channels were finalized",
                request.path
            )));
        }
        if !(request.rate.is_finite() && request.rate > 0.0) {
            return Err(DaqError::device(
                owner,
                format!("invalid sample rate {} for {}", request.rate, request.path),
            ));
        }
        if self.channels.iter().any(|c| c.request.path == request.path) {
            return Err(DaqError::InvalidState(format!(
                "channel {} is already registered",
                request.path
            )));
        }

        let domain = domain_of(&request.path).to_string();
        match self.domains.get_mut(&domain) {
            Some(clock) if !same_rate(clock.rate, request.rate) => {
                return Err(DaqError::ClockMismatch {
                    domain,
                    existing: clock.rate,
                    requested: request.rate,
                });
            }
            Some(clock) => clock.samples = clock.samples.max(request.samples),
            None => {
                self.domains.insert(
                    domain.clone(),
                    ClockDomain {
                        rate: request.rate,
                        samples: request.samples,
                    },
                );
            }
        }

        tracing::debug!(
            device = owner,
            channel = %request.path,
            direction = ?request.direction,
            rate = request.rate,
            samples = request.samples,
            "Registered DAQ channel"
        );
        self.channels.push(Channel {
            owner: owner.to_string(),
            request,
            domain,
        });
        Ok(())
    }

    /// Sample rate of the domain a channel path belongs to, if the domain
    /// has any channel registered. Usable before `finalize`.
    pub fn chan_sample_rate(&self, path: &str) -> Option<f64> {
        self.domains.get(domain_of(path)).map(|d| d.rate)
    }

    /// Clock domain by name.
    pub fn domain(&self, name: &str) -> Option<&ClockDomain> {
        self.domains.get(name)
    }

    /// Designate the device that emits the start edge.
    pub fn set_trigger_device(&mut self, device: &str) -> AppResult<()> {
        match &self.trigger_device {
            Some(existing) if existing != device => Err(DaqError::TriggerMismatch(format!(
                "both '{}' and '{}' claim to trigger the task",
                existing, device
            ))),
            _ => {
                self.trigger_device = Some(device.to_string());
                Ok(())
            }
        }
    }

    /// The designated trigger device.
    pub fn trigger_device(&self) -> Option<&str> {
        self.trigger_device.as_deref()
    }

    /// Registered channel paths, in registration order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.request.path.as_str())
    }

    /// Channel paths registered by `owner`.
    pub fn channels_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.channels
            .iter()
            .filter(move |c| c.owner == owner)
            .map(|c| c.request.path.as_str())
    }

    /// True when no channel has been registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// True once [`finalize`](Self::finalize) has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Pad every output waveform to its domain length by repeating the final
    /// sample. Idempotent.
    pub fn finalize(&mut self) -> AppResult<()> {
        if self.finalized {
            return Ok(());
        }
        for channel in &mut self.channels {
            let Some(clock) = self.domains.get(&channel.domain) else {
                continue;
            };
            if let Some(waveform) = channel.request.waveform.as_mut() {
                let fill = waveform.last().copied().unwrap_or(0.0);
                waveform.resize(clock.samples, fill);
            }
            channel.request.samples = clock.samples;
        }
        self.finalized = true;
        Ok(())
    }

    /// Final number of samples on a channel's domain.
    pub fn samples(&self, path: &str) -> Option<usize> {
        self.domains.get(domain_of(path)).map(|d| d.samples)
    }

    /// Padded output waveform as 64-bit samples.
    pub fn output_f64(&self, path: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .find(|c| c.request.path == path)
            .and_then(|c| c.request.waveform.as_deref())
    }

    /// Padded output waveform cast to the channel's dtype.
    pub fn output(&self, path: &str) -> Option<ArrayData> {
        let channel = self.channels.iter().find(|c| c.request.path == path)?;
        let waveform = channel.request.waveform.as_deref()?;
        Some(ArrayData::from_f64(waveform, channel.request.dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_outputs_with_last_sample() {
        let mut daq = DaqTask::new();
        daq.add_channel("Clamp1", ChannelRequest::output("DAQ/ao0", 1000.0, vec![0.0, 1.0]))
            .unwrap();
        daq.add_channel("Clamp2", ChannelRequest::output("DAQ/ao1", 1000.0, vec![0.5; 4]))
            .unwrap();
        daq.add_channel("Clamp1", ChannelRequest::input("DAQ/ai0", 1000.0, 3))
            .unwrap();
        daq.finalize().unwrap();

        assert_eq!(daq.output_f64("DAQ/ao0").unwrap(), &[0.0, 1.0, 1.0, 1.0]);
        assert_eq!(daq.samples("DAQ/ai0"), Some(4));
        assert_eq!(daq.channels_of("Clamp1").count(), 2);
        assert!(daq.add_channel("X", ChannelRequest::input("DAQ/ai1", 1000.0, 1)).is_err());
    }

    #[test]
    fn rate_disagreement_is_clock_mismatch() {
        let mut daq = DaqTask::new();
        daq.add_channel("A", ChannelRequest::input("DAQ/ai0", 10_000.0, 10))
            .unwrap();
        let err = daq
            .add_channel("B", ChannelRequest::output("DAQ/ao0", 20_000.0, vec![0.0]))
            .unwrap_err();
        assert!(matches!(err, DaqError::ClockMismatch { .. }));

        // other domains keep their own clock
        daq.add_channel("B", ChannelRequest::output("DAQ2/ao0", 20_000.0, vec![0.0]))
            .unwrap();
        assert_eq!(daq.chan_sample_rate("DAQ/ai7"), Some(10_000.0));
        assert_eq!(daq.chan_sample_rate("DAQ2/ao0"), Some(20_000.0));
    }

    #[test]
    fn one_trigger_device() {
        let mut daq = DaqTask::new();
        daq.set_trigger_device("Camera").unwrap();
        daq.set_trigger_device("Camera").unwrap();
        assert!(matches!(
            daq.set_trigger_device("Laser"),
            Err(DaqError::TriggerMismatch(_))
        ));
        assert_eq!(daq.trigger_device(), Some("Camera"));
    }

    #[test]
    fn outputs_cast_to_dtype() {
        let mut daq = DaqTask::new();
        daq.add_channel(
            "Stim",
            ChannelRequest::output("DAQ/ao0", 100.0, vec![1.4, 70_000.0]).with_dtype(Dtype::U16),
        )
        .unwrap();
        daq.finalize().unwrap();
        assert_eq!(daq.output("DAQ/ao0"), Some(ArrayData::U16(vec![1, u16::MAX])));
    }
}
