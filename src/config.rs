//! Runtime configuration
//!
//! [`Config`] is what the user writes (TOML, every field optional). Once the device is
//! connected and its metadata read, it is resolved into a [`StreamConfig`]: the single
//! value every pipeline stage is built from.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    batch::BatchAnchor,
    codec::{ByteOrder, Codec, Framing},
    error::{Error, Result},
    filter::FilterKernel,
    metadata::{microvolts_per_count, DeviceMetadata, FrontEnd, LoadCellCalibration, MAX_GAIN},
    tare::TareConfig,
    CHANNELS,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub framing: Option<Framing>,
    /// Overrides the framing's usual channel field byte order
    pub sample_order: Option<ByteOrder>,
    /// Overrides the framing's usual sequence/status byte order
    pub word_order: Option<ByteOrder>,
}

impl ProtocolConfig {
    pub fn codec(&self) -> Codec {
        let base = match self.framing.unwrap_or(Framing::Header) {
            Framing::Header => Codec::header(),
            Framing::Legacy => Codec::legacy(),
        };
        Codec {
            sample_order: self.sample_order.unwrap_or(base.sample_order),
            word_order: self.word_order.unwrap_or(base.word_order),
            ..base
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub cutoff_hz: f64,
    pub taps: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cutoff_hz: 5.0,
            taps: 101,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub window_ms: u64,
    pub anchor: BatchAnchor,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 300,
            anchor: BatchAnchor::FromFlush,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Longest wait for the next packet before checking for shutdown
    pub recv_timeout_ms: u64,
    /// Replay pace, defaults to the device sample rate
    pub replay_rate_hz: Option<f64>,
    pub replay_chunk: usize,
    /// Capacity of the queue between source and pipeline
    pub queue_capacity: usize,
    pub stats_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 500,
            replay_rate_hz: None,
            replay_chunk: 100,
            queue_capacity: 1024,
            stats_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
    /// Used when the device metadata can't be read
    pub device: DeviceMetadata,
    pub front_end: FrontEnd,
    pub filter: FilterConfig,
    pub tare: TareConfig,
    pub batch: BatchConfig,
    pub ingest: IngestConfig,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Fix every parameter against what the device reported. `device` of `None` falls
    /// back to the configured defaults.
    pub fn resolve(&self, device: Option<DeviceMetadata>) -> Result<StreamConfig> {
        let device = device.unwrap_or(self.device);
        if device.sample_rate_hz == 0 {
            return Err(Error::InvalidConfig("sample rate must be positive".into()));
        }
        if let Some(gain) = device
            .gains
            .iter()
            .find(|g| !g.is_power_of_two() || **g > MAX_GAIN)
        {
            return Err(Error::InvalidConfig(format!(
                "PGA gain {gain} must be a power of two in 1..={MAX_GAIN}"
            )));
        }
        let sample_rate_hz = device.sample_rate_hz as f64;
        let kernel = FilterKernel::low_pass(self.filter.cutoff_hz, sample_rate_hz, self.filter.taps)?;

        if self.tare.channels.is_empty() || self.tare.channels.iter().any(|&ch| ch >= CHANNELS) {
            return Err(Error::InvalidConfig(format!(
                "tare channels {:?} must be a non-empty subset of 0..{CHANNELS}",
                self.tare.channels
            )));
        }
        if self.tare.window < 2 || self.tare.threshold_uv <= 0.0 {
            return Err(Error::InvalidConfig(
                "tare window must hold two samples and the threshold must be positive".into(),
            ));
        }
        if self.batch.window_ms == 0 || self.ingest.recv_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "batch window and receive timeout must be non-zero".into(),
            ));
        }

        Ok(StreamConfig {
            codec: self.protocol.codec(),
            device,
            front_end: self.front_end,
            calibration: None,
            uv_per_count: microvolts_per_count(&device, &self.front_end),
            sample_rate_hz,
            kernel,
            tare: self.tare.clone(),
            batch_window: Duration::from_millis(self.batch.window_ms),
            batch_anchor: self.batch.anchor,
            recv_timeout: Duration::from_millis(self.ingest.recv_timeout_ms),
            stats_interval: Duration::from_millis(self.ingest.stats_interval_ms),
        })
    }
}

/// Everything the pipeline needs, fixed at connection time
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub codec: Codec,
    pub device: DeviceMetadata,
    pub front_end: FrontEnd,
    /// Filled in by whoever read it off the device, `resolve` leaves it empty
    pub calibration: Option<LoadCellCalibration>,
    pub uv_per_count: [f64; CHANNELS],
    pub sample_rate_hz: f64,
    pub kernel: FilterKernel,
    pub tare: TareConfig,
    pub batch_window: Duration,
    pub batch_anchor: BatchAnchor,
    pub recv_timeout: Duration,
    pub stats_interval: Duration,
}
