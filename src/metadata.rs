//! Device metadata read once after connecting, and the unit conversions derived from it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    CHANNELS,
};

/// The only metadata layout this crate understands
pub const METADATA_V1: u8 = 1;
const METADATA_V1_LEN: usize = 8;

/// Largest PGA gain, code 0b111
pub const MAX_GAIN: u32 = 128;

/// ADS131M04 internal reference
pub const VREF_VOLTS: f64 = 1.2;
/// Positive full-scale code of a 24-bit two's complement reading
pub const FULL_SCALE_CODE: f64 = (1u32 << 23) as f64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceMetadata {
    pub version: u8,
    pub channel_count: u8,
    /// PGA gain per channel (1..=128)
    pub gains: [u32; CHANNELS],
    pub sample_rate_hz: u32,
}

impl DeviceMetadata {
    /// Parse the versioned blob
    ///
    /// Version 1: `[0x01][channel count][GAIN register: u16 LE][sample rate: u32 LE]`,
    /// the GAIN register holding one 3-bit PGAGAIN code per channel in nibbles 0..3.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let len = blob.len();
        let version = *blob.first().ok_or(Error::MalformedMetadata {
            len,
            reason: "empty blob",
        })?;
        if version != METADATA_V1 {
            return Err(Error::UnsupportedProtocolVersion(version));
        }
        if len < METADATA_V1_LEN {
            return Err(Error::MalformedMetadata {
                len,
                reason: "truncated v1 blob",
            });
        }
        let channel_count = blob[1];
        if channel_count as usize != CHANNELS {
            return Err(Error::MalformedMetadata {
                len,
                reason: "channel count does not match the ADC",
            });
        }
        let gain_reg = u16::from_le_bytes([blob[2], blob[3]]);
        let gains = std::array::from_fn(|ch| 1u32 << ((gain_reg >> (4 * ch)) & 0b111));
        let sample_rate_hz = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        if sample_rate_hz == 0 {
            return Err(Error::MalformedMetadata {
                len,
                reason: "zero sample rate",
            });
        }
        Ok(Self {
            version,
            channel_count,
            gains,
            sample_rate_hz,
        })
    }

    /// Serialize back into the v1 layout. Gains are rounded down to a power of two.
    pub fn to_bytes(&self) -> Vec<u8> {
        let gain_reg = self
            .gains
            .iter()
            .enumerate()
            .fold(0u16, |reg, (ch, g)| reg | ((g.max(&1).ilog2() as u16 & 0b111) << (4 * ch)));
        let mut out = vec![METADATA_V1, self.channel_count];
        out.extend_from_slice(&gain_reg.to_le_bytes());
        out.extend_from_slice(&self.sample_rate_hz.to_le_bytes());
        out
    }
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_V1,
            channel_count: CHANNELS as u8,
            gains: [1, 4, 4, 1],
            sample_rate_hz: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadCell {
    /// Rated output at capacity, in mV per volt of excitation
    pub rated_output_mv_per_v: f64,
    pub excitation_volts: f64,
    pub capacity_kg: f64,
}

impl Default for LoadCell {
    fn default() -> Self {
        Self {
            rated_output_mv_per_v: 2.0,
            excitation_volts: 3.3,
            capacity_kg: 100.0,
        }
    }
}

impl LoadCell {
    pub fn volts_to_kg(&self, volts: f64) -> f64 {
        volts / (self.rated_output_mv_per_v * 1e-3 * self.excitation_volts) * self.capacity_kg
    }
}

/// Factory calibration words flashed alongside the firmware, two `u32` LE.
/// Their meaning is owned by the flashing tool, so they are passed through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCellCalibration {
    pub words: [u32; 2],
}

impl LoadCellCalibration {
    const LEN: usize = 8;

    /// Parse the calibration characteristic, trailing bytes are ignored
    pub fn parse(blob: &[u8]) -> Result<Self> {
        if blob.len() < Self::LEN {
            return Err(Error::MalformedMetadata {
                len: blob.len(),
                reason: "truncated calibration",
            });
        }
        let word = |i: usize| u32::from_le_bytes([blob[i], blob[i + 1], blob[i + 2], blob[i + 3]]);
        Ok(Self {
            words: [word(0), word(4)],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// Analog front end between the bridge and the ADC
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontEnd {
    pub opamp_gain: f64,
    pub load_cell: LoadCell,
}

impl Default for FrontEnd {
    fn default() -> Self {
        Self {
            opamp_gain: 26.0,
            load_cell: LoadCell::default(),
        }
    }
}

/// Units a raw ADC count can be converted into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Raw counts
    Adc,
    /// Volts at the ADC input
    VoltsAdc,
    /// Volts at the bridge, before the opamp
    VoltsOpamp,
    KgWithOpamp,
}

impl Conversion {
    /// Units per count for a channel with PGA gain `adc_gain`
    pub fn per_count(&self, adc_gain: u32, front_end: &FrontEnd) -> f64 {
        let volts_adc = VREF_VOLTS / adc_gain as f64 / FULL_SCALE_CODE;
        match self {
            Conversion::Adc => 1.0,
            Conversion::VoltsAdc => volts_adc,
            Conversion::VoltsOpamp => volts_adc / front_end.opamp_gain,
            Conversion::KgWithOpamp => front_end
                .load_cell
                .volts_to_kg(volts_adc / front_end.opamp_gain),
        }
    }

    /// Counts per unit, truncated to the integer a receiver divides by. Existing
    /// socket readers expect the truncated value.
    pub fn scale_factor(&self, adc_gain: u32, front_end: &FrontEnd) -> i32 {
        (1.0 / self.per_count(adc_gain, front_end)).trunc() as i32
    }
}

/// Bridge microvolts per count for every channel
pub fn microvolts_per_count(device: &DeviceMetadata, front_end: &FrontEnd) -> [f64; CHANNELS] {
    std::array::from_fn(|ch| Conversion::VoltsOpamp.per_count(device.gains[ch], front_end) * 1e6)
}

/// Everything a consumer learns when the stream starts
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub started: DateTime<Utc>,
    pub device: DeviceMetadata,
    pub front_end: FrontEnd,
    /// As read from the device, if it was
    pub calibration: Option<LoadCellCalibration>,
    pub uv_per_count: [f64; CHANNELS],
    pub kernel_len: usize,
    /// Samples between an input and its filtered output
    pub filter_delay: usize,
}
