//! Opportunistic zeroing
//!
//! The board cannot zero itself, so we wait for the filtered signal to sit still and
//! take that as the zero reference. The decision is made once: after latching, the
//! offsets never change, no matter what the signal does.

use num_traits::Float;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::CHANNELS;

/// Population mean and standard deviation, `None` for fewer than two points
pub fn mean_std<T: Float>(xs: &[T]) -> Option<(T, T)> {
    if xs.len() < 2 {
        return None;
    }
    let n = T::from(xs.len())?;
    let mean = xs.iter().fold(T::zero(), |acc, &x| acc + x) / n;
    let var = xs
        .iter()
        .fold(T::zero(), |acc, &x| acc + (x - mean) * (x - mean))
        / n;
    Some((mean, var.sqrt()))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TareConfig {
    /// Most recent filtered samples the statistics are taken over
    pub window: usize,
    /// Every monitored channel's std must fall below this, in bridge microvolts
    pub threshold_uv: f64,
    /// Raw samples that must have been observed, in seconds of device time
    pub min_duration_s: f64,
    /// Channels whose stability gates the latch. Offsets are latched for all channels.
    pub channels: Vec<usize>,
}

impl Default for TareConfig {
    fn default() -> Self {
        Self {
            window: 4000,
            threshold_uv: 1.0,
            min_duration_s: 2.0,
            channels: (0..CHANNELS).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TareState {
    Untared,
    Tared {
        offsets: [f64; CHANNELS],
        /// Raw samples seen when the latch happened
        at_sample: usize,
    },
}

#[derive(Clone, Debug)]
pub struct TareDetector {
    window: usize,
    threshold_uv: f64,
    min_samples: usize,
    monitored: Vec<usize>,
    uv_per_count: [f64; CHANNELS],
    state: TareState,
}

impl TareDetector {
    pub fn new(config: &TareConfig, sample_rate_hz: f64, uv_per_count: [f64; CHANNELS]) -> Self {
        Self {
            window: config.window.max(2),
            threshold_uv: config.threshold_uv,
            min_samples: (config.min_duration_s * sample_rate_hz).round() as usize,
            monitored: config.channels.clone(),
            uv_per_count,
            state: TareState::Untared,
        }
    }

    /// Evaluate the latch rule against the filtered history of every channel.
    /// Returns true only on the call that latches.
    pub fn check(&mut self, filtered: [&[f64]; CHANNELS], samples_seen: usize) -> bool {
        if self.is_tared() || samples_seen <= self.min_samples {
            return false;
        }
        let mut stats = [(0f64, 0f64); CHANNELS];
        for (ch, series) in filtered.iter().enumerate() {
            let recent = &series[series.len().saturating_sub(self.window)..];
            match mean_std(recent) {
                Some(s) => stats[ch] = s,
                None => return false,
            }
        }
        let settled = self
            .monitored
            .iter()
            .all(|&ch| stats[ch].1 * self.uv_per_count[ch] < self.threshold_uv);
        if !settled {
            return false;
        }
        let offsets = stats.map(|(mean, _)| mean);
        info!(samples_seen, ?offsets, "Signal settled, tare latched");
        self.state = TareState::Tared {
            offsets,
            at_sample: samples_seen,
        };
        true
    }

    pub fn state(&self) -> TareState {
        self.state
    }

    pub fn is_tared(&self) -> bool {
        matches!(self.state, TareState::Tared { .. })
    }

    pub fn offsets(&self) -> Option<[f64; CHANNELS]> {
        match self.state {
            TareState::Tared { offsets, .. } => Some(offsets),
            TareState::Untared => None,
        }
    }

    /// Subtract the latched offsets, `None` until tared
    pub fn apply(&self, filtered: &[f64; CHANNELS]) -> Option<[f64; CHANNELS]> {
        let offsets = self.offsets()?;
        Some(std::array::from_fn(|ch| filtered[ch] - offsets[ch]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    const RATE: f64 = 1000.0;
    const UV: [f64; CHANNELS] = [0.1; CHANNELS];

    fn constant(values: [f64; CHANNELS], n: usize) -> [Vec<f64>; CHANNELS] {
        std::array::from_fn(|ch| vec![values[ch]; n])
    }

    fn views(series: &[Vec<f64>; CHANNELS]) -> [&[f64]; CHANNELS] {
        std::array::from_fn(|ch| series[ch].as_slice())
    }

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[2.0f64, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.0).abs() < 1e-12);
        assert!(mean_std::<f32>(&[1.0]).is_none());
    }

    #[test]
    fn test_latches_constant_value() {
        let mut det = TareDetector::new(&TareConfig::default(), RATE, UV);
        let series = constant([1234.0, -50.0, 0.0, 7.5], 2100);
        assert!(!det.check(views(&series), 2000), "too early");
        assert!(!det.is_tared());
        assert!(det.check(views(&series), 2001));
        let offsets = det.offsets().unwrap();
        for (got, want) in offsets.iter().zip([1234.0, -50.0, 0.0, 7.5]) {
            assert!((got - want).abs() < 1e-9);
        }
        assert_eq!(
            det.apply(&[1234.0, -50.0, 1.0, 7.5]).unwrap(),
            [0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_noisy_channel_blocks_latch() {
        let mut det = TareDetector::new(&TareConfig::default(), RATE, UV);
        let mut series = constant([0.0; CHANNELS], 3000);
        // std of 100 counts is 10 uV at 0.1 uV/count
        for (i, v) in series[2].iter_mut().enumerate() {
            *v = if i % 2 == 0 { 100.0 } else { -100.0 };
        }
        assert!(!det.check(views(&series), 3000));
        assert_eq!(det.state(), TareState::Untared);
        assert!(det.apply(&[0.0; CHANNELS]).is_none());
    }

    #[test]
    fn test_unmonitored_channel_is_ignored() {
        let config = TareConfig {
            channels: vec![0, 1],
            ..TareConfig::default()
        };
        let mut det = TareDetector::new(&config, RATE, UV);
        let mut series = constant([10.0; CHANNELS], 3000);
        for (i, v) in series[3].iter_mut().enumerate() {
            *v = i as f64;
        }
        assert!(det.check(views(&series), 3000));
        // Offsets still latched for the unmonitored channel
        assert!((det.offsets().unwrap()[3] - 1499.5).abs() < 1e-9);
    }

    #[test]
    fn test_only_recent_window_counts() {
        let config = TareConfig {
            window: 500,
            ..TareConfig::default()
        };
        let mut det = TareDetector::new(&config, RATE, UV);
        let mut series = constant([3.0; CHANNELS], 2500);
        // Early noise falls outside the last 500 samples
        for s in series.iter_mut() {
            for v in s[..1500].iter_mut() {
                *v = 1e6;
            }
        }
        assert!(det.check(views(&series), 2500));
        assert_eq!(det.offsets().unwrap(), [3.0; CHANNELS]);
    }

    #[test]
    fn test_latch_is_permanent() {
        let mut det = TareDetector::new(&TareConfig::default(), RATE, UV);
        let series = constant([42.0; CHANNELS], 2500);
        assert!(det.check(views(&series), 2500));
        let latched = det.state();

        let mut rng = StdRng::seed_from_u64(3);
        for round in 0..50 {
            let noisy: [Vec<f64>; CHANNELS] = std::array::from_fn(|_| {
                (0..1000).map(|_| rng.gen_range(-1e6..1e6)).collect()
            });
            let quiet = constant([round as f64; CHANNELS], 4000);
            assert!(!det.check(views(&noisy), 10_000 + round));
            assert!(!det.check(views(&quiet), 20_000 + round));
            assert_eq!(det.state(), latched);
        }
    }
}
