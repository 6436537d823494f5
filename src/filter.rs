//! Incremental FIR filtering of the channel streams
//!
//! Samples arrive in notification-sized chunks of arbitrary length, but the filtered
//! stream must be identical to a single valid-mode convolution over everything seen
//! so far. Each call only computes the outputs that just became valid.

use std::f64::consts::PI;

use crate::{
    codec::FeedSample,
    error::{Error, Result},
    CHANNELS,
};

/// Normalized sinc, `sin(pi x) / (pi x)`
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Symmetric Blackman window of `len` points
pub fn blackman(len: usize) -> Vec<f64> {
    if len == 1 {
        return vec![1.0];
    }
    let m = (len - 1) as f64;
    (0..len)
        .map(|n| {
            let n = n as f64;
            0.42 - 0.5 * (2.0 * PI * n / m).cos() + 0.08 * (4.0 * PI * n / m).cos()
        })
        .collect()
}

/// Valid-mode (no padding) convolution. The kernel is reversed, so this agrees with
/// `numpy.convolve(input, kernel, "valid")` for inputs at least as long as the kernel.
pub fn convolve_valid(input: &[f64], kernel: &[f64]) -> Vec<f64> {
    if kernel.is_empty() || input.len() < kernel.len() {
        return Vec::new();
    }
    input
        .windows(kernel.len())
        .map(|w| w.iter().zip(kernel.iter().rev()).map(|(x, h)| x * h).sum())
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterKernel {
    taps: Vec<f64>,
}

impl FilterKernel {
    /// Use `taps` as-is. Odd length is required so output samples have an integer delay.
    pub fn from_taps(taps: Vec<f64>) -> Result<Self> {
        if taps.len() % 2 == 0 {
            return Err(Error::KernelLength(taps.len()));
        }
        Ok(Self { taps })
    }

    /// Blackman-windowed sinc low-pass with unity DC gain
    ///
    /// # Arguments
    /// * `cutoff_hz` - Cutoff frequency, below Nyquist
    /// * `sample_rate_hz` - Device sample rate
    /// * `len` - Number of taps (odd)
    pub fn low_pass(cutoff_hz: f64, sample_rate_hz: f64, len: usize) -> Result<Self> {
        if len % 2 == 0 {
            return Err(Error::KernelLength(len));
        }
        if !(sample_rate_hz > 0.0 && cutoff_hz > 0.0 && cutoff_hz < sample_rate_hz / 2.0) {
            return Err(Error::InvalidConfig(format!(
                "cutoff {cutoff_hz} Hz must lie in (0, {}) Hz",
                sample_rate_hz / 2.0
            )));
        }
        let fc = cutoff_hz / sample_rate_hz;
        let center = (len - 1) as f64 / 2.0;
        let mut taps: Vec<f64> = blackman(len)
            .into_iter()
            .enumerate()
            .map(|(i, w)| sinc(2.0 * fc * (i as f64 - center)) * w)
            .collect();
        let sum: f64 = taps.iter().sum();
        taps.iter_mut().for_each(|t| *t /= sum);
        Ok(Self { taps })
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Output `k` lines up with input `k + delay()`
    pub fn delay(&self) -> usize {
        (self.taps.len() - 1) / 2
    }
}

/// Append-only history and output of one channel
#[derive(Clone, Debug)]
pub struct IncrementalConvolution {
    kernel: FilterKernel,
    history: Vec<f64>,
    output: Vec<f64>,
}

impl IncrementalConvolution {
    pub fn new(kernel: FilterKernel) -> Self {
        Self {
            kernel,
            history: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Append `samples` and return only the filtered values that became valid
    pub fn process(&mut self, samples: &[f64]) -> &[f64] {
        self.history.extend_from_slice(samples);
        let n = self.kernel.len();
        let valid_len = (self.history.len() + 1).saturating_sub(n);
        let already = self.output.len();
        if valid_len <= already {
            return &[];
        }
        let to_compute = valid_len - already;
        let tail = &self.history[self.history.len() - (to_compute + n - 1)..];
        let fresh = convolve_valid(tail, self.kernel.taps());
        debug_assert_eq!(fresh.len(), to_compute);
        self.output.extend(fresh);
        &self.output[already..]
    }

    pub fn kernel(&self) -> &FilterKernel {
        &self.kernel
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn output(&self) -> &[f64] {
        &self.output
    }
}

/// One [`IncrementalConvolution`] per channel, advanced in lockstep
#[derive(Clone, Debug)]
pub struct ChannelFilters {
    channels: [IncrementalConvolution; CHANNELS],
}

impl ChannelFilters {
    pub fn new(kernel: FilterKernel) -> Self {
        Self {
            channels: std::array::from_fn(|_| IncrementalConvolution::new(kernel.clone())),
        }
    }

    /// Filter a run of samples, returning the newly valid multi-channel outputs
    pub fn process(&mut self, samples: &[FeedSample]) -> Vec<[f64; CHANNELS]> {
        let mut column = Vec::with_capacity(samples.len());
        let mut fresh = Vec::new();
        for (ch, conv) in self.channels.iter_mut().enumerate() {
            column.clear();
            column.extend(samples.iter().map(|s| s.channels[ch] as f64));
            let out = conv.process(&column);
            if ch == 0 {
                fresh = vec![[0f64; CHANNELS]; out.len()];
            }
            for (row, v) in fresh.iter_mut().zip(out) {
                row[ch] = *v;
            }
        }
        fresh
    }

    pub fn delay(&self) -> usize {
        self.channels[0].kernel().delay()
    }

    /// Every filtered output so far, per channel
    pub fn outputs(&self) -> [&[f64]; CHANNELS] {
        std::array::from_fn(|ch| self.channels[ch].output())
    }

    pub fn samples_seen(&self) -> usize {
        self.channels[0].history().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    const TEST_KERNEL: [f64; 5] = [1.0, -1.0, 0.0, 0.0, 0.0];
    const TEST_INPUT: [f64; 12] = [1., 0., 0., 0., 1., 0., 0., 0., 1., 0., 0., 0.];

    fn random_chunks(rng: &mut impl Rng, len: usize) -> Vec<usize> {
        let mut chunks = vec![];
        let mut left = len;
        while left > 0 {
            let n = rng.gen_range(1..=left);
            chunks.push(n);
            left -= n;
        }
        chunks
    }

    #[test]
    fn test_batch_matches_numpy() {
        let out = convolve_valid(&TEST_INPUT, &TEST_KERNEL);
        assert_eq!(out, vec![1., -1., 0., 0., 1., -1., 0., 0.]);
    }

    #[test]
    fn test_chunked_equals_batch() {
        let expected = convolve_valid(&TEST_INPUT, &TEST_KERNEL);
        let kernel = FilterKernel::from_taps(TEST_KERNEL.to_vec()).unwrap();

        let mut conv = IncrementalConvolution::new(kernel.clone());
        let mut joined = vec![];
        for chunk in TEST_INPUT.chunks(4) {
            joined.extend_from_slice(conv.process(chunk));
        }
        assert_eq!(joined, expected);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut conv = IncrementalConvolution::new(kernel.clone());
            let mut joined = vec![];
            let mut start = 0;
            for n in random_chunks(&mut rng, TEST_INPUT.len()) {
                joined.extend_from_slice(conv.process(&TEST_INPUT[start..start + n]));
                start += n;
            }
            assert_eq!(joined, expected);
            assert_eq!(conv.output(), &expected[..]);
        }
    }

    #[test]
    fn test_chunked_low_pass_on_noise() {
        let kernel = FilterKernel::low_pass(10.0, 1000.0, 51).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let input: Vec<f64> = (0..1000).map(|_| rng.gen_range(-1e5..1e5)).collect();
        let expected = convolve_valid(&input, kernel.taps());

        let mut conv = IncrementalConvolution::new(kernel);
        let mut joined = vec![];
        let mut start = 0;
        for n in random_chunks(&mut rng, input.len()) {
            joined.extend_from_slice(conv.process(&input[start..start + n]));
            start += n;
        }
        assert_eq!(joined.len(), expected.len());
        for (a, b) in joined.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_length_invariant() {
        let kernel = FilterKernel::from_taps(TEST_KERNEL.to_vec()).unwrap();
        let mut conv = IncrementalConvolution::new(kernel);
        let mut seen = 0usize;
        for n in [0, 1, 2, 0, 1, 3, 7, 1] {
            conv.process(&vec![0.5; n]);
            seen += n;
            assert_eq!(conv.output().len(), (seen + 1).saturating_sub(5));
        }
    }

    #[test]
    fn test_low_pass_design() {
        let kernel = FilterKernel::low_pass(25.0, 1000.0, 101).unwrap();
        assert_eq!(kernel.len(), 101);
        assert_eq!(kernel.delay(), 50);
        let sum: f64 = kernel.taps().iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        // Symmetric, peaked at the center tap
        let taps = kernel.taps();
        for i in 0..50 {
            assert!((taps[i] - taps[100 - i]).abs() < 1e-12);
            assert!(taps[i] < taps[50]);
        }
    }

    #[test]
    fn test_even_kernels_rejected() {
        assert!(matches!(
            FilterKernel::from_taps(vec![0.5, 0.5]),
            Err(Error::KernelLength(2))
        ));
        assert!(matches!(
            FilterKernel::from_taps(vec![]),
            Err(Error::KernelLength(0))
        ));
        assert!(FilterKernel::low_pass(10.0, 1000.0, 64).is_err());
        assert!(FilterKernel::low_pass(600.0, 1000.0, 63).is_err());
    }

    #[test]
    fn test_channel_filters_lockstep() {
        let kernel = FilterKernel::from_taps(vec![1.0 / 3.0; 3]).unwrap();
        let mut filters = ChannelFilters::new(kernel);
        let samples: Vec<FeedSample> = (0..4)
            .map(|i| FeedSample::new([i * 3, -i * 3, 100, 0]))
            .collect();
        assert!(filters.process(&samples[..2]).is_empty());
        let out = filters.process(&samples[2..]);
        assert_eq!(out.len(), 2);
        assert!((out[0][0] - 3.0).abs() < 1e-12);
        assert!((out[1][1] + 6.0).abs() < 1e-12);
        assert!((out[1][2] - 100.0).abs() < 1e-12);
        assert_eq!(filters.samples_seen(), 4);
        assert_eq!(filters.outputs()[3].len(), 2);
    }
}
