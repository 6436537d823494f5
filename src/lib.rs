//! Streaming acquisition for the four channel, 24-bit ADS131M04 load-cell sampler.
//!
//! Radio notifications are decoded by [`codec`], low-pass filtered per channel by
//! [`filter`], zeroed once by [`tare`] and handed to consumers in time-windowed
//! batches by [`pipeline`].

pub mod args;
pub mod batch;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod exfil;
pub mod filter;
pub mod metadata;
pub mod monitoring;
pub mod pipeline;
pub mod tare;

/// Number of ADC channels on the board
pub const CHANNELS: usize = 4;

pub use codec::{Codec, FeedPacket, FeedSample};
pub use error::{Error, Result};
pub use pipeline::{Batch, Reading};
