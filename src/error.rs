//! Error types shared across the acquisition pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Wire data failed the framing or length invariants. Only the offending packet is lost.
    #[error("malformed packet ({len} bytes): {reason}")]
    MalformedPacket { len: usize, reason: &'static str },

    #[error("unsupported metadata protocol version {0:#04x}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid metadata blob ({len} bytes): {reason}")]
    MalformedMetadata { len: usize, reason: &'static str },

    #[error("filter kernel must have odd, non-zero length (got {0})")]
    KernelLength(usize),

    #[error("consumer `{name}` failed: {detail}")]
    Consumer { name: String, detail: String },

    #[error("ingestion source disconnected")]
    ConnectionLoss,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
