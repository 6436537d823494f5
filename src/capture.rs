//! This module contains all the ingestion sources
//!
//! A source does one thing: get notifications (or replayed samples) off the wire and
//! into the pipeline's channel as fast as they arrive. Decoding happens downstream.
//! Dropping the sender is how a source says the link is gone.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    net::UdpSocket,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{codec::FeedSample, error::Result, CHANNELS};

/// Largest notification payload the radio can deliver
pub const MAX_NOTIFICATION: usize = 512;

/// What a source hands the pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ingest {
    /// One undecoded notification
    Raw(Vec<u8>),
    /// Already structured samples, from a replay
    Samples(Vec<FeedSample>),
}

/// One line of a replay file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub channels: [i32; CHANNELS],
}

/// Parse one replay line. Blank lines and `#` comments yield `None`.
pub fn parse_record(line: &str) -> Result<Option<FeedSample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let record: Record = serde_json::from_str(line)?;
    Ok(Some(FeedSample::new(record.channels)))
}

#[derive(Clone, Copy, Debug)]
pub struct ReplayPacing {
    /// Samples per second to approximate, zero or less replays as fast as possible
    pub rate_hz: f64,
    /// Samples sent per message
    pub chunk: usize,
}

impl ReplayPacing {
    fn chunk_delay(&self) -> Option<Duration> {
        (self.rate_hz > 0.0).then(|| Duration::from_secs_f64(self.chunk as f64 / self.rate_hz))
    }
}

/// Feed records from `reader` into `sender` at roughly real time. Returns the number of
/// samples sent. Stops early on shutdown or when the pipeline hangs up.
pub fn replay<R: BufRead>(
    reader: R,
    pacing: ReplayPacing,
    sender: &Sender<Ingest>,
    shutdown: &AtomicBool,
) -> Result<usize> {
    let chunk = pacing.chunk.max(1);
    let mut buffer = Vec::with_capacity(chunk);
    let mut sent = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match parse_record(&line?) {
            Ok(Some(sample)) => buffer.push(sample),
            Ok(None) => {}
            Err(e) => warn!(line = lineno + 1, error = %e, "Skipping malformed record"),
        }
        if buffer.len() >= chunk {
            sent += buffer.len();
            if sender.send(Ingest::Samples(std::mem::take(&mut buffer))).is_err() {
                return Ok(sent);
            }
            // Approximate pacing, the time spent reading is not subtracted
            if let Some(delay) = pacing.chunk_delay() {
                thread::sleep(delay);
            }
        }
    }
    if !buffer.is_empty() && !shutdown.load(Ordering::Relaxed) {
        let len = buffer.len();
        if sender.send(Ingest::Samples(buffer)).is_err() {
            return Ok(sent);
        }
        sent += len;
    }
    info!(samples = sent, "Replay finished");
    Ok(sent)
}

pub fn replay_file(
    path: &Path,
    pacing: ReplayPacing,
    sender: &Sender<Ingest>,
    shutdown: &AtomicBool,
) -> Result<usize> {
    info!(path = %path.display(), "Replaying");
    replay(BufReader::new(File::open(path)?), pacing, sender, shutdown)
}

/// Forward every datagram on `socket` as one notification. Each datagram is expected to
/// carry exactly one radio notification, as relayed by a BLE bridge.
pub fn udp_link(
    socket: UdpSocket,
    poll: Duration,
    sender: &Sender<Ingest>,
    shutdown: &AtomicBool,
) -> Result<()> {
    socket.set_read_timeout(Some(poll))?;
    info!(addr = ?socket.local_addr()?, "Listening for notifications");
    let mut buf = [0u8; MAX_NOTIFICATION];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                debug!(n, %from, "Notification");
                if sender.send(Ingest::Raw(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
