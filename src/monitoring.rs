//! In this module, we implement all the monitoring logic for the capture.
//! This includes packet/byte rates and sequence gaps from the radio link, as well as
//! a reader for the plot feed that stands in for a rendering surface.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{codec::FeedHeader, pipeline::Batch};

/// How many inter-packet gaps are averaged in the rate estimate
const RATE_WINDOW: usize = 15;

#[derive(Debug)]
pub struct PacketStats {
    interval: Duration,
    started: Option<Instant>,
    last_packet: Option<Instant>,
    last_report: Option<Instant>,
    dts: VecDeque<Duration>,
    sizes: VecDeque<usize>,
    last_seq: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
    pub malformed: u64,
    /// Notifications inferred lost from sequence number gaps
    pub missed: u64,
}

impl PacketStats {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: None,
            last_packet: None,
            last_report: None,
            dts: VecDeque::with_capacity(RATE_WINDOW),
            sizes: VecDeque::with_capacity(RATE_WINDOW),
            last_seq: None,
            packets: 0,
            bytes: 0,
            malformed: 0,
            missed: 0,
        }
    }

    /// Account for a received notification, decoded or not
    pub fn on_packet(&mut self, len: usize, now: Instant) {
        self.started.get_or_insert(now);
        if let Some(prev) = self.last_packet.replace(now) {
            if self.dts.len() == RATE_WINDOW {
                self.dts.pop_front();
                self.sizes.pop_front();
            }
            self.dts.push_back(now - prev);
            self.sizes.push_back(len);
        }
        self.packets += 1;
        self.bytes += len as u64;
    }

    pub fn on_malformed(&mut self) {
        self.malformed += 1;
    }

    /// Track the sequence number, which wraps at 2^16
    pub fn on_header(&mut self, header: FeedHeader) {
        let seq = header.sequence_number;
        if let Some(last) = self.last_seq {
            let gap = seq.wrapping_sub(last.wrapping_add(1));
            if gap != 0 {
                self.missed += gap as u64;
                warn!(expected = last.wrapping_add(1), got = seq, "Sequence gap");
            }
        }
        self.last_seq = Some(seq);
    }

    /// Average packets/s and bytes/s over the recent window
    pub fn rates(&self) -> Option<(f64, f64)> {
        let dt: Duration = self.dts.iter().sum();
        if dt.is_zero() {
            return None;
        }
        let secs = dt.as_secs_f64();
        let bytes: usize = self.sizes.iter().sum();
        Some((self.dts.len() as f64 / secs, bytes as f64 / secs))
    }

    /// Log a summary line if the report interval elapsed
    pub fn maybe_report(&mut self, now: Instant) {
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due || self.packets == 0 {
            return;
        }
        self.last_report = Some(now);
        let elapsed = self.started.map(|s| now - s).unwrap_or_default();
        let (pps, bps) = self.rates().unwrap_or_default();
        info!(
            elapsed = ?elapsed,
            packets = self.packets,
            malformed = self.malformed,
            missed = self.missed,
            packets_per_sec = %format!("{pps:.1}"),
            bytes_per_sec = %format!("{bps:.1}"),
            "Link stats"
        );
    }
}

/// Drain the plot feed until the pipeline drops it or we are told to stop, logging
/// the latest values once per `interval`. Returns the number of readings seen.
pub fn monitor_feed(
    mut feed: rtrb::Consumer<Batch>,
    interval: Duration,
    shutdown: &AtomicBool,
) -> usize {
    let mut readings = 0usize;
    let mut last_log = Instant::now();
    loop {
        match feed.pop() {
            Ok(batch) => {
                readings += batch.readings.len();
                if last_log.elapsed() >= interval {
                    last_log = Instant::now();
                    if let Some(last) = batch.readings.last() {
                        info!(
                            index = last.index,
                            raw = ?last.raw.channels,
                            tared = ?last.tared,
                            readings,
                            "Latest"
                        );
                    }
                }
            }
            Err(_) => {
                if feed.is_abandoned() || shutdown.load(Ordering::Relaxed) {
                    break;
                }
                // Batches come a few times a second, no need to spin
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    readings
}
