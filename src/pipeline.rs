//! The decode → filter → tare → batch loop
//!
//! [`Processor`] is the synchronous core: feed it samples, get aligned [`Reading`]s
//! back. [`Pipeline`] wraps it with the ingestion queue, the batcher and the consumer
//! fan-out, and owns all of that state on a single thread.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    batch::Batcher,
    capture::Ingest,
    codec::{Codec, FeedPacket, FeedSample},
    config::StreamConfig,
    error::{Error, Result},
    exfil::{Consumer, Fanout},
    filter::ChannelFilters,
    metadata::StreamMetadata,
    monitoring::PacketStats,
    tare::{TareDetector, TareState},
    CHANNELS,
};

/// One input sample with whatever processing has caught up with it
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// Samples since stream start
    pub index: u64,
    pub raw: FeedSample,
    /// Filter output centered on this sample. `None` at the edges of the stream,
    /// where the kernel doesn't fit.
    pub filtered: Option<[f64; CHANNELS]>,
    /// `filtered` minus the tare offsets, once latched
    pub tared: Option<[f64; CHANNELS]>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Batch {
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

pub struct Processor {
    codec: Codec,
    filters: ChannelFilters,
    tare: TareDetector,
    /// Raw samples waiting for their filter output
    pending: VecDeque<(u64, FeedSample)>,
    next_index: u64,
}

impl Processor {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            codec: config.codec,
            filters: ChannelFilters::new(config.kernel.clone()),
            tare: TareDetector::new(&config.tare, config.sample_rate_hz, config.uv_per_count),
            pending: VecDeque::new(),
            next_index: 0,
        }
    }

    pub fn decode(&self, buf: &[u8]) -> Result<FeedPacket> {
        self.codec.decode(buf)
    }

    /// Run a batch of samples through the filters and the tare check
    pub fn process(&mut self, samples: &[FeedSample]) -> Vec<Reading> {
        let delay = self.filters.delay() as u64;
        let mut readings = Vec::with_capacity(samples.len());
        for &raw in samples {
            let index = self.next_index;
            self.next_index += 1;
            if index < delay {
                // Leading edge, this sample never gets a centered output
                readings.push(Reading {
                    index,
                    raw,
                    filtered: None,
                    tared: None,
                });
            } else {
                self.pending.push_back((index, raw));
            }
        }

        let fresh = self.filters.process(samples);
        self.tare
            .check(self.filters.outputs(), self.filters.samples_seen());

        for filtered in fresh {
            let Some((index, raw)) = self.pending.pop_front() else {
                break;
            };
            readings.push(Reading {
                index,
                raw,
                filtered: Some(filtered),
                tared: self.tare.apply(&filtered),
            });
        }
        readings
    }

    /// Release samples still waiting on the filter, at shutdown
    pub fn finish(&mut self) -> Vec<Reading> {
        self.pending
            .drain(..)
            .map(|(index, raw)| Reading {
                index,
                raw,
                filtered: None,
                tared: None,
            })
            .collect()
    }

    pub fn tare_state(&self) -> TareState {
        self.tare.state()
    }

    pub fn samples_seen(&self) -> usize {
        self.filters.samples_seen()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// The source hung up
    ConnectionLoss,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Summary {
    pub stop: StopReason,
    pub samples: usize,
    pub packets: u64,
    pub malformed: u64,
    pub batches: usize,
    pub consumer_failures: usize,
    pub tare: TareState,
}

pub struct Pipeline {
    processor: Processor,
    batcher: Batcher<Reading>,
    consumers: Fanout,
    stats: PacketStats,
    config: StreamConfig,
    batches: usize,
}

impl Pipeline {
    pub fn new(config: StreamConfig, consumers: Vec<Box<dyn Consumer>>) -> Self {
        Self {
            processor: Processor::new(&config),
            batcher: Batcher::new(config.batch_window, config.batch_anchor, Instant::now()),
            consumers: Fanout::new(consumers),
            stats: PacketStats::new(config.stats_interval),
            config,
            batches: 0,
        }
    }

    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            started: Utc::now(),
            device: self.config.device,
            front_end: self.config.front_end,
            calibration: self.config.calibration,
            uv_per_count: self.config.uv_per_count,
            kernel_len: self.config.kernel.len(),
            filter_delay: self.config.kernel.delay(),
        }
    }

    fn ingest(&mut self, msg: Ingest, now: Instant) {
        let readings = match msg {
            Ingest::Raw(buf) => {
                self.stats.on_packet(buf.len(), now);
                match self.processor.decode(&buf) {
                    Ok(packet) => {
                        if let Some(header) = packet.header {
                            self.stats.on_header(header);
                        }
                        self.processor.process(&packet.samples)
                    }
                    Err(e) => {
                        self.stats.on_malformed();
                        warn!(len = buf.len(), error = %e, "Dropping packet");
                        return;
                    }
                }
            }
            Ingest::Samples(samples) => self.processor.process(&samples),
        };
        self.batcher.extend(readings);
    }

    fn emit(&mut self, readings: Vec<Reading>) {
        let batch = Batch {
            timestamp: Utc::now(),
            readings,
        };
        debug!(len = batch.readings.len(), "Dispatching batch");
        self.consumers.dispatch(&batch);
        self.batches += 1;
    }

    /// Pull from `source` until it disconnects or `shutdown` is raised, then flush
    /// everything still buffered and stop the consumers.
    pub fn run(mut self, source: Receiver<Ingest>, shutdown: &AtomicBool) -> Summary {
        let meta = self.metadata();
        self.consumers.start(&meta);
        self.batcher = Batcher::new(
            self.config.batch_window,
            self.config.batch_anchor,
            Instant::now(),
        );

        let stop = loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break StopReason::Shutdown;
            }
            let wait = self
                .config
                .recv_timeout
                .min(self.batcher.time_to_push(Instant::now()));
            match source.recv_timeout(wait) {
                Ok(msg) => self.ingest(msg, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("{}, shutting down", Error::ConnectionLoss);
                    break StopReason::ConnectionLoss;
                }
            }
            let now = Instant::now();
            if let Some(readings) = self.batcher.poll(now) {
                self.emit(readings);
            }
            self.stats.maybe_report(now);
        };

        // Nothing in flight is dropped, including what is still queued
        let queued: Vec<Ingest> = source.try_iter().collect();
        if !queued.is_empty() {
            debug!(messages = queued.len(), "Draining ingestion queue");
        }
        for msg in queued {
            self.ingest(msg, Instant::now());
        }
        let tail = self.processor.finish();
        self.batcher.extend(tail);
        if let Some(readings) = self.batcher.flush() {
            self.emit(readings);
        }
        self.consumers.stop();

        let summary = Summary {
            stop,
            samples: self.processor.samples_seen(),
            packets: self.stats.packets,
            malformed: self.stats.malformed,
            batches: self.batches,
            consumer_failures: self.consumers.failures(),
            tare: self.processor.tare_state(),
        };
        info!(?summary, "Pipeline stopped");
        summary
    }
}
