//! This module is responsible for getting batches out of the pipeline
//!
//! Every sink implements [`Consumer`]. The pipeline calls them in registration order
//! through a [`Fanout`], which contains failures so one broken sink can't stall the
//! capture or starve the others. Sinks that touch files or sockets are wrapped in a
//! [`Worker`] so their I/O happens on their own thread.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    net::{SocketAddr, TcpStream},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};

use byte_slice_cast::AsByteSlice;
use chrono::Utc;
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    capture::Record,
    error::{Error, Result},
    metadata::{Conversion, StreamMetadata},
    pipeline::{Batch, Reading},
    CHANNELS,
};

/// Something that wants every batch the pipeline produces
pub trait Consumer: Send {
    fn name(&self) -> &str;

    /// Called once, before the first batch
    fn on_start(&mut self, _meta: &StreamMetadata) -> Result<()> {
        Ok(())
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()>;

    /// Called once at teardown, after the final flush
    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

fn consumer_error(name: &str, detail: impl ToString) -> Error {
    Error::Consumer {
        name: name.to_owned(),
        detail: detail.to_string(),
    }
}

/// Ordered set of consumers with per-consumer fault isolation
#[derive(Default)]
pub struct Fanout {
    consumers: Vec<Box<dyn Consumer>>,
    failures: usize,
}

impl Fanout {
    pub fn new(consumers: Vec<Box<dyn Consumer>>) -> Self {
        Self {
            consumers,
            failures: 0,
        }
    }

    pub fn push(&mut self, consumer: Box<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Errors and panics reported by consumers so far
    pub fn failures(&self) -> usize {
        self.failures
    }

    fn each(&mut self, stage: &str, mut f: impl FnMut(&mut dyn Consumer) -> Result<()>) {
        for consumer in self.consumers.iter_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(consumer.as_mut())));
            let detail = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panicked".to_owned()),
            };
            self.failures += 1;
            warn!(consumer = consumer.name(), stage, %detail, "Consumer failed");
        }
    }

    pub fn start(&mut self, meta: &StreamMetadata) {
        self.each("start", |c| c.on_start(meta));
    }

    pub fn dispatch(&mut self, batch: &Batch) {
        self.each("batch", |c| c.on_batch(batch));
    }

    pub fn stop(&mut self) {
        self.each("stop", |c| c.on_stop());
    }
}

enum WorkerMsg {
    Start(StreamMetadata),
    Batch(Batch),
    Stop,
}

/// Runs a consumer on its own thread. Batches cross by value over a bounded channel,
/// start and stop messages wait for room but batches are dropped when it is full.
pub struct Worker {
    name: String,
    sender: Sender<WorkerMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<C: Consumer + 'static>(mut consumer: C, capacity: usize) -> Result<Self> {
        let name = consumer.name().to_owned();
        let (sender, receiver) = bounded::<WorkerMsg>(capacity);
        let handle = thread::Builder::new()
            .name(format!("sink-{name}"))
            .spawn(move || {
                for msg in receiver {
                    let result = match msg {
                        WorkerMsg::Start(meta) => consumer.on_start(&meta),
                        WorkerMsg::Batch(batch) => consumer.on_batch(&batch),
                        WorkerMsg::Stop => {
                            if let Err(e) = consumer.on_stop() {
                                warn!(consumer = consumer.name(), error = %e, "Consumer failed to stop");
                            }
                            break;
                        }
                    };
                    if let Err(e) = result {
                        warn!(consumer = consumer.name(), error = %e, "Consumer failed");
                    }
                }
            })?;
        Ok(Self {
            name,
            sender,
            handle: Some(handle),
        })
    }

    fn send(&self, msg: WorkerMsg) -> Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| consumer_error(&self.name, "worker thread exited"))
    }
}

impl Consumer for Worker {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, meta: &StreamMetadata) -> Result<()> {
        self.send(WorkerMsg::Start(meta.clone()))
    }

    /// Never blocks: a sink that falls behind loses the batch instead of stalling
    /// the pipeline
    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        self.sender
            .try_send(WorkerMsg::Batch(batch.clone()))
            .map_err(|e| match e {
                TrySendError::Full(_) => consumer_error(&self.name, "queue full, batch dropped"),
                TrySendError::Disconnected(_) => consumer_error(&self.name, "worker thread exited"),
            })
    }

    fn on_stop(&mut self) -> Result<()> {
        // Worker may already be gone, joining tells us whether it panicked
        let sent = self.send(WorkerMsg::Stop);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| consumer_error(&self.name, "worker thread panicked"))?;
        }
        sent
    }
}

/// `./data/<prefix>_YYYYmmdd_HHMMSS.<ext>`
pub fn default_path(prefix: &str, ext: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    PathBuf::from("data").join(format!("{prefix}_{stamp}.{ext}"))
}

fn create_with_parents(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Column order of the CSV output
pub const CSV_COLUMNS: [&str; 1 + 3 * CHANNELS] = [
    "index", "ch0", "ch1", "ch2", "ch3", "filtered0", "filtered1", "filtered2", "filtered3",
    "tared0", "tared1", "tared2", "tared3",
];

#[derive(Serialize)]
struct CsvRow {
    index: u64,
    raw: [i32; CHANNELS],
    filtered: [Option<f64>; CHANNELS],
    tared: [Option<f64>; CHANNELS],
}

impl From<&Reading> for CsvRow {
    fn from(r: &Reading) -> Self {
        Self {
            index: r.index,
            raw: r.raw.channels,
            filtered: std::array::from_fn(|ch| r.filtered.map(|f| f[ch])),
            tared: std::array::from_fn(|ch| r.tared.map(|t| t[ch])),
        }
    }
}

/// One row per reading, preceded by `#` comment lines describing the stream
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<BufWriter<File>>>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Consumer for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn on_start(&mut self, meta: &StreamMetadata) -> Result<()> {
        let mut file = create_with_parents(&self.path)?;
        writeln!(file, "# CSV setup: {}", Utc::now().to_rfc3339())?;
        writeln!(file, "# {}", serde_json::to_string(meta)?)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(CSV_COLUMNS)?;
        info!(path = %self.path.display(), "Writing CSV");
        self.writer = Some(writer);
        Ok(())
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| consumer_error("csv", "not started"))?;
        for reading in &batch.readings {
            writer.serialize(CsvRow::from(reading))?;
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(path = %self.path.display(), "Closed CSV");
        }
        Ok(())
    }
}

/// Raw samples as JSON lines, readable by [`crate::capture::replay`]
pub struct RecordSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RecordSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }
}

impl Consumer for RecordSink {
    fn name(&self) -> &str {
        "records"
    }

    fn on_start(&mut self, _meta: &StreamMetadata) -> Result<()> {
        info!(path = %self.path.display(), "Writing records");
        self.writer = Some(create_with_parents(&self.path)?);
        Ok(())
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| consumer_error("records", "not started"))?;
        for reading in &batch.readings {
            let record = Record {
                index: Some(reading.index),
                channels: reading.raw.channels,
            };
            serde_json::to_writer(&mut *writer, &record)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// One TCP stream per channel. Each stream first carries the `i32` counts-per-unit
/// scale factor, then every raw value, all as little-endian `i32`.
pub struct SocketSink {
    addrs: [SocketAddr; CHANNELS],
    conversion: Conversion,
    streams: Vec<TcpStream>,
    scratch: Vec<i32>,
}

impl SocketSink {
    pub fn new(addrs: [SocketAddr; CHANNELS], conversion: Conversion) -> Self {
        Self {
            addrs,
            conversion,
            streams: Vec::with_capacity(CHANNELS),
            scratch: Vec::new(),
        }
    }
}

/// Write `values` as little-endian `i32` regardless of host order
fn write_le_i32(stream: &mut impl Write, values: &mut [i32]) -> std::io::Result<()> {
    values.iter_mut().for_each(|v| *v = v.to_le());
    stream.write_all(values.as_byte_slice())
}

impl Consumer for SocketSink {
    fn name(&self) -> &str {
        "socket"
    }

    fn on_start(&mut self, meta: &StreamMetadata) -> Result<()> {
        for (ch, addr) in self.addrs.iter().enumerate() {
            let mut stream = TcpStream::connect(addr)?;
            stream.set_nodelay(true)?;
            let scale = self
                .conversion
                .scale_factor(meta.device.gains[ch], &meta.front_end);
            info!(%addr, ch, scale, "Socket connected");
            write_le_i32(&mut stream, &mut [scale])?;
            self.streams.push(stream);
        }
        Ok(())
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        if self.streams.len() != CHANNELS {
            return Err(consumer_error("socket", "not connected"));
        }
        for (ch, stream) in self.streams.iter_mut().enumerate() {
            self.scratch.clear();
            self.scratch
                .extend(batch.readings.iter().map(|r| r.raw.channels[ch]));
            write_le_i32(stream, &mut self.scratch)?;
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        info!("Closing sockets");
        self.streams.clear();
        Ok(())
    }
}

/// Hands every batch to another thread over a channel. Never blocks the pipeline,
/// a full queue is reported as a failure.
pub struct QueueSink {
    name: String,
    sender: Sender<Batch>,
}

impl QueueSink {
    pub fn new(name: impl Into<String>, sender: Sender<Batch>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

impl Consumer for QueueSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        self.sender.try_send(batch.clone()).map_err(|e| match e {
            TrySendError::Full(_) => consumer_error(&self.name, "queue full, batch dropped"),
            TrySendError::Disconnected(_) => consumer_error(&self.name, "receiver gone"),
        })
    }
}

/// Lossy feed for a rendering thread. A slow reader loses batches instead of
/// backing up the pipeline.
pub struct PlotFeed {
    producer: rtrb::Producer<Batch>,
    dropped: usize,
}

impl PlotFeed {
    pub fn new(capacity: usize) -> (Self, rtrb::Consumer<Batch>) {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        (
            Self {
                producer,
                dropped: 0,
            },
            consumer,
        )
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Consumer for PlotFeed {
    fn name(&self) -> &str {
        "plot"
    }

    fn on_batch(&mut self, batch: &Batch) -> Result<()> {
        if self.producer.is_abandoned() {
            return Err(consumer_error("plot", "reader gone"));
        }
        if self.producer.push(batch.clone()).is_err() {
            self.dropped += 1;
            debug!(dropped = self.dropped, "Plot feed full");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::parse_record, codec::FeedSample, metadata::DeviceMetadata};
    use crossbeam_channel::unbounded;
    use std::{
        io::{BufRead, BufReader, Read},
        net::TcpListener,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    fn meta() -> StreamMetadata {
        StreamMetadata {
            started: Utc::now(),
            device: DeviceMetadata::default(),
            front_end: Default::default(),
            calibration: None,
            uv_per_count: [0.1; CHANNELS],
            kernel_len: 5,
            filter_delay: 2,
        }
    }

    fn batch(range: std::ops::Range<u64>) -> Batch {
        Batch {
            timestamp: Utc::now(),
            readings: range
                .map(|i| Reading {
                    index: i,
                    raw: FeedSample::new([i as i32, -(i as i32), 7, -8_388_608]),
                    filtered: (i >= 2).then_some([i as f64; CHANNELS]),
                    tared: (i >= 4).then_some([0.5; CHANNELS]),
                })
                .collect(),
        }
    }

    struct Flaky {
        seen: Arc<Mutex<Vec<u64>>>,
        panic: bool,
    }

    impl Consumer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn on_batch(&mut self, batch: &Batch) -> Result<()> {
            self.seen.lock().unwrap().push(batch.readings[0].index);
            if self.panic {
                panic!("boom");
            }
            Err(consumer_error("flaky", "always fails"))
        }
    }

    #[test]
    fn test_fanout_isolates_failures() {
        let seen = Arc::new(Mutex::new(vec![]));
        let (tx, rx) = unbounded();
        let mut fanout = Fanout::new(vec![
            Box::new(Flaky {
                seen: seen.clone(),
                panic: true,
            }),
            Box::new(Flaky {
                seen: seen.clone(),
                panic: false,
            }),
            Box::new(QueueSink::new("queue", tx)),
        ]);
        fanout.start(&meta());
        fanout.dispatch(&batch(0..3));
        fanout.dispatch(&batch(3..5));
        fanout.stop();
        // Both flaky consumers were called for every batch, in order
        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 3, 3]);
        assert_eq!(fanout.failures(), 4);
        let got: Vec<Batch> = rx.try_iter().collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].readings[0].index, 3);
    }

    #[test]
    fn test_queue_sink_reports_full() {
        let (tx, _rx) = bounded(1);
        let mut sink = QueueSink::new("q", tx);
        assert!(sink.on_batch(&batch(0..1)).is_ok());
        assert!(matches!(
            sink.on_batch(&batch(1..2)),
            Err(Error::Consumer { .. })
        ));
    }

    #[test]
    fn test_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        let mut sink = CsvSink::new(&path);
        sink.on_start(&meta()).unwrap();
        sink.on_batch(&batch(0..5)).unwrap();
        sink.on_stop().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# CSV setup:"));
        assert!(lines[1].starts_with("# {"));
        assert_eq!(lines[2], CSV_COLUMNS.join(","));
        assert_eq!(lines[3], "0,0,0,7,-8388608,,,,,,,,");
        assert_eq!(lines[5], "2,2,-2,7,-8388608,2.0,2.0,2.0,2.0,,,,");
        assert_eq!(lines[7], "4,4,-4,7,-8388608,4.0,4.0,4.0,4.0,0.5,0.5,0.5,0.5");
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn test_records_replay_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut sink = RecordSink::new(&path);
        sink.on_start(&meta()).unwrap();
        sink.on_batch(&batch(0..3)).unwrap();
        sink.on_stop().unwrap();

        let file = BufReader::new(File::open(&path).unwrap());
        let samples: Vec<FeedSample> = file
            .lines()
            .filter_map(|l| parse_record(&l.unwrap()).unwrap())
            .collect();
        assert_eq!(samples, batch(0..3).readings.iter().map(|r| r.raw).collect::<Vec<_>>());
    }

    #[test]
    fn test_socket_wire_format() {
        let listeners: Vec<TcpListener> = (0..CHANNELS)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let addrs: [SocketAddr; CHANNELS] =
            std::array::from_fn(|ch| listeners[ch].local_addr().unwrap());

        let mut sink = SocketSink::new(addrs, Conversion::VoltsAdc);
        sink.on_start(&meta()).unwrap();
        sink.on_batch(&batch(0..2)).unwrap();
        sink.on_stop().unwrap();

        let read_ch = |ch: usize| {
            let (mut conn, _) = listeners[ch].accept().unwrap();
            let mut bytes = vec![];
            conn.read_to_end(&mut bytes).unwrap();
            bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect::<Vec<_>>()
        };
        // Default gains are [1, 4, 4, 1]
        assert_eq!(read_ch(0), vec![6_990_506, 0, 1]);
        assert_eq!(read_ch(1), vec![27_962_026, 0, -1]);
        assert_eq!(read_ch(3), vec![6_990_506, -8_388_608, -8_388_608]);
    }

    #[test]
    fn test_worker_runs_consumer_off_thread() {
        let (tx, rx) = unbounded();
        let mut worker = Worker::spawn(QueueSink::new("queue", tx), 16).unwrap();
        assert_eq!(worker.name(), "queue");
        worker.on_start(&meta()).unwrap();
        for i in 0..10 {
            worker.on_batch(&batch(i..i + 1)).unwrap();
        }
        worker.on_stop().unwrap();
        let indices: Vec<u64> = rx.iter().map(|b| b.readings[0].index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        // Stopped workers refuse further batches
        assert!(worker.on_batch(&batch(0..1)).is_err());
    }

    #[test]
    fn test_plot_feed_is_lossy() {
        let (mut feed, mut reader) = PlotFeed::new(2);
        for i in 0..5 {
            feed.on_batch(&batch(i..i + 1)).unwrap();
        }
        assert_eq!(feed.dropped(), 3);
        assert_eq!(reader.pop().unwrap().readings[0].index, 0);
        drop(reader);
        assert!(feed.on_batch(&batch(0..1)).is_err());
    }

    struct Slow;

    impl Consumer for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn on_batch(&mut self, _batch: &Batch) -> Result<()> {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    #[test]
    fn test_slow_worker_does_not_stall_fanout() {
        let mut fanout = Fanout::new(vec![Box::new(Worker::spawn(Slow, 1).unwrap())]);
        let t0 = Instant::now();
        for i in 0..4 {
            fanout.dispatch(&batch(i..i + 1));
        }
        assert!(t0.elapsed() < Duration::from_millis(150));
        // At most one batch in the worker and one in the queue
        assert!(fanout.failures() >= 2);
        fanout.stop();
    }
}
