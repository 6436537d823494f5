use anyhow::{anyhow, Context};
use clap::Parser;
use crossbeam_channel::bounded;
use dynamite_slurper::{
    args::{convert_filter, Args},
    capture::{replay_file, udp_link, ReplayPacing},
    codec::Framing,
    config::Config,
    exfil::{default_path, Consumer, CsvSink, PlotFeed, RecordSink, SocketSink, Worker},
    metadata::{DeviceMetadata, LoadCellCalibration},
    monitoring::monitor_feed,
    pipeline::Pipeline,
    CHANNELS,
};
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::{error, info, warn};

const DEFAULT_UDP: &str = "0.0.0.0:6000";

fn resolve_socket_addrs(hosts: &[String]) -> anyhow::Result<[SocketAddr; CHANNELS]> {
    let addrs = hosts
        .iter()
        .map(|host| {
            host.to_socket_addrs()?
                .next()
                .ok_or_else(|| anyhow!("{host} did not resolve"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    addrs
        .try_into()
        .map_err(|_| anyhow!("expected one address per channel"))
}

fn main() -> anyhow::Result<()> {
    // Get the CLI options
    let args = Args::parse();
    // Logger
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    // Setup the exit handler
    let shutdown = Arc::new(AtomicBool::new(false));
    let sd = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("CTRL-C, stopping");
        sd.store(true, Ordering::Relaxed);
    })?;

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if args.legacy {
        config.protocol.framing = Some(Framing::Legacy);
    }

    // Device metadata falls back to the configured defaults
    let device = match &args.metadata {
        Some(path) => match DeviceMetadata::parse(&fs::read(path)?) {
            Ok(meta) => {
                info!(?meta, "Device metadata");
                Some(meta)
            }
            Err(e) => {
                warn!(error = %e, "Unusable device metadata, using configured defaults");
                None
            }
        },
        None => None,
    };
    let mut stream = config.resolve(device)?;
    if let Some(path) = &args.calibration {
        match LoadCellCalibration::parse(&fs::read(path)?) {
            Ok(cal) => {
                info!(words = ?cal.words, "Load cell calibration");
                stream.calibration = Some(cal);
            }
            Err(e) => warn!(error = %e, "Unusable load cell calibration, ignoring"),
        }
    }

    // Build the sinks
    let mut consumers: Vec<Box<dyn Consumer>> = vec![];
    if let Some(csv) = &args.csv {
        let path = csv.clone().unwrap_or_else(|| default_path("dynamite", "csv"));
        info!(path = %path.display(), "Logging CSV");
        consumers.push(Box::new(Worker::spawn(
            CsvSink::new(path),
            args.sink_capacity,
        )?));
    }
    if let Some(path) = &args.records {
        consumers.push(Box::new(Worker::spawn(
            RecordSink::new(path),
            args.sink_capacity,
        )?));
    }
    if let Some(hosts) = args.socket_addrs() {
        let addrs = resolve_socket_addrs(&hosts)?;
        consumers.push(Box::new(Worker::spawn(
            SocketSink::new(addrs, args.conversion),
            args.sink_capacity,
        )?));
    }
    let monitor = if args.monitor {
        let (feed, reader) = PlotFeed::new(args.sink_capacity);
        consumers.push(Box::new(feed));
        let sd = shutdown.clone();
        let interval = stream.stats_interval;
        Some(thread::spawn(move || monitor_feed(reader, interval, &sd)))
    } else {
        None
    };

    // Start the source
    let (sender, receiver) = bounded(config.ingest.queue_capacity);
    let source = {
        let sd = shutdown.clone();
        let poll = stream.recv_timeout;
        match &args.replay {
            Some(path) => {
                let path = path.clone();
                let pacing = ReplayPacing {
                    rate_hz: args
                        .rate
                        .or(config.ingest.replay_rate_hz)
                        .unwrap_or(stream.sample_rate_hz),
                    chunk: config.ingest.replay_chunk,
                };
                thread::spawn(move || {
                    if let Err(e) = replay_file(&path, pacing, &sender, &sd) {
                        error!(error = %e, "Replay failed");
                    }
                })
            }
            None => {
                let addr = match args.udp {
                    Some(addr) => addr,
                    None => DEFAULT_UDP.parse()?,
                };
                let socket = UdpSocket::bind(addr)?;
                thread::spawn(move || {
                    if let Err(e) = udp_link(socket, poll, &sender, &sd) {
                        error!(error = %e, "Link failed");
                    }
                })
            }
        }
    };

    // Run until ctrl-c or the source hangs up
    let summary = Pipeline::new(stream, consumers).run(receiver, &shutdown);
    // The source may be blocked on a full queue, it exits once it sees the hangup
    shutdown.store(true, Ordering::Relaxed);
    if source.join().is_err() {
        warn!("Source thread panicked");
    }
    if let Some(monitor) = monitor {
        if let Ok(readings) = monitor.join() {
            info!(readings, "Monitor finished");
        }
    }
    info!(
        samples = summary.samples,
        batches = summary.batches,
        failures = summary.consumer_failures,
        "Done"
    );
    Ok(())
}
