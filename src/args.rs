//! Argument parsing for running from the command line

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::metadata::Conversion;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file, every field is optional
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Replay a file of JSON sample records instead of listening for notifications
    #[clap(short, long, conflicts_with = "udp")]
    pub replay: Option<PathBuf>,
    /// Address to receive relayed radio notifications on, one per datagram
    #[clap(short, long)]
    pub udp: Option<SocketAddr>,
    /// Replay rate in samples per second, 0 for as fast as possible
    #[clap(long)]
    pub rate: Option<f64>,
    /// Decode the legacy 15-byte record framing
    #[clap(long)]
    pub legacy: bool,
    /// Raw device metadata characteristic dump
    #[clap(short, long)]
    pub metadata: Option<PathBuf>,
    /// Raw load cell calibration characteristic dump
    #[clap(long)]
    pub calibration: Option<PathBuf>,
    /// Write a CSV log, to a timestamped file under data/ if no path is given
    #[clap(long)]
    #[allow(clippy::option_option)]
    pub csv: Option<Option<PathBuf>>,
    /// Write raw samples as replayable JSON records
    #[clap(long)]
    pub records: Option<PathBuf>,
    /// Stream raw channel values to this host, one TCP connection per channel
    #[clap(short, long)]
    pub socket: Option<String>,
    /// First of the four consecutive per-channel ports
    #[clap(long, default_value_t = 5000)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..65533))]
    pub port: u16,
    /// Units the socket scale factor converts to
    #[clap(long, value_enum, default_value = "volts-opamp")]
    pub conversion: Conversion,
    /// Log the latest readings periodically
    #[clap(long)]
    pub monitor: bool,
    /// Capacity of each sink's queue, in batches
    #[clap(long, default_value_t = 64)]
    pub sink_capacity: usize,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn socket_addrs(&self) -> Option<Vec<String>> {
        let host = self.socket.as_ref()?;
        Some(
            (0..crate::CHANNELS as u16)
                .map(|ch| format!("{host}:{}", self.port + ch))
                .collect(),
        )
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["dynamite_slurper"]);
        assert!(args.replay.is_none());
        assert!(args.udp.is_none());
        assert_eq!(args.conversion, Conversion::VoltsOpamp);
        assert!(args.csv.is_none());
        assert!(args.socket_addrs().is_none());
    }

    #[test]
    fn test_sinks() {
        let args = Args::parse_from([
            "dynamite_slurper",
            "--replay",
            "log.jsonl",
            "--csv",
            "--socket",
            "localhost",
            "--port",
            "7000",
            "--conversion",
            "kg-with-opamp",
        ]);
        assert_eq!(args.replay, Some(PathBuf::from("log.jsonl")));
        assert_eq!(args.csv, Some(None));
        assert_eq!(args.conversion, Conversion::KgWithOpamp);
        assert_eq!(
            args.socket_addrs().unwrap(),
            vec![
                "localhost:7000",
                "localhost:7001",
                "localhost:7002",
                "localhost:7003"
            ]
        );
    }
}
