//! Round-trip latency test client.
//!
//! Connects to the service from the configuration file, sends event requests
//! at a fixed rate and writes a JSON log of request/response times.
//!
//! # Usage
//!
//! ```sh
//! fe-latency latency.log.json -i service.cfg -N 1000 -F 5000
//! ```

use std::path::PathBuf;

use clap::Parser;
use fastevent::config::{DEFAULT_CONFIG_PATH, DEFAULT_HOST, ServiceConfig};
use fastevent::latency::{self, LatencyConfig, LatencyError};

/// Tests the round-trip latency of the service.
#[derive(Parser)]
#[command(name = "fe-latency")]
#[command(version)]
struct Cli {
    /// File to write the latency log to
    logfile: PathBuf,

    /// Service configuration file
    #[arg(short, long = "input", default_value = DEFAULT_CONFIG_PATH)]
    input: PathBuf,

    /// Host the service runs on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Number of requests to send
    #[arg(short = 'N', long, default_value_t = 1000)]
    number: usize,

    /// Approximate request rate per second
    #[arg(short = 'F', long, default_value_t = 5000)]
    freq: u32,

    /// Log every request and response
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] fastevent::config::ConfigError),
    #[error(transparent)]
    Latency(#[from] LatencyError),
}

fn main() {
    fastevent::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("fe-latency: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let service = ServiceConfig::load(&cli.input)?;
    let config = LatencyConfig {
        number: cli.number,
        freq: cli.freq,
        verbose: cli.verbose,
        ..LatencyConfig::default()
    };
    let log = latency::measure(&service, &cli.host, config, &cli.logfile)?;

    let summary = log.summary();
    eprintln!(
        "fe-latency: {}/{} answered, written to {}",
        summary.answered,
        summary.sent,
        cli.logfile.display()
    );
    Ok(())
}
