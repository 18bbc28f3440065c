//! Mock FastEvent server.
//!
//! Binds to `localhost` on the port from the service configuration, echoes
//! every 2-byte request back to its sender and writes a JSON log of request
//! arrival times and indices when done.
//!
//! # Usage
//!
//! ```sh
//! fe-mock-server mockserver.log.json -i service.cfg -c 10000 -l 500
//! ```
//!
//! The server stops after `capacity` requests or on a termination payload
//! (`0x03`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fastevent::config::{DEFAULT_CONFIG_PATH, ServiceConfig};
use fastevent::mock::{self, DEFAULT_LOG_PATH, MockConfig, MockError};

/// Runs a mock FastEvent server.
#[derive(Parser)]
#[command(name = "fe-mock-server")]
#[command(version)]
struct Cli {
    /// File to write the request log to
    #[arg(default_value = DEFAULT_LOG_PATH)]
    outfile: PathBuf,

    /// Service configuration file
    #[arg(short, long = "input", default_value = DEFAULT_CONFIG_PATH)]
    input: PathBuf,

    /// Number of requests logged before the server stops
    #[arg(short, long, default_value_t = 10_000)]
    capacity: usize,

    /// Delay from request reception to response dispatch, in microseconds
    #[arg(short, long = "lag-us", alias = "lag_us", default_value_t = 0)]
    lag_us: u64,

    /// Log every request
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    fastevent::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("fe-mock-server: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), MockError> {
    let service = ServiceConfig::load(&cli.input)?;
    let config = MockConfig {
        capacity: cli.capacity,
        lag: Duration::from_micros(cli.lag_us),
        verbose: cli.verbose,
    };
    let log = mock::serve(&service, config, &cli.outfile)?;
    eprintln!(
        "fe-mock-server: {} request(s) logged to {}",
        log.len(),
        cli.outfile.display()
    );
    Ok(())
}
