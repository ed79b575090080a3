use crate::error::{CliError, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, Targets},
    fmt::{self, format::FmtSpan},
    prelude::*,
    registry::LookupSpan,
};

/// Crates whose events follow `-v`/`-q`. Dependencies stay at WARN or quieter.
const SIMULATION_TARGETS: [&str; 2] = ["stemsim", "stemsim_cli"];

pub fn console_level(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::ERROR;
    }
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

pub fn console_filter(verbosity: u8, quiet: bool) -> Targets {
    let level = console_level(verbosity, quiet);
    SIMULATION_TARGETS.iter().fold(
        Targets::new().with_default(level.min(LevelFilter::WARN)),
        |targets, target| targets.with_target(*target, level),
    )
}

/// The log file keeps the full simulation trace, including one `close` record
/// per workflow, ensemble, series and pipeline span with its busy time.
fn file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let filter = SIMULATION_TARGETS.iter().fold(
        Targets::new().with_default(LevelFilter::WARN),
        |targets, target| targets.with_target(*target, LevelFilter::DEBUG),
    );
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(filter)
}

pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<PathBuf>) -> Result<()> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(console_filter(verbosity, quiet));

    let file = match log_file {
        Some(path) => Some(file_layer(File::create(&path).map_err(CliError::Io)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to install logger: {}", e)))
}
