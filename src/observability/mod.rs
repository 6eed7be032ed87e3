//! # Observability Infrastructure
//!
//! Structured logging for the bootstrap process. Logs go to stderr so that
//! subcommands printing credentials or reports keep stdout clean.
//!
//! Metrics are emitted through the `metrics` facade (retries, published
//! records, run outcomes). No recorder is installed by this crate; the
//! counters are no-ops unless an embedding process installs one.

pub mod logging;

pub use logging::log_config_info;

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` with
/// `verbose`. A subscriber that is already installed is left in place.
pub fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder =
        FmtSubscriber::builder().with_env_filter(filter).with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
    if let Err(e) = result {
        // A subscriber installed earlier (a test harness, an embedding
        // binary) keeps receiving events.
        tracing::debug!(error = %e, "Global subscriber already set");
    }
}
