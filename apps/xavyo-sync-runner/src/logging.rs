//! Log output for sync runs.
//!
//! Logs go to stderr so stdout carries only the run summary. Every event
//! emitted during a run is tagged with the `sync_run` span, so the system,
//! mode and activity appear on each JSON line.

use tracing::{info_span, Span};
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};
use xavyo_sync::SyncRequest;

/// Shape of log lines on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    #[default]
    Json,
    /// Single-line human readable output.
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {s}")),
        }
    }
}

/// `RUST_LOG` when set, otherwise the configured directive.
fn build_filter(fallback: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns the parse error when the filter directive is invalid.
pub fn init_logging(filter: &str, format: LogFormat) -> Result<(), ParseError> {
    let filter_layer = build_filter(filter)?;

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .init();
    Ok(())
}

/// Span covering one run of the runner.
pub fn run_span(request: &SyncRequest, dry_run: bool) -> Span {
    info_span!(
        "sync_run",
        connected_system_id = %request.connected_system_id,
        mode = %request.mode,
        activity_id = %request.activity_id,
        dry_run,
    )
}
