//! xavyo sync runner
//!
//! Runs one full or delta synchronization of a connected system against
//! the metaverse and prints the run summary as JSON on stdout.

mod config;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::RunnerConfig;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;
use xavyo_metaverse::{ActivityId, ConnectedSystemId};
use xavyo_sync::{
    CancellationFlag, PgSyncRepository, SyncMode, SyncRequest, SyncRunPhase, SyncRunSummary,
    SyncRunner,
};

/// Synchronize one connected system with the metaverse
#[derive(Parser, Debug)]
#[command(name = "xavyo-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Connected system to synchronize
    #[arg(long, env = "SYNC_CONNECTED_SYSTEM_ID")]
    connected_system: Uuid,

    /// Run mode: full or delta
    #[arg(long, default_value = "full")]
    mode: SyncMode,

    /// Activity to file execution items under (generated when omitted)
    #[arg(long)]
    activity: Option<Uuid>,

    /// Evaluate everything but write nothing
    #[arg(long)]
    dry_run: bool,

    /// Objects per page, overriding SYNC_PAGE_SIZE
    #[arg(long)]
    page_size: Option<usize>,

    /// Pretty-print the summary
    #[arg(long)]
    pretty: bool,
}

impl Cli {
    fn request(&self) -> SyncRequest {
        let system = ConnectedSystemId::from_uuid(self.connected_system);
        let request = match self.mode {
            SyncMode::Full => SyncRequest::full(system),
            SyncMode::Delta => SyncRequest::delta(system),
        };
        match self.activity {
            Some(activity) => request.with_activity(ActivityId::from_uuid(activity)),
            None => request,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RunnerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.rust_log, config.log_format) {
        eprintln!("Error: invalid log filter: {e}");
        return ExitCode::FAILURE;
    }

    let request = cli.request();
    let span = logging::run_span(&request, cli.dry_run);
    let summary = run(&cli, &config, request).instrument(span).await;
    match summary {
        Some(summary) => {
            print_summary(&summary, cli.pretty);
            ExitCode::from(exit_status(&summary))
        }
        None => ExitCode::FAILURE,
    }
}

/// Connect, run and return the summary. `None` when the database is unreachable.
async fn run(cli: &Cli, config: &RunnerConfig, request: SyncRequest) -> Option<SyncRunSummary> {
    let pool = match PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => {
            info!("Database connection established");
            pool
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return None;
        }
    };

    let mut engine = config.engine.clone().with_dry_run(cli.dry_run);
    if let Some(page_size) = cli.page_size {
        engine = engine.with_page_size(page_size);
    }

    let cancellation = CancellationFlag::new();
    tokio::spawn(cancel_on_signal(cancellation.clone()).in_current_span());

    let runner = SyncRunner::new(Arc::new(PgSyncRepository::new(pool)))
        .with_config(engine)
        .with_cancellation(cancellation);

    Some(runner.run(request).await)
}

/// Request cancellation on Ctrl+C or SIGTERM. The run stops at the next
/// object boundary and keeps the pages already flushed.
async fn cancel_on_signal(cancellation: CancellationFlag) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    warn!("Shutdown signal received, cancelling sync run");
    cancellation.cancel();
}

fn print_summary(summary: &SyncRunSummary, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(summary)
    } else {
        serde_json::to_string(summary)
    };
    match rendered {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Failed to serialize run summary"),
    }
}

/// 0 when the run completed, 2 when it was cancelled, 1 otherwise.
fn exit_status(summary: &SyncRunSummary) -> u8 {
    match summary.status {
        SyncRunPhase::Completed => 0,
        SyncRunPhase::Cancelled => 2,
        _ => 1,
    }
}
