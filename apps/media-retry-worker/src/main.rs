//! Media retry worker (C10): periodically drains `MediaJob` records the
//! inbound pipeline (C6 step 7) could not download synchronously.
//!
//! `run` loops on a fixed interval until `SIGINT`/`SIGTERM` or
//! `MEDIA_RETRY_WORKER_MAX_RUNS` is reached, finishing the in-flight cycle
//! before exiting (§5). `drain` runs one cycle and exits, for cron-style
//! deployment or manual operator use.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use leadengine_wa_pipeline::{drain_due, DrainSummary, PipelineDeps, DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL_SECS};
use leadengine_wa_telemetry::{init_telemetry, TelemetryConfig};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const SERVICE_NAME: &str = "leadengine-wa-media-retry-worker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about = "WhatsApp inbound media retry worker")]
struct Cli {
    /// Emit JSON output instead of a human-readable line per cycle.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the periodic drain loop until interrupted.
    Run {
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_runs: Option<u64>,
    },
    /// Run a single drain pass and exit.
    Drain {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Serialize)]
struct SummaryReport {
    processed: usize,
    succeeded: usize,
    rescheduled: usize,
    dead_lettered: usize,
    leases_lost: usize,
}

impl From<DrainSummary> for SummaryReport {
    fn from(s: DrainSummary) -> Self {
        Self {
            processed: s.processed,
            succeeded: s.succeeded,
            rescheduled: s.rescheduled,
            dead_lettered: s.dead_lettered,
            leases_lost: s.leases_lost,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry_cfg = TelemetryConfig::from_env(SERVICE_NAME, SERVICE_VERSION);
    init_telemetry(telemetry_cfg)?;

    let deps = build_deps();

    match cli.command {
        Commands::Run { interval_ms, batch_size, max_runs } => {
            let interval = Duration::from_millis(
                interval_ms.unwrap_or_else(|| env_u64("MEDIA_RETRY_WORKER_INTERVAL_MS", DEFAULT_INTERVAL_SECS * 1000)),
            );
            let batch_size = batch_size.unwrap_or_else(|| env_usize("MEDIA_RETRY_WORKER_BATCH_SIZE", DEFAULT_BATCH_SIZE));
            let max_runs = max_runs.or_else(|| env_u64_opt("MEDIA_RETRY_WORKER_MAX_RUNS"));
            run_loop(&deps, interval, batch_size, max_runs, cli.json).await;
        }
        Commands::Drain { batch_size } => {
            let batch_size = batch_size.unwrap_or_else(|| env_usize("MEDIA_RETRY_WORKER_BATCH_SIZE", DEFAULT_BATCH_SIZE));
            let summary = drain_due(&deps, batch_size, OffsetDateTime::now_utc()).await;
            report(summary, cli.json);
        }
    }

    Ok(())
}

/// Builds the worker's collaborators. Like `apps/webhook-ingress`, falls
/// back to `leadengine-wa-testkit`'s in-memory fakes when `DATABASE_URL`
/// is not set, rather than failing to start.
fn build_deps() -> PipelineDeps {
    let harness = leadengine_wa_testkit::TestHarness::new();
    let store: leadengine_wa_core::SharedStore = if std::env::var("DATABASE_URL").is_err() {
        tracing::warn!("DATABASE_URL not set; running with read-only in-memory degraded storage");
        Arc::new(leadengine_wa_testkit::DegradedStore::new(harness.store.clone()))
    } else {
        harness.shared_store()
    };
    PipelineDeps {
        store,
        broker: harness.shared_broker(),
        media_store: harness.shared_media_store(),
        realtime: harness.shared_realtime(),
        provisioner: harness.shared_provisioner(),
        allocator: harness.shared_allocator(),
        dlq: Arc::new(leadengine_wa_dlq::LoggingDlqSink),
    }
}

async fn run_loop(deps: &PipelineDeps, interval: Duration, batch_size: usize, max_runs: Option<u64>, json: bool) {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal, finishing current cycle");
            signal_token.cancel();
        }
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut runs: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("media retry worker shutting down");
                break;
            }
            _ = ticker.tick() => {
                let summary = drain_due(deps, batch_size, OffsetDateTime::now_utc()).await;
                if !summary.is_empty() {
                    report(summary, json);
                }
                runs += 1;
                if let Some(max_runs) = max_runs {
                    if runs >= max_runs {
                        tracing::info!(runs, "reached MEDIA_RETRY_WORKER_MAX_RUNS, exiting");
                        break;
                    }
                }
            }
        }
    }
}

fn report(summary: DrainSummary, json: bool) {
    if json {
        let payload = SummaryReport::from(summary);
        println!("{}", serde_json::to_string(&payload).unwrap_or_default());
    } else if summary.is_empty() {
        println!("no media jobs due");
    } else {
        println!(
            "processed={} succeeded={} rescheduled={} dead_lettered={} leases_lost={}",
            summary.processed, summary.succeeded, summary.rescheduled, summary.dead_lettered, summary.leases_lost
        );
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64_opt(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_report_preserves_all_fields() {
        let summary = DrainSummary { processed: 3, succeeded: 1, rescheduled: 1, dead_lettered: 1, leases_lost: 0 };
        let report: SummaryReport = summary.into();
        assert_eq!(report.processed, 3);
        assert_eq!(report.dead_lettered, 1);
    }

    #[test]
    fn env_u64_falls_back_to_default_when_unset() {
        assert_eq!(env_u64("MEDIA_RETRY_WORKER_DOES_NOT_EXIST_VAR", 42), 42);
    }

    #[test]
    fn env_u64_opt_is_none_when_unset() {
        assert_eq!(env_u64_opt("MEDIA_RETRY_WORKER_DOES_NOT_EXIST_VAR"), None);
    }
}
