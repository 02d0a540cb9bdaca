use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use otoshi_progress::errors::Result;
use otoshi_progress::logging;
use otoshi_progress::services::{
    decode_line, ApiClient, CancelCommand, CancelOutcome, ChannelEventSource, DownloadService,
    LoggingCancelCommand, ProgressSnapshot, ProgressTracker, TrackerConfig,
};
use otoshi_progress::utils::env::{env_string, env_truthy};
use otoshi_progress::utils::paths::resolve_log_dir;

/// Stdin lines addressed to the tracker rather than coming from the engine.
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostCommand {
    RequestCancel {
        #[serde(rename = "operationId", alias = "operation_id")]
        operation_id: String,
    },
}

impl HostCommand {
    fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Printed on stdout once a cancel request has been handled.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelReport {
    operation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<CancelOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    items: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotSummary {
    active: usize,
    tracked: usize,
    throughput_bps: f64,
    percent: u8,
    eta_seconds: Option<u64>,
    pending: Vec<String>,
}

impl From<&ProgressSnapshot> for SnapshotSummary {
    fn from(snapshot: &ProgressSnapshot) -> Self {
        let mut pending: Vec<String> = snapshot.pending_cancels().iter().cloned().collect();
        pending.sort();
        Self {
            active: snapshot.active_items().len(),
            tracked: snapshot.all_items().len(),
            throughput_bps: snapshot.total_throughput(),
            percent: snapshot.overall_completion_percent(),
            eta_seconds: snapshot.estimated_seconds_remaining(),
            pending,
        }
    }
}

fn init_logging() {
    let file_logging = if env_truthy("OTOSHI_LOG_STDERR") {
        None
    } else {
        resolve_log_dir()
    };
    let result = match file_logging {
        Some(dir) => logging::init(&dir),
        None => logging::init_stderr(),
    };
    if let Err(err) = result {
        eprintln!("otoshi-progress: logging disabled: {}", err);
    }
}

fn cancel_command() -> Arc<dyn CancelCommand> {
    match env_string("OTOSHI_API_URL") {
        Some(base_url) => {
            let api = ApiClient::new(base_url, env_string("OTOSHI_API_TOKEN"));
            tracing::info!("cancel commands routed to {}", api.base_url());
            Arc::new(DownloadService::new(api))
        }
        None => Arc::new(LoggingCancelCommand),
    }
}

fn print_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(err) => tracing::warn!("failed to encode output line: {}", err),
    }
}

fn print_summary(snapshot: &ProgressSnapshot) {
    print_line(&SnapshotSummary::from(snapshot));
}

async fn cancel_and_report(tracker: Arc<ProgressTracker>, operation_id: String) -> CancelReport {
    let result = tracker.request_cancel(&operation_id).await;
    let items = tracker.snapshot().items_for_operation(&operation_id).len();
    match result {
        Ok(outcome) => {
            tracing::info!(
                "cancel request operation_id={} outcome={:?}",
                operation_id,
                outcome
            );
            CancelReport {
                operation_id,
                outcome: Some(outcome),
                error: None,
                items,
            }
        }
        Err(err) => {
            tracing::warn!("cancel request failed operation_id={}: {}", operation_id, err);
            CancelReport {
                operation_id,
                outcome: None,
                error: Some(err.to_string()),
                items,
            }
        }
    }
}

/// Waits for every cancel request read from stdin to finish.
async fn drain_cancels(pending: Vec<JoinHandle<CancelReport>>) -> Vec<CancelReport> {
    let mut reports = Vec::with_capacity(pending.len());
    for joined in join_all(pending).await {
        match joined {
            Ok(report) => reports.push(report),
            Err(err) => tracing::warn!("cancel request task failed: {}", err),
        }
    }
    reports
}

fn spawn_reporter(mut updates: watch::Receiver<Arc<ProgressSnapshot>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            print_summary(&snapshot);
        }
    })
}

async fn run() -> Result<()> {
    let config = TrackerConfig::from_env();
    let (engine_tx, source) = ChannelEventSource::new(config.channel_capacity);
    let tracker = Arc::new(
        ProgressTracker::builder(Arc::new(source), cancel_command())
            .config(config)
            .spawn()?,
    );
    tracker.start().await?;
    let reporter = spawn_reporter(tracker.watch());

    let mut forwarded: u64 = 0;
    let mut cancels = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(HostCommand::RequestCancel { operation_id }) = HostCommand::parse(&line) {
            cancels.push(tokio::spawn(cancel_and_report(tracker.clone(), operation_id)));
            continue;
        }

        let Some(event) = decode_line(&line) else {
            continue;
        };
        if engine_tx.send(event).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    drop(engine_tx);

    for report in drain_cancels(cancels).await {
        print_line(&report);
    }

    let mut updates = tracker.watch();
    if updates
        .wait_for(|snapshot| snapshot.diagnostics().events_processed() >= forwarded)
        .await
        .is_err()
    {
        tracing::warn!(
            "tracker closed before consuming {} forwarded engine events",
            forwarded
        );
    }
    tracker.flush().await?;
    print_summary(&tracker.snapshot());

    tracker.stop().await?;
    reporter.abort();
    tracing::info!("input closed after {} engine events", forwarded);
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!("otoshi-progress failed: {}", err);
        eprintln!("otoshi-progress: {}", err);
        std::process::exit(1);
    }
}
