use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::{ProgressError, Result};
use crate::models::{non_blank, EngineEvent, ProgressEvent, ProgressItem, ProgressStatus};
use crate::services::cancel_dispatcher::{CancelCommand, CancelDispatcher, CancelOutcome};
use crate::services::cancellation_guard::CancellationGuard;
use crate::services::event_ingress::{EngineEvents, EngineSubscription};
use crate::services::progress_table::{MergeKind, ProgressTable};
use crate::services::progress_views::{OwnerGroups, ProgressSnapshot, TrackerDiagnostics};
use crate::services::source_classifier::SourceClassifier;
use crate::services::terminal_reaper::{ReapDelays, ReapNotice, TerminalReaper};
use crate::utils::env::{env_millis, env_usize};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const MAX_CHANNEL_CAPACITY: usize = 16 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Grace period before completed, cancelled and stalled items disappear.
    pub completed_reap_delay: Duration,
    /// Grace period for failed items, long enough to read the error.
    pub failed_reap_delay: Duration,
    /// How long a confirmed cancellation keeps suppressing late events.
    pub cancel_suppression_ttl: Duration,
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            completed_reap_delay: Duration::from_secs(3),
            failed_reap_delay: Duration::from_secs(10),
            cancel_suppression_ttl: Duration::from_secs(30),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(600);
        Self {
            completed_reap_delay: env_millis("OTOSHI_PROGRESS_REAP_MS", min, max)
                .unwrap_or(defaults.completed_reap_delay),
            failed_reap_delay: env_millis("OTOSHI_PROGRESS_FAILED_REAP_MS", min, max)
                .unwrap_or(defaults.failed_reap_delay),
            cancel_suppression_ttl: env_millis("OTOSHI_PROGRESS_CANCEL_TTL_MS", min, max)
                .unwrap_or(defaults.cancel_suppression_ttl),
            channel_capacity: env_usize("OTOSHI_PROGRESS_CHANNEL_CAPACITY")
                .map(|value| value.clamp(1, MAX_CHANNEL_CAPACITY))
                .unwrap_or(defaults.channel_capacity),
        }
    }

    fn reap_delays(&self) -> ReapDelays {
        ReapDelays {
            settled: self.completed_reap_delay,
            failed: self.failed_reap_delay,
        }
    }
}

/// Everything the reconciliation task consumes, in arrival order.
pub(crate) enum TrackerMessage {
    Progress(ProgressEvent),
    CancellationNotice(String),
    MarkCancelPending {
        operation_id: String,
        reply: oneshot::Sender<bool>,
    },
    Reap(ReapNotice),
    Resume,
    Teardown {
        ack: oneshot::Sender<()>,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

impl From<EngineEvent> for TrackerMessage {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::Progress(event) => Self::Progress(event),
            EngineEvent::CancellationNotice { id } => Self::CancellationNotice(id),
        }
    }
}

/// State owned exclusively by the reconciliation task.
struct TrackerState {
    table: ProgressTable,
    guard: CancellationGuard,
    reaper: TerminalReaper<TrackerMessage>,
    classifier: SourceClassifier,
    diagnostics: TrackerDiagnostics,
    snapshots: watch::Sender<Arc<ProgressSnapshot>>,
}

impl TrackerState {
    /// Returns `false` once the task should exit.
    fn handle(&mut self, message: TrackerMessage) -> bool {
        match message {
            TrackerMessage::Progress(event) => self.apply_progress(event),
            TrackerMessage::CancellationNotice(id) => self.apply_notice(&id),
            TrackerMessage::MarkCancelPending {
                operation_id,
                reply,
            } => {
                let inserted = self.guard.mark_pending(&operation_id);
                self.publish();
                let _ = reply.send(inserted);
                return true;
            }
            TrackerMessage::Reap(notice) => {
                if self.reaper.take_due(&notice) && self.table.remove(&notice.id).is_some() {
                    self.diagnostics.items_reaped += 1;
                    tracing::debug!("reaped progress item id={}", notice.id);
                }
            }
            TrackerMessage::Resume => {
                for (id, status) in self.table.terminal_items() {
                    if !self.reaper.is_scheduled(&id) {
                        self.reaper.schedule(&id, &status);
                    }
                }
            }
            TrackerMessage::Teardown { ack } => {
                let timers = self.reaper.cancel_all();
                self.guard.clear();
                tracing::info!("progress tracker torn down, cancelled_reaps={}", timers);
                self.publish();
                let _ = ack.send(());
                return true;
            }
            TrackerMessage::Flush { ack } => {
                let _ = ack.send(());
                return true;
            }
            TrackerMessage::Shutdown => return false,
        }
        self.publish();
        true
    }

    fn apply_progress(&mut self, event: ProgressEvent) {
        if event.is_malformed() {
            self.diagnostics.malformed_events_dropped += 1;
            tracing::debug!("dropping progress event without id name={:?}", event.name);
            return;
        }

        let id = event.id.trim().to_string();
        if let Some(operation_id) = non_blank(event.operation_id.as_deref()) {
            if !event.status.is_terminal()
                && !self.table.contains(&id)
                && self
                    .guard
                    .is_recently_cancelled(operation_id, Instant::now())
            {
                self.diagnostics.late_events_dropped += 1;
                tracing::debug!(
                    "dropping late progress id={} operation_id={} status={}",
                    id,
                    operation_id,
                    event.status
                );
                return;
            }
        }

        let (kind, item) = self.table.merge(event, &self.classifier);
        let status = item.status.clone();
        let operation_key = item.operation_key().to_string();
        if kind == MergeKind::Inserted {
            tracing::debug!(
                "tracking progress item id={} operation={} source={:?}",
                id,
                operation_key,
                item.source
            );
        }

        if status.is_terminal() {
            self.reaper.schedule(&id, &status);
            if self.guard.clear_pending(&operation_key) {
                tracing::debug!(
                    "pending cancel settled by terminal status operation={} status={}",
                    operation_key,
                    status
                );
            }
        } else if self.guard.is_pending(&operation_key)
            || self
                .guard
                .is_recently_cancelled(&operation_key, Instant::now())
        {
            // In-flight update for a cancelled operation; its reap still runs.
            tracing::debug!(
                "late update keeps reap for cancelled operation id={} operation={}",
                id,
                operation_key
            );
        } else {
            self.reaper.cancel(&id);
        }
        self.diagnostics.upserts_applied += 1;
    }

    fn apply_notice(&mut self, raw_id: &str) {
        let notice_id = raw_id.trim();
        if notice_id.is_empty() {
            self.diagnostics.malformed_events_dropped += 1;
            tracing::debug!("dropping cancellation notice without id");
            return;
        }

        let now = Instant::now();
        self.guard.prune_expired(now);

        let mut ids = self.table.ids_for_operation(notice_id);
        let operation_id = if !ids.is_empty() {
            notice_id.to_string()
        } else if let Some(item) = self.table.get(notice_id) {
            let key = item.operation_key().to_string();
            ids.push(notice_id.to_string());
            if key != notice_id {
                self.guard.record_cancelled(notice_id, now);
            }
            key
        } else {
            notice_id.to_string()
        };

        let mut marked = 0usize;
        for id in ids {
            if self.table.mark_cancelled(&id) {
                self.reaper.schedule(&id, &ProgressStatus::Cancelled);
                marked += 1;
            }
        }
        self.guard.record_cancelled(&operation_id, now);
        self.diagnostics.notices_applied += 1;
        tracing::info!(
            "cancellation confirmed operation={} items_cancelled={}",
            operation_id,
            marked
        );
    }

    fn publish(&mut self) {
        self.diagnostics.pending_reaps = self.reaper.len();
        let snapshot = ProgressSnapshot::new(
            self.table.ordered(),
            self.guard.pending().clone(),
            self.diagnostics.clone(),
        );
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}

async fn run_reconciler(mut state: TrackerState, mut inbox: mpsc::Receiver<TrackerMessage>) {
    while let Some(message) = inbox.recv().await {
        if !state.handle(message) {
            break;
        }
    }
    state.reaper.cancel_all();
    tracing::debug!("progress reconciler stopped");
}

pub struct ProgressTrackerBuilder {
    events: Arc<dyn EngineEvents>,
    command: Arc<dyn CancelCommand>,
    config: TrackerConfig,
    classifier: SourceClassifier,
}

impl ProgressTrackerBuilder {
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn classifier(mut self, classifier: SourceClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Spawns the reconciliation task on the current tokio runtime.
    pub fn spawn(self) -> Result<ProgressTracker> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ProgressError::Config(
                "progress tracker requires a running tokio runtime".to_string(),
            ));
        }

        let (mailbox, inbox) = mpsc::channel(self.config.channel_capacity.max(1));
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(ProgressSnapshot::default()));
        let state = TrackerState {
            table: ProgressTable::new(),
            guard: CancellationGuard::new(self.config.cancel_suppression_ttl),
            reaper: TerminalReaper::new(
                self.config.reap_delays(),
                mailbox.downgrade(),
                TrackerMessage::Reap,
            ),
            classifier: self.classifier,
            diagnostics: TrackerDiagnostics::default(),
            snapshots: snapshot_tx,
        };
        tokio::spawn(run_reconciler(state, inbox));

        Ok(ProgressTracker {
            mailbox,
            snapshots,
            events: self.events,
            dispatcher: CancelDispatcher::new(self.command),
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            pump: Mutex::new(None),
        })
    }
}

/// Client-side view of every in-flight engine operation.
///
/// Engine events and cancel bookkeeping are applied by one background task
/// in arrival order; queries read the snapshot it publishes after each
/// change and never block on it.
pub struct ProgressTracker {
    mailbox: mpsc::Sender<TrackerMessage>,
    snapshots: watch::Receiver<Arc<ProgressSnapshot>>,
    events: Arc<dyn EngineEvents>,
    dispatcher: CancelDispatcher,
    active: AtomicBool,
    epoch: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    pub fn builder(
        events: Arc<dyn EngineEvents>,
        command: Arc<dyn CancelCommand>,
    ) -> ProgressTrackerBuilder {
        ProgressTrackerBuilder {
            events,
            command,
            config: TrackerConfig::default(),
            classifier: SourceClassifier::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Opens the engine subscription. Calling it while already active is a
    /// no-op; a start that loses a race with [`ProgressTracker::stop`] drops
    /// the subscription it opened.
    pub async fn start(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let subscription = match self.events.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.active.store(false, Ordering::SeqCst);
                }
                tracing::warn!("engine subscription failed: {}", err);
                return Err(err);
            }
        };
        if !self.owns_epoch(epoch) {
            tracing::debug!(
                "discarding subscription {} opened while stopping",
                subscription.id()
            );
            return Ok(());
        }

        self.send(TrackerMessage::Resume).await?;

        let mut pump = self
            .pump
            .lock()
            .map_err(|_| ProgressError::Config("ingress registry locked".to_string()))?;
        if !self.owns_epoch(epoch) {
            tracing::debug!(
                "discarding subscription {} opened while stopping",
                subscription.id()
            );
            return Ok(());
        }
        tracing::info!("engine subscription {} opened", subscription.id());
        if let Some(stale) = pump.replace(spawn_pump(subscription, self.mailbox.clone())) {
            stale.abort();
        }
        Ok(())
    }

    /// Releases the subscription, cancels every pending reap and clears the
    /// cancellation guard. Stopping a stopped tracker is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let pump = self
            .pump
            .lock()
            .map_err(|_| ProgressError::Config("ingress registry locked".to_string()))?
            .take();
        if let Some(handle) = pump {
            handle.abort();
        }

        let (ack, done) = oneshot::channel();
        self.send(TrackerMessage::Teardown { ack }).await?;
        done.await.map_err(|_| ProgressError::TrackerClosed)
    }

    /// Feeds one engine event directly, bypassing the subscription.
    pub async fn ingest(&self, event: EngineEvent) -> Result<()> {
        self.send(event.into()).await
    }

    /// Resolves once every message queued before it has been applied.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(TrackerMessage::Flush { ack }).await?;
        done.await.map_err(|_| ProgressError::TrackerClosed)
    }

    /// Marks `operation_id` as cancelling and asks the engine to cancel it.
    ///
    /// A dispatch error is returned but the operation stays pending until
    /// the engine reports a terminal status or a cancellation notice.
    pub async fn request_cancel(&self, operation_id: &str) -> Result<CancelOutcome> {
        let operation_id = operation_id.trim();
        if operation_id.is_empty() {
            return Ok(CancelOutcome::Ignored);
        }

        let (reply, marked) = oneshot::channel();
        self.send(TrackerMessage::MarkCancelPending {
            operation_id: operation_id.to_string(),
            reply,
        })
        .await?;
        if !marked.await.map_err(|_| ProgressError::TrackerClosed)? {
            return Ok(CancelOutcome::AlreadyPending);
        }

        self.dispatcher.dispatch(operation_id).await?;
        Ok(CancelOutcome::Dispatched)
    }

    pub fn is_cancelling(&self, operation_id: &str) -> bool {
        self.snapshot().is_cancelling(operation_id)
    }

    pub fn snapshot(&self) -> Arc<ProgressSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Change feed for consumers that re-render on every update.
    pub fn watch(&self) -> watch::Receiver<Arc<ProgressSnapshot>> {
        self.snapshots.clone()
    }

    pub fn active_items(&self) -> Vec<ProgressItem> {
        self.snapshot().active_items()
    }

    pub fn grouped_by_owner(&self) -> OwnerGroups {
        self.snapshot().grouped_by_owner()
    }

    pub fn total_throughput(&self) -> f64 {
        self.snapshot().total_throughput()
    }

    pub fn overall_completion_percent(&self) -> u8 {
        self.snapshot().overall_completion_percent()
    }

    pub fn diagnostics(&self) -> TrackerDiagnostics {
        self.snapshot().diagnostics().clone()
    }

    fn owns_epoch(&self, epoch: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn send(&self, message: TrackerMessage) -> Result<()> {
        self.mailbox
            .send(message)
            .await
            .map_err(|_| ProgressError::TrackerClosed)
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        let _ = self.mailbox.try_send(TrackerMessage::Shutdown);
    }
}

fn spawn_pump(
    mut subscription: EngineSubscription,
    mailbox: mpsc::Sender<TrackerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.next_event().await {
            if mailbox.send(event.into()).await.is_err() {
                break;
            }
        }
        tracing::debug!("engine subscription {} drained", subscription.id());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use futures_util::future::BoxFuture;
    use tokio::sync::Notify;

    use crate::services::event_ingress::ChannelEventSource;

    /// Hands out a fresh channel per subscription and counts them.
    #[derive(Default)]
    struct CountingEvents {
        subscriptions: AtomicUsize,
        senders: Mutex<Vec<mpsc::Sender<EngineEvent>>>,
        gate: Option<Arc<Notify>>,
    }

    impl CountingEvents {
        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn subscription_count(&self) -> usize {
            self.subscriptions.load(Ordering::SeqCst)
        }

        async fn emit(&self, event: EngineEvent) {
            let senders: Vec<mpsc::Sender<EngineEvent>> =
                self.senders.lock().expect("senders lock").clone();
            for sender in senders {
                let _ = sender.send(event.clone()).await;
            }
        }
    }

    impl EngineEvents for CountingEvents {
        fn subscribe(&self) -> BoxFuture<'_, Result<EngineSubscription>> {
            Box::pin(async move {
                if let Some(gate) = self.gate.as_ref() {
                    gate.notified().await;
                }
                self.subscriptions.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::channel(16);
                self.senders.lock().expect("senders lock").push(tx);
                Ok(EngineSubscription::new(rx))
            })
        }
    }

    #[derive(Default)]
    struct RecordingCommand {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingCommand {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl CancelCommand for RecordingCommand {
        fn cancel_operation<'a>(&'a self, operation_id: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .expect("calls lock")
                    .push(operation_id.to_string());
                if self.fail {
                    Err(ProgressError::Http("HTTP 500: engine offline".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn tracker_with(
        events: Arc<dyn EngineEvents>,
        command: Arc<dyn CancelCommand>,
    ) -> ProgressTracker {
        ProgressTracker::builder(events, command)
            .spawn()
            .expect("spawn tracker")
    }

    fn offline_tracker() -> (ProgressTracker, Arc<RecordingCommand>) {
        let (_tx, source) = ChannelEventSource::new(8);
        let command = Arc::new(RecordingCommand::default());
        (tracker_with(Arc::new(source), command.clone()), command)
    }

    fn progress(id: &str, status: ProgressStatus) -> EngineEvent {
        EngineEvent::Progress(ProgressEvent::new(id, status))
    }

    fn progress_in(id: &str, operation_id: &str, status: ProgressStatus) -> EngineEvent {
        EngineEvent::Progress(ProgressEvent::new(id, status).with_operation(operation_id))
    }

    fn notice(id: &str) -> EngineEvent {
        EngineEvent::CancellationNotice { id: id.to_string() }
    }

    async fn feed(tracker: &ProgressTracker, events: Vec<EngineEvent>) {
        for event in events {
            tracker.ingest(event).await.expect("ingest");
        }
        tracker.flush().await.expect("flush");
    }

    async fn wait_until<F>(tracker: &ProgressTracker, predicate: F)
    where
        F: Fn(&ProgressSnapshot) -> bool,
    {
        let mut updates = tracker.watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|snapshot| predicate(snapshot.as_ref())),
        )
        .await
        .expect("condition not reached in time")
        .expect("tracker closed");
    }

    #[tokio::test]
    async fn never_holds_two_records_for_one_id() {
        let (tracker, _) = offline_tracker();
        let mut events = Vec::new();
        for round in 0..20u64 {
            for id in ["a", "b", "c"] {
                events.push(EngineEvent::Progress(
                    ProgressEvent::new(id, ProgressStatus::Downloading)
                        .with_bytes(round, 100)
                        .with_owner("game-1"),
                ));
            }
        }
        feed(&tracker, events).await;

        let snapshot = tracker.snapshot();
        let ids: Vec<&str> = snapshot.all_items().iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(snapshot.item("b").map(|item| item.downloaded), Some(19));
        assert_eq!(tracker.diagnostics().upserts_applied, 60);
    }

    #[tokio::test]
    async fn source_survives_events_that_omit_it() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![
                EngineEvent::Progress(ProgressEvent::new("a", ProgressStatus::Active).with_source("x")),
                progress("a", ProgressStatus::Active),
            ],
        )
        .await;
        let item = tracker.snapshot().item("a").cloned().expect("item a");
        assert_eq!(item.source.as_deref(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_events_for_cancelled_operations_are_suppressed() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![notice("op1"), progress_in("z", "op1", ProgressStatus::Active)],
        )
        .await;
        assert!(tracker.snapshot().item("z").is_none());
        assert_eq!(tracker.diagnostics().late_events_dropped, 1);

        feed(&tracker, vec![progress_in("z", "op1", ProgressStatus::Completed)]).await;
        let item = tracker.snapshot().item("z").cloned().expect("terminal event admitted");
        assert_eq!(item.status, ProgressStatus::Completed);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("z").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_expires_and_spares_tracked_items() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![
                progress_in("known", "op1", ProgressStatus::Completed),
                notice("op1"),
                progress_in("known", "op1", ProgressStatus::Active),
            ],
        )
        .await;
        assert_eq!(
            tracker.snapshot().item("known").map(|item| item.status.clone()),
            Some(ProgressStatus::Active)
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        feed(&tracker, vec![progress_in("fresh", "op1", ProgressStatus::Active)]).await;
        assert!(tracker.snapshot().item("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_items_are_reaped_after_their_grace_period() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![
                progress("done", ProgressStatus::Completed),
                progress("broken", ProgressStatus::Failed),
            ],
        )
        .await;
        assert!(tracker.snapshot().item("done").is_some());
        assert!(tracker.snapshot().item("broken").is_some());
        assert_eq!(tracker.diagnostics().pending_reaps, 2);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("done").is_none());
        assert!(tracker.snapshot().item("broken").is_some());

        tokio::time::sleep(Duration::from_secs(7)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("broken").is_none());
        assert_eq!(tracker.diagnostics().items_reaped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_terminal_set_cancels_the_reap() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![
                progress("retry", ProgressStatus::Failed),
                progress("retry", ProgressStatus::Downloading),
            ],
        )
        .await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("retry").is_some());
        assert_eq!(tracker.diagnostics().pending_reaps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_arriving_after_cancel_notice_is_still_reaped() {
        let (tracker, _) = offline_tracker();
        feed(&tracker, vec![progress_in("f1", "op1", ProgressStatus::Downloading)]).await;
        tracker.request_cancel("op1").await.expect("cancel");
        feed(
            &tracker,
            vec![
                notice("op1"),
                progress_in("f1", "op1", ProgressStatus::Downloading),
            ],
        )
        .await;
        assert_eq!(tracker.diagnostics().pending_reaps, 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        tracker.flush().await.expect("flush");
        let snapshot = tracker.snapshot();
        assert!(snapshot.item("f1").is_none());
        assert!(snapshot.active_items().is_empty());
        assert_eq!(snapshot.diagnostics().pending_reaps, 0);
        assert_eq!(snapshot.diagnostics().items_reaped, 1);
    }

    #[tokio::test]
    async fn aggregation_reflects_active_items_only() {
        let (tracker, _) = offline_tracker();
        assert_eq!(tracker.overall_completion_percent(), 100);

        feed(
            &tracker,
            vec![
                EngineEvent::Progress(
                    ProgressEvent::new("a", ProgressStatus::Active)
                        .with_bytes(50, 100)
                        .with_speed(10.0)
                        .with_owner("game-1"),
                ),
                EngineEvent::Progress(
                    ProgressEvent::new("b", ProgressStatus::Active)
                        .with_bytes(25, 50)
                        .with_speed(5.0),
                ),
                EngineEvent::Progress(
                    ProgressEvent::new("c", ProgressStatus::Failed)
                        .with_bytes(0, 1_000)
                        .with_owner("game-1"),
                ),
            ],
        )
        .await;

        assert_eq!(tracker.overall_completion_percent(), 50);
        assert_eq!(tracker.total_throughput(), 15.0);
        assert_eq!(tracker.active_items().len(), 2);
        let groups = tracker.grouped_by_owner();
        assert_eq!(groups.owner("game-1").len(), 2);
        assert_eq!(groups.unowned.len(), 1);
    }

    #[tokio::test]
    async fn malformed_events_are_counted_and_dropped() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![progress("  ", ProgressStatus::Active), notice(""), progress("ok", ProgressStatus::Active)],
        )
        .await;
        let diagnostics = tracker.diagnostics();
        assert_eq!(diagnostics.malformed_events_dropped, 2);
        assert_eq!(diagnostics.upserts_applied, 1);
        assert_eq!(tracker.snapshot().all_items().len(), 1);
    }

    #[tokio::test]
    async fn start_twice_opens_one_subscription() {
        let events = Arc::new(CountingEvents::default());
        let tracker = tracker_with(events.clone(), Arc::new(RecordingCommand::default()));
        tracker.start().await.expect("first start");
        tracker.start().await.expect("second start");
        assert_eq!(events.subscription_count(), 1);

        events.emit(progress("a", ProgressStatus::Active)).await;
        wait_until(&tracker, |snapshot| snapshot.diagnostics().upserts_applied >= 1).await;
        tracker.flush().await.expect("flush");
        assert_eq!(tracker.diagnostics().upserts_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reaps() {
        let events = Arc::new(CountingEvents::default());
        let tracker = tracker_with(events.clone(), Arc::new(RecordingCommand::default()));
        tracker.start().await.expect("start");
        feed(&tracker, vec![progress("done", ProgressStatus::Completed)]).await;

        tracker.stop().await.expect("stop");
        assert!(!tracker.is_active());
        assert_eq!(tracker.diagnostics().pending_reaps, 0);

        tokio::time::sleep(Duration::from_secs(15)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("done").is_some());
        assert_eq!(tracker.diagnostics().items_reaped, 0);

        tracker.stop().await.expect("second stop is a no-op");

        tracker.start().await.expect("restart");
        tracker.flush().await.expect("flush");
        assert_eq!(tracker.diagnostics().pending_reaps, 1);
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("done").is_none());
    }

    #[tokio::test]
    async fn stop_clears_guard_state() {
        let events = Arc::new(CountingEvents::default());
        let tracker = tracker_with(events.clone(), Arc::new(RecordingCommand::default()));
        tracker.start().await.expect("start");
        feed(&tracker, vec![notice("op1")]).await;
        tracker.request_cancel("op2").await.expect("request cancel");
        assert!(tracker.is_cancelling("op2"));

        tracker.stop().await.expect("stop");
        assert!(!tracker.is_cancelling("op2"));

        tracker.start().await.expect("restart");
        feed(&tracker, vec![progress_in("z", "op1", ProgressStatus::Active)]).await;
        assert!(tracker.snapshot().item("z").is_some());
    }

    #[tokio::test]
    async fn start_racing_stop_does_not_resurrect_the_subscription() {
        let gate = Arc::new(Notify::new());
        let events = Arc::new(CountingEvents::gated(gate.clone()));
        let tracker = Arc::new(tracker_with(events.clone(), Arc::new(RecordingCommand::default())));

        let starting = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.start().await })
        };
        tokio::task::yield_now().await;
        while !tracker.is_active() {
            tokio::task::yield_now().await;
        }
        tracker.stop().await.expect("stop");
        gate.notify_one();
        starting.await.expect("join").expect("start");

        assert!(!tracker.is_active());
        events.emit(progress("ghost", ProgressStatus::Active)).await;
        tracker.flush().await.expect("flush");
        tokio::task::yield_now().await;
        tracker.flush().await.expect("flush");
        assert!(tracker.snapshot().item("ghost").is_none());
    }

    #[tokio::test]
    async fn request_cancel_marks_pending_until_terminal() {
        let (tracker, command) = offline_tracker();
        feed(&tracker, vec![progress_in("f1", "op1", ProgressStatus::Downloading)]).await;

        assert_eq!(tracker.request_cancel("").await.expect("blank"), CancelOutcome::Ignored);
        assert_eq!(
            tracker.request_cancel("op1").await.expect("cancel"),
            CancelOutcome::Dispatched
        );
        assert!(tracker.is_cancelling("op1"));
        assert_eq!(
            tracker.request_cancel("op1").await.expect("repeat"),
            CancelOutcome::AlreadyPending
        );
        assert_eq!(command.calls(), vec!["op1".to_string()]);

        feed(&tracker, vec![progress_in("f1", "op1", ProgressStatus::Cancelled)]).await;
        assert!(!tracker.is_cancelling("op1"));
    }

    #[tokio::test]
    async fn failed_dispatch_keeps_the_pending_flag() {
        let (_tx, source) = ChannelEventSource::new(8);
        let command = Arc::new(RecordingCommand::failing());
        let tracker = tracker_with(Arc::new(source), command.clone());

        let err = tracker.request_cancel("op1").await.expect_err("dispatch fails");
        assert!(matches!(err, ProgressError::CancelDispatch { .. }));
        assert!(tracker.is_cancelling("op1"));

        feed(&tracker, vec![notice("op1")]).await;
        assert!(!tracker.is_cancelling("op1"));
    }

    #[tokio::test]
    async fn notices_match_operation_first_then_item_id() {
        let (tracker, _) = offline_tracker();
        feed(
            &tracker,
            vec![
                progress_in("f1", "op1", ProgressStatus::Downloading),
                progress_in("f2", "op1", ProgressStatus::Downloading),
                progress_in("op1", "other", ProgressStatus::Downloading),
                progress("solo", ProgressStatus::Downloading),
            ],
        )
        .await;
        tracker.request_cancel("solo").await.expect("cancel solo");

        feed(&tracker, vec![notice("op1"), notice("solo")]).await;
        let snapshot = tracker.snapshot();
        let status = |id: &str| snapshot.item(id).map(|item| item.status.clone());
        assert_eq!(status("f1"), Some(ProgressStatus::Cancelled));
        assert_eq!(status("f2"), Some(ProgressStatus::Cancelled));
        assert_eq!(status("op1"), Some(ProgressStatus::Downloading));
        assert_eq!(status("solo"), Some(ProgressStatus::Cancelled));
        assert!(!snapshot.is_cancelling("solo"));
        assert_eq!(snapshot.active_items().len(), 1);
        assert_eq!(snapshot.diagnostics().notices_applied, 2);
    }

    #[test]
    fn spawning_outside_a_runtime_is_a_config_error() {
        let (_tx, source) = ChannelEventSource::new(1);
        let result = ProgressTracker::builder(
            Arc::new(source),
            Arc::new(RecordingCommand::default()),
        )
        .spawn();
        assert!(matches!(result, Err(ProgressError::Config(_))));
    }
}
