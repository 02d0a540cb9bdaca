pub mod api_client;
pub mod cancel_dispatcher;
pub mod cancellation_guard;
pub mod download_service;
pub mod event_ingress;
pub mod progress_table;
pub mod progress_tracker;
pub mod progress_views;
pub mod source_classifier;
pub mod terminal_reaper;

pub use api_client::ApiClient;
pub use cancel_dispatcher::{CancelCommand, CancelDispatcher, CancelOutcome, LoggingCancelCommand};
pub use cancellation_guard::CancellationGuard;
pub use download_service::DownloadService;
pub use event_ingress::{
    decode_line, ChannelEventSource, EngineEvents, EngineSubscription, LineEventSource,
};
pub use progress_table::{MergeKind, ProgressTable};
pub use progress_tracker::{ProgressTracker, ProgressTrackerBuilder, TrackerConfig};
pub use progress_views::{OwnerGroups, ProgressSnapshot, TrackerDiagnostics};
pub use source_classifier::{SourceClassifier, SourceRule};
pub use terminal_reaper::{ReapDelays, ReapNotice, TerminalReaper};
