pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use errors::{ProgressError, Result};
pub use models::{EngineEvent, ProgressEvent, ProgressItem, ProgressStatus};
pub use services::{
    CancelCommand, CancelOutcome, EngineEvents, EngineSubscription, OwnerGroups, ProgressSnapshot,
    ProgressTracker, SourceClassifier, SourceRule, TrackerConfig, TrackerDiagnostics,
};
