use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Subscription error: {0}")]
    Subscription(String),
    #[error("Cancel dispatch failed for {operation_id}: {message}")]
    CancelDispatch {
        operation_id: String,
        message: String,
    },
    #[error("progress tracker is no longer running")]
    TrackerClosed,
}

pub type Result<T> = std::result::Result<T, ProgressError>;
