use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::errors::{ProgressError, Result};

/// Outbound cancel command to the engine. Completion is only ever observed
/// through the engine's event stream.
pub trait CancelCommand: Send + Sync {
    fn cancel_operation<'a>(&'a self, operation_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Marked pending and handed to the engine.
    Dispatched,
    /// A cancel for this operation is still awaiting confirmation.
    AlreadyPending,
    /// Blank operation id.
    Ignored,
}

#[derive(Clone)]
pub struct CancelDispatcher {
    command: Arc<dyn CancelCommand>,
}

impl CancelDispatcher {
    pub fn new(command: Arc<dyn CancelCommand>) -> Self {
        Self { command }
    }

    /// Issues the command. Failures are reported to the caller but leave the
    /// pending mark alone: the engine may have acted on the request anyway.
    pub async fn dispatch(&self, operation_id: &str) -> Result<()> {
        match self.command.cancel_operation(operation_id).await {
            Ok(()) => {
                tracing::info!("cancel dispatched operation_id={}", operation_id);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(
                    "cancel dispatch failed operation_id={} error={}",
                    operation_id,
                    err
                );
                Err(match err {
                    err @ ProgressError::CancelDispatch { .. } => err,
                    other => ProgressError::CancelDispatch {
                        operation_id: operation_id.to_string(),
                        message: other.to_string(),
                    },
                })
            }
        }
    }
}

/// Command that only logs; used when no engine endpoint is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingCancelCommand;

impl CancelCommand for LoggingCancelCommand {
    fn cancel_operation<'a>(&'a self, operation_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tracing::warn!(
                "no cancel endpoint configured, dropping cancel for operation_id={}",
                operation_id
            );
            Ok(())
        })
    }
}
