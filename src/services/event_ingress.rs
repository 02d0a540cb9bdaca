use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{ProgressError, Result};
use crate::models::EngineEvent;

const LINE_BUFFER: usize = 256;

/// One open subscription to the engine's progress and cancellation
/// channels. Dropping it releases the subscription.
pub struct EngineSubscription {
    id: Uuid,
    events: mpsc::Receiver<EngineEvent>,
}

impl EngineSubscription {
    pub fn new(events: mpsc::Receiver<EngineEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }
}

/// Source of engine events.
pub trait EngineEvents: Send + Sync {
    fn subscribe(&self) -> BoxFuture<'_, Result<EngineSubscription>>;
}

/// In-process source: whatever is sent on the paired [`mpsc::Sender`] is
/// delivered to the current subscriber. Only one subscriber may be open.
pub struct ChannelEventSource {
    receiver: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
}

impl ChannelEventSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<EngineEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                receiver: Mutex::new(Some(rx)),
            },
        )
    }
}

impl EngineEvents for ChannelEventSource {
    fn subscribe(&self) -> BoxFuture<'_, Result<EngineSubscription>> {
        Box::pin(async move {
            let receiver = self
                .receiver
                .lock()
                .map_err(|_| ProgressError::Subscription("event source lock poisoned".to_string()))?
                .take()
                .ok_or_else(|| {
                    ProgressError::Subscription("event channel already subscribed".to_string())
                })?;
            Ok(EngineSubscription::new(receiver))
        })
    }
}

/// Newline-delimited JSON events read from an async reader, e.g. the
/// backend sidecar's stdout.
pub struct LineEventSource<R> {
    reader: Mutex<Option<R>>,
}

impl<R> LineEventSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl<R> EngineEvents for LineEventSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn subscribe(&self) -> BoxFuture<'_, Result<EngineSubscription>> {
        Box::pin(async move {
            let reader = self
                .reader
                .lock()
                .map_err(|_| ProgressError::Subscription("event reader lock poisoned".to_string()))?
                .take()
                .ok_or_else(|| {
                    ProgressError::Subscription("event reader already subscribed".to_string())
                })?;

            let (tx, rx) = mpsc::channel(LINE_BUFFER);
            tokio::spawn(async move {
                let mut lines = reader.lines();
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!("engine event stream read failed: {}", err);
                            break;
                        }
                    };
                    let Some(event) = decode_line(&line) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("engine event stream closed");
            });
            Ok(EngineSubscription::new(rx))
        })
    }
}

pub fn decode_line(line: &str) -> Option<EngineEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<EngineEvent>(trimmed) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::debug!("skipping undecodable engine event: {}", err);
            None
        }
    }
}
