//! Publishing seam
//!
//! The worker hands every claimed event to a [`DocumentPublisher`]. The
//! publisher decides what delivery means; the worker only records the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use docevents_engine::{DocumentEvent, Event};

/// Publish failure, recorded as the event's failure cause
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event could not be interpreted
    #[error("unparseable event: {0}")]
    Unparseable(String),

    /// The downstream system rejected the event
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Delivers claimed events downstream
#[async_trait]
pub trait DocumentPublisher: Send + Sync + 'static {
    async fn publish(&self, document: &dyn DocumentEvent) -> Result<(), PublishError>;
}

/// Publish an event, routing unparseable events to failure
pub async fn publish_event(
    publisher: &dyn DocumentPublisher,
    event: &Event,
) -> Result<(), PublishError> {
    let document = event
        .document()
        .map_err(|failure| PublishError::Unparseable(failure.to_string()))?;
    publisher.publish(document).await
}

/// Publisher that only logs each event
#[derive(Debug, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl DocumentPublisher for LoggingPublisher {
    async fn publish(&self, document: &dyn DocumentEvent) -> Result<(), PublishError> {
        info!(
            event_type = document.event_type(),
            identity = %document.identity(),
            "published event"
        );
        Ok(())
    }
}

/// Publisher that records identities and can be told to reject some
#[derive(Debug, Default, Clone)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<String>>>,
    rejected: Arc<Mutex<Vec<String>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject events whose identity renders as `identity`
    pub fn reject(&self, identity: impl Into<String>) {
        self.rejected.lock().push(identity.into());
    }

    /// Identities published so far, in order
    pub fn published(&self) -> Vec<String> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DocumentPublisher for RecordingPublisher {
    async fn publish(&self, document: &dyn DocumentEvent) -> Result<(), PublishError> {
        let identity = document.identity().to_string();
        if self.rejected.lock().contains(&identity) {
            return Err(PublishError::Rejected(identity));
        }
        self.published.lock().push(identity);
        Ok(())
    }
}
