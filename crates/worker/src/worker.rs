// Publish worker
// Decision: Expired claims are skipped rather than marked; another worker reclaims them
// Decision: Publish outcomes of one cycle are recorded with a single batched write

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use docevents_engine::{DocumentEventRepository, RepositoryError};

use crate::config::WorkerConfig;
use crate::poller::IdleBackoff;
use crate::publisher::{publish_event, DocumentPublisher};

/// Counters for one poll cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Claims that ran out of time before publishing
    pub expired: usize,
    /// Outcomes that could not be written back
    pub unrecorded: usize,
}

/// Worker that claims document events and publishes them
pub struct PublishWorker {
    worker_id: String,
    repository: Arc<DocumentEventRepository>,
    publisher: Arc<dyn DocumentPublisher>,
    backoff: IdleBackoff,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PublishWorker {
    pub fn new(
        config: &WorkerConfig,
        repository: Arc<DocumentEventRepository>,
        publisher: Arc<dyn DocumentPublisher>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            worker_id: config.worker_id.clone(),
            repository,
            publisher,
            backoff: IdleBackoff::new(config.poller.clone()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Run the worker (blocking until shutdown)
    pub async fn run(&mut self) -> Result<()> {
        info!(worker_id = %self.worker_id, "Starting publish worker");

        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            let pause = match self.run_once().await {
                Ok(stats) if stats.claimed > 0 => {
                    self.backoff.after_cycle(stats.claimed);
                    continue;
                }
                Ok(_) => self.backoff.after_cycle(0),
                Err(e) => {
                    error!(error = %e, "Error retrieving events");
                    self.backoff.grow()
                }
            };

            trace!(pause_ms = pause.as_millis() as u64, "Queue idle, pausing");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!(worker_id = %self.worker_id, "Publish worker stopped");
        Ok(())
    }

    /// Signal the worker to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle that stops the worker from another task
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Claim, publish and record one batch of events
    pub async fn run_once(&mut self) -> Result<CycleStats, RepositoryError> {
        if *self.shutdown_rx.borrow() {
            return Ok(CycleStats::default());
        }
        let events = self.repository.retrieve().await?;
        let mut stats = CycleStats {
            claimed: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(stats);
        }

        let mut published = Vec::new();
        let mut failed = Vec::new();

        for event in events {
            if let Err(e) = self.repository.ensure_active(&event) {
                warn!(event_id = ?event.id(), error = %e, "Skipping expired claim");
                stats.expired += 1;
                continue;
            }

            match publish_event(self.publisher.as_ref(), &event).await {
                Ok(()) => {
                    debug!(event_id = ?event.id(), "Event published");
                    published.push(event);
                }
                Err(e) => {
                    warn!(event_id = ?event.id(), error = %e, "Event publish failed");
                    failed.push((event, e.to_string()));
                }
            }
        }

        stats.published = published.len();
        stats.failed = failed.len();

        let outcome = self
            .repository
            .mark_published_or_failed(published, failed)
            .await?;
        for failure in &outcome.failures {
            warn!(error = %failure, "Failed to record publish outcome");
        }
        stats.unrecorded = outcome.failures.len();

        info!(
            worker_id = %self.worker_id,
            claimed = stats.claimed,
            published = stats.published,
            failed = stats.failed,
            expired = stats.expired,
            "Completed publish cycle"
        );
        Ok(stats)
    }
}
