//! Lease-coordinated retrieval and persistence of document events
//!
//! A retrieval fetches candidate records, groups them by identity under an
//! advisory lease, folds each group through an [`OptimizationBatch`] and writes
//! the outcome back with optimistic concurrency. Only events this worker has
//! successfully claimed as `processing` are returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::config::RepositoryConfig;
use crate::error::RepositoryError;
use crate::event::{DocumentEvent, Event, EventId, EventRecord, EventStatus, EventTypeRegistry, Identity};
use crate::lease::{Lease, LeaseManager};
use crate::optimizer::{DocumentEventUpdate, OptimizationBatch};
use crate::persistence::{
    DocumentEventStore, LeaseStore, PendingWrite, StoreError, WriteBatch, WriteOutcome,
};

/// Result of [`DocumentEventRepository::mark_published_or_failed`]
#[derive(Debug, Default)]
pub struct MarkOutcome {
    /// Number of records whose status was written
    pub applied: usize,
    /// Records that could not be written, not retried
    pub failures: Vec<RepositoryError>,
}

impl MarkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An identity's batch together with the lease guarding it
struct LeasedBatch {
    lease: Lease,
    batch: OptimizationBatch,
}

/// Entry point for workers
///
/// # Example
///
/// ```ignore
/// let repository = DocumentEventRepository::new(store.clone(), store, registry, config);
///
/// for event in repository.retrieve().await? {
///     repository.ensure_active(&event)?;
///     // publish ...
/// }
/// ```
pub struct DocumentEventRepository {
    store: Arc<dyn DocumentEventStore>,
    leases: LeaseManager,
    registry: Arc<EventTypeRegistry>,
    config: RepositoryConfig,
}

impl DocumentEventRepository {
    pub fn new(
        store: Arc<dyn DocumentEventStore>,
        lease_store: Arc<dyn LeaseStore>,
        registry: Arc<EventTypeRegistry>,
        config: RepositoryConfig,
    ) -> Self {
        let leases = LeaseManager::new(lease_store, config.lease.clone());
        Self {
            store,
            leases,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Persist a new `unprocessed` event
    #[instrument(skip(self, document), fields(event_type = %document.event_type()))]
    pub async fn submit(
        &self,
        document: Arc<dyn DocumentEvent>,
        priority: i32,
    ) -> Result<EventId, RepositoryError> {
        if !self.registry.contains(document.event_type()) {
            warn!("submitting event of a type this repository does not retrieve");
        }

        let record = Event::new(document, priority)
            .into_record()
            .with_creation_date(now());
        let id = self.store.insert(&record).await?;

        debug!(%id, "event submitted");
        Ok(id)
    }

    /// [`retrieve_up_to`](Self::retrieve_up_to) with the configured cap
    pub async fn retrieve(&self) -> Result<Vec<Event>, RepositoryError> {
        self.retrieve_up_to(self.config.max_events_per_retrieval)
            .await
    }

    /// Claim up to `max_events` distinct identities worth of events
    ///
    /// Records whose identity cannot be leased, or that would exceed the cap,
    /// are left for a later cycle. Losing a lease or a write conflict drops
    /// only the affected events. Only a failure to reach the store is returned
    /// as an error; all acquired leases are released either way.
    #[instrument(skip(self))]
    pub async fn retrieve_up_to(&self, max_events: usize) -> Result<Vec<Event>, RepositoryError> {
        if max_events == 0 {
            return Ok(vec![]);
        }

        let now = now();
        let expired_before = now - chrono_duration(self.config.processing_timeout);
        let mut records = self
            .store
            .find_unprocessed_or_expired(&self.registry.types(), self.config.batch_size, expired_before)
            .await?;
        sort_for_optimization(&mut records);

        let mut batches = self.lease_and_optimize(records, max_events, now).await;
        let result = self.persist(&mut batches).await;

        join_all(batches.iter_mut().map(|leased| leased.lease.close())).await;

        if let Ok(events) = &result {
            info!(
                identities = batches.len(),
                claimed = events.len(),
                "retrieved events"
            );
        }
        result
    }

    async fn lease_and_optimize(
        &self,
        records: Vec<EventRecord>,
        max_events: usize,
        now: DateTime<Utc>,
    ) -> Vec<LeasedBatch> {
        let mut batches: Vec<LeasedBatch> = Vec::new();
        let mut by_identity: HashMap<Identity, usize> = HashMap::new();
        let mut skipped: HashSet<Identity> = HashSet::new();

        for record in records {
            let event = self.registry.parse(record);
            let identity = event.identity();
            if skipped.contains(&identity) {
                continue;
            }

            let index = match by_identity.get(&identity) {
                Some(&index) => index,
                None if batches.len() >= max_events => {
                    debug!(%identity, max_events, "identity cap reached, skipping");
                    skipped.insert(identity);
                    continue;
                }
                None => match self.leases.try_acquire(&identity.lease_resource_id()).await {
                    Ok(lease) => {
                        by_identity.insert(identity.clone(), batches.len());
                        batches.push(LeasedBatch {
                            lease,
                            batch: OptimizationBatch::new(identity),
                        });
                        batches.len() - 1
                    }
                    Err(e) => {
                        debug!(%identity, error = %e, "identity leased elsewhere, skipping");
                        skipped.insert(identity);
                        continue;
                    }
                },
            };

            batches[index].batch.offer(event, now);
        }

        batches
    }

    async fn persist(&self, batches: &mut [LeasedBatch]) -> Result<Vec<Event>, RepositoryError> {
        let mut updates: Vec<DocumentEventUpdate> = Vec::new();

        for leased in batches.iter_mut() {
            let identity = leased.batch.identity().clone();
            match leased
                .lease
                .check_live_or_fail(&format!("persisting {identity}"))
                .await
            {
                Ok(()) => updates.extend(leased.batch.take_updates()),
                Err(e) => {
                    warn!(%identity, error = %e, "lease lost, dropping pending updates");
                    leased.batch.take_updates();
                }
            }
        }

        if updates.is_empty() {
            return Ok(vec![]);
        }

        let mut batch = WriteBatch::new();
        for update in &updates {
            batch.push(update.to_write());
        }
        let outcomes = self.execute(batch).await?;

        let conflicted: HashSet<EventId> = updates
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| **outcome == WriteOutcome::Updated { modified: 0 })
            .filter_map(|(update, _)| update.event.id())
            .collect();

        let mut claimed = Vec::new();
        for (update, outcome) in updates.into_iter().zip(outcomes) {
            let event = match outcome {
                WriteOutcome::Inserted(id) => {
                    let record = update.event.record();
                    if record.survivor_of_ids.iter().any(|input| conflicted.contains(input)) {
                        warn!(
                            event_id = %id,
                            "merged event claimed although one of its inputs conflicted, \
                             the input may be delivered separately"
                        );
                    }
                    update.event.with_id(id)
                }
                WriteOutcome::Updated { modified: 0 } => {
                    warn!(
                        event_id = ?update.event.id(),
                        status = %update.event.status(),
                        "conflict detected, dropping event"
                    );
                    continue;
                }
                WriteOutcome::Updated { .. } => update.event,
            };
            let event = event.persisted();
            if event.status() == EventStatus::Processing {
                claimed.push(event);
            }
        }

        Ok(claimed)
    }

    /// Run a write batch under the configured timeout
    async fn execute(&self, batch: WriteBatch) -> Result<Vec<WriteOutcome>, RepositoryError> {
        let expected = batch.len();
        let outcomes = tokio::time::timeout(self.config.write_timeout, self.store.execute_batch(batch))
            .await
            .map_err(|_| StoreError::Timeout(self.config.write_timeout))??;

        if outcomes.len() != expected {
            return Err(StoreError::BatchMismatch {
                expected,
                actual: outcomes.len(),
            }
            .into());
        }
        Ok(outcomes)
    }

    /// Fail when the event is too close to its processing timeout
    ///
    /// Past `processing_date + processing_timeout - expire_threshold` another
    /// worker may reclaim the event, so the caller must not publish it.
    pub fn ensure_active(&self, event: &Event) -> Result<(), RepositoryError> {
        let processing_date = match (event.status(), event.record().processing_date) {
            (EventStatus::Processing, Some(date)) => date,
            _ => {
                return Err(RepositoryError::NotProcessing {
                    event_id: event.id(),
                })
            }
        };

        let deadline = processing_date + chrono_duration(self.config.processing_timeout)
            - chrono_duration(self.config.expire_threshold);
        if Utc::now() > deadline {
            return Err(RepositoryError::Expired {
                event_id: event.id(),
                deadline,
            });
        }
        Ok(())
    }

    /// Record publish outcomes
    ///
    /// Best effort: each event is written conditionally on the processing
    /// date this worker stored. Events that are not claimed, or whose write
    /// conflicts, are reported in [`MarkOutcome::failures`]. A store failure
    /// fails the whole call.
    #[instrument(skip_all, fields(published = published.len(), failed = failed.len()))]
    pub async fn mark_published_or_failed(
        &self,
        published: Vec<Event>,
        failed: Vec<(Event, String)>,
    ) -> Result<MarkOutcome, RepositoryError> {
        let now = now();
        let mut outcome = MarkOutcome::default();
        let mut batch = WriteBatch::new();
        let mut ids = Vec::new();

        let finished = published
            .into_iter()
            .map(|event| event.into_published(now))
            .chain(
                failed
                    .into_iter()
                    .map(|(event, cause)| event.into_failed(now, cause)),
            );

        for event in finished {
            let expected_processing_date = event.observed_processing_date();
            let record = event.record();
            match record.id {
                Some(id) if expected_processing_date.is_some() => {
                    batch.push(PendingWrite::ConditionalUpdate {
                        id,
                        expected_processing_date,
                        record: record.clone(),
                    });
                    ids.push(id);
                }
                event_id => outcome
                    .failures
                    .push(RepositoryError::NotProcessing { event_id }),
            }
        }

        if batch.is_empty() {
            return Ok(outcome);
        }

        let outcomes = self.execute(batch).await?;
        for (event_id, write) in ids.into_iter().zip(outcomes) {
            if write.is_applied() {
                outcome.applied += 1;
            } else {
                warn!(%event_id, "conflict detected while marking event");
                outcome.failures.push(RepositoryError::Conflict { event_id });
            }
        }

        debug!(
            applied = outcome.applied,
            failures = outcome.failures.len(),
            "marked events"
        );
        Ok(outcome)
    }
}

/// Current time at the precision the stores keep
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Stable order for records that the store ranked as equal
fn sort_for_optimization(records: &mut [EventRecord]) {
    records.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.creation_date.cmp(&b.creation_date))
            .then(a.id.cmp(&b.id))
    });
}
