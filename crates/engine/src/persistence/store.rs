//! Store trait definitions

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{EventId, EventRecord};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record not found
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A batched write returned a different number of outcomes than requested
    #[error("batch returned {actual} outcomes for {expected} writes")]
    BatchMismatch { expected: usize, actual: usize },

    /// The write did not complete within the configured timeout
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
}

/// A single pending write
#[derive(Debug, Clone)]
pub enum PendingWrite {
    /// Insert a record that has no id yet
    Insert(EventRecord),

    /// Overwrite a record only if its processing date still matches
    ConditionalUpdate {
        id: EventId,
        expected_processing_date: Option<DateTime<Utc>>,
        record: EventRecord,
    },
}

/// Result of a single pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Insert succeeded with the store-assigned id
    Inserted(EventId),

    /// Conditional update matched this many records (0 means conflict)
    Updated { modified: u64 },
}

impl WriteOutcome {
    /// Whether the write took effect
    pub fn is_applied(&self) -> bool {
        match self {
            Self::Inserted(_) => true,
            Self::Updated { modified } => *modified > 0,
        }
    }
}

/// An ordered list of pending writes sent in one request
///
/// Outcomes come back positionally: the outcome at index `i` belongs to the
/// write at index `i`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<PendingWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: PendingWrite) -> usize {
        self.writes.push(write);
        self.writes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<PendingWrite> {
        self.writes
    }
}

/// Store for document event records
///
/// Implementations must be thread-safe and support concurrent access from
/// many workers. Only single-record operations need to be atomic.
#[async_trait]
pub trait DocumentEventStore: Send + Sync + 'static {
    /// Find records that are unprocessed, or processing with a processing date
    /// before `expired_before`
    ///
    /// Results are sorted by priority descending, then creation date ascending.
    async fn find_unprocessed_or_expired(
        &self,
        event_types: &[String],
        limit: usize,
        expired_before: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Insert a new record, returning its id
    async fn insert(&self, record: &EventRecord) -> Result<EventId, StoreError>;

    /// Overwrite a record if its stored processing date equals
    /// `expected_processing_date`
    ///
    /// Returns the number of records modified, 0 on conflict.
    async fn conditional_update(
        &self,
        id: EventId,
        expected_processing_date: Option<DateTime<Utc>>,
        record: &EventRecord,
    ) -> Result<u64, StoreError>;

    /// Load a record by id
    async fn get(&self, id: EventId) -> Result<EventRecord, StoreError>;

    /// Execute a batch of writes
    ///
    /// Must be observably equivalent to executing each write in order.
    async fn execute_batch(&self, batch: WriteBatch) -> Result<Vec<WriteOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for write in batch.into_writes() {
            let outcome = match write {
                PendingWrite::Insert(record) => WriteOutcome::Inserted(self.insert(&record).await?),
                PendingWrite::ConditionalUpdate {
                    id,
                    expected_processing_date,
                    record,
                } => WriteOutcome::Updated {
                    modified: self
                        .conditional_update(id, expected_processing_date, &record)
                        .await?,
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Store for advisory leases
///
/// A lease is held by at most one owner at a time and expires when its TTL
/// elapses without a ping.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Claim `resource_id` for `owner` if it is free or expired
    async fn acquire_lease(
        &self,
        owner: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lease by its TTL if `owner` still holds it
    async fn ping_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError>;

    /// Release the lease if `owner` holds it
    async fn release_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError>;
}
