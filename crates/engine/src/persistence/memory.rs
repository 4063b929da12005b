//! In-memory implementation of the document event and lease stores

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::store::*;
use crate::event::{EventId, EventRecord, EventStatus};

/// Internal lease state
struct LeaseEntry {
    owner: String,
    ttl: Duration,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory implementation of [`DocumentEventStore`] and [`LeaseStore`]
///
/// This is primarily for testing. It provides the same semantics as the
/// PostgreSQL implementation, plus fault injection: forced write conflicts,
/// failing lease pings and a full outage switch.
///
/// # Example
///
/// ```
/// use docevents_engine::InMemoryDocumentEventStore;
///
/// let store = InMemoryDocumentEventStore::new();
/// assert_eq!(store.record_count(), 0);
/// ```
pub struct InMemoryDocumentEventStore {
    records: RwLock<HashMap<EventId, EventRecord>>,
    leases: RwLock<HashMap<String, LeaseEntry>>,
    forced_conflicts: RwLock<HashSet<EventId>>,
    failing_pings: AtomicBool,
    unavailable: AtomicBool,
    lease_acquisitions: AtomicUsize,
}

impl InMemoryDocumentEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            forced_conflicts: RwLock::new(HashSet::new()),
            failing_pings: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            lease_acquisitions: AtomicUsize::new(0),
        }
    }

    /// Get the number of records
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Records currently in the given status
    pub fn records_with_status(&self, status: EventStatus) -> Vec<EventRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Current non-expired holder of a lease
    pub fn lease_holder(&self, resource_id: &str) -> Option<String> {
        self.leases
            .read()
            .get(resource_id)
            .filter(|l| !l.is_expired())
            .map(|l| l.owner.clone())
    }

    /// Number of non-expired leases
    pub fn active_lease_count(&self) -> usize {
        self.leases.read().values().filter(|l| !l.is_expired()).count()
    }

    /// Number of lease acquisition attempts seen, successful or not
    pub fn lease_acquisition_attempts(&self) -> usize {
        self.lease_acquisitions.load(Ordering::SeqCst)
    }

    /// Make every conditional update of `id` report a conflict
    pub fn force_conflict(&self, id: EventId) {
        self.forced_conflicts.write().insert(id);
    }

    /// Make lease pings fail with a database error
    pub fn set_failing_pings(&self, failing: bool) {
        self.failing_pings.store(failing, Ordering::SeqCst);
    }

    /// Make every operation fail with a database error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a record unconditionally, simulating another writer
    pub fn overwrite(&self, record: EventRecord) -> Result<(), StoreError> {
        let id = record.id.ok_or_else(|| {
            StoreError::Serialization("cannot overwrite a record without id".to_string())
        })?;
        self.records.write().insert(id, record);
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.records.write().clear();
        self.leases.write().clear();
        self.forced_conflicts.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryDocumentEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentEventStore for InMemoryDocumentEventStore {
    async fn find_unprocessed_or_expired(
        &self,
        event_types: &[String],
        limit: usize,
        expired_before: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.check_available()?;

        let records = self.records.read();
        let mut found: Vec<EventRecord> = records
            .values()
            .filter(|r| event_types.contains(&r.event_type))
            .filter(|r| match r.status {
                EventStatus::Unprocessed => true,
                EventStatus::Processing => r
                    .processing_date
                    .map_or(true, |date| date < expired_before),
                _ => false,
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.creation_date.cmp(&b.creation_date))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn insert(&self, record: &EventRecord) -> Result<EventId, StoreError> {
        self.check_available()?;

        let id = Uuid::now_v7();
        let mut stored = record.clone();
        stored.id = Some(id);
        self.records.write().insert(id, stored);
        Ok(id)
    }

    async fn conditional_update(
        &self,
        id: EventId,
        expected_processing_date: Option<DateTime<Utc>>,
        record: &EventRecord,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        if self.forced_conflicts.read().contains(&id) {
            return Ok(0);
        }

        let mut records = self.records.write();
        match records.get_mut(&id) {
            Some(current) if current.processing_date == expected_processing_date => {
                let mut updated = record.clone();
                updated.id = Some(id);
                *current = updated;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get(&self, id: EventId) -> Result<EventRecord, StoreError> {
        self.check_available()?;

        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl LeaseStore for InMemoryDocumentEventStore {
    async fn acquire_lease(
        &self,
        owner: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.lease_acquisitions.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut leases = self.leases.write();
        if let Some(existing) = leases.get(resource_id) {
            if !existing.is_expired() && existing.owner != owner {
                return Ok(false);
            }
        }

        leases.insert(
            resource_id.to_string(),
            LeaseEntry {
                owner: owner.to_string(),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn ping_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        if self.failing_pings.load(Ordering::SeqCst) {
            return Err(StoreError::Database("ping failed".to_string()));
        }

        let mut leases = self.leases.write();
        match leases.get_mut(resource_id) {
            Some(lease) if lease.owner == owner && !lease.is_expired() => {
                lease.expires_at = Instant::now() + lease.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, owner: &str, resource_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;

        let mut leases = self.leases.write();
        match leases.get(resource_id) {
            Some(lease) if lease.owner == owner => {
                leases.remove(resource_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Parameters;

    fn record(value: &str, priority: i32) -> EventRecord {
        EventRecord::new("str", Parameters::new().with("value", value), priority)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryDocumentEventStore::new();
        let id = store.insert(&record("x", 1)).await.unwrap();

        let loaded = store.get(id).await.unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.parameters.get("value"), Some("x"));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_find_orders_by_priority_then_creation() {
        let store = InMemoryDocumentEventStore::new();
        let now = Utc::now();
        let low = store.insert(&record("a", 1)).await.unwrap();
        let high_old = store
            .insert(&record("b", 5).with_creation_date(now - chrono::Duration::seconds(10)))
            .await
            .unwrap();
        let high_new = store.insert(&record("c", 5)).await.unwrap();

        let found = store
            .find_unprocessed_or_expired(&["str".to_string()], 10, now)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().filter_map(|r| r.id).collect();
        assert_eq!(ids, vec![high_old, high_new, low]);
    }

    #[tokio::test]
    async fn test_find_skips_fresh_processing_and_terminal_records() {
        let store = InMemoryDocumentEventStore::new();
        let now = Utc::now();

        store
            .insert(&record("fresh", 1).into_processing(now))
            .await
            .unwrap();
        let stale = store
            .insert(&record("stale", 1).into_processing(now - chrono::Duration::minutes(10)))
            .await
            .unwrap();
        store
            .insert(&record("done", 1).into_published(now))
            .await
            .unwrap();
        store.insert(&record("other", 1)).await.unwrap();

        let found = store
            .find_unprocessed_or_expired(&["str".to_string()], 10, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|r| r.id == Some(stale)));
    }

    #[tokio::test]
    async fn test_find_filters_types_and_limits() {
        let store = InMemoryDocumentEventStore::new();
        for i in 0..5 {
            store.insert(&record(&i.to_string(), 1)).await.unwrap();
        }
        store
            .insert(&EventRecord::new("other", Parameters::new(), 9))
            .await
            .unwrap();

        let found = store
            .find_unprocessed_or_expired(&["str".to_string()], 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|r| r.event_type == "str"));
    }

    #[tokio::test]
    async fn test_conditional_update_detects_conflict() {
        let store = InMemoryDocumentEventStore::new();
        let id = store.insert(&record("x", 1)).await.unwrap();
        let now = Utc::now();

        let claimed = record("x", 1).with_id(id).into_processing(now);
        assert_eq!(store.conditional_update(id, None, &claimed).await.unwrap(), 1);

        // A second writer still expecting no processing date loses
        let racer = record("x", 1).with_id(id).into_processing(Utc::now());
        assert_eq!(store.conditional_update(id, None, &racer).await.unwrap(), 0);

        assert_eq!(store.get(id).await.unwrap().processing_date, Some(now));
    }

    #[tokio::test]
    async fn test_forced_conflict() {
        let store = InMemoryDocumentEventStore::new();
        let id = store.insert(&record("x", 1)).await.unwrap();
        store.force_conflict(id);

        let update = record("x", 1).into_processing(Utc::now());
        assert_eq!(store.conditional_update(id, None, &update).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_execute_batch_is_positional() {
        let store = InMemoryDocumentEventStore::new();
        let existing = store.insert(&record("x", 1)).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.push(PendingWrite::Insert(record("y", 1)));
        batch.push(PendingWrite::ConditionalUpdate {
            id: existing,
            expected_processing_date: None,
            record: record("x", 1).into_processing(Utc::now()),
        });
        batch.push(PendingWrite::ConditionalUpdate {
            id: Uuid::now_v7(),
            expected_processing_date: None,
            record: record("z", 1),
        });

        let outcomes = store.execute_batch(batch).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], WriteOutcome::Inserted(_)));
        assert_eq!(outcomes[1], WriteOutcome::Updated { modified: 1 });
        assert_eq!(outcomes[2], WriteOutcome::Updated { modified: 0 });
        assert!(!outcomes[2].is_applied());
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_released() {
        let store = InMemoryDocumentEventStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lease("a", "res", ttl).await.unwrap());
        assert!(!store.acquire_lease("b", "res", ttl).await.unwrap());
        assert!(store.ping_lease("a", "res").await.unwrap());
        assert!(!store.ping_lease("b", "res").await.unwrap());

        assert!(!store.release_lease("b", "res").await.unwrap());
        assert!(store.release_lease("a", "res").await.unwrap());
        assert!(store.acquire_lease("b", "res", ttl).await.unwrap());
        assert_eq!(store.lease_holder("res").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryDocumentEventStore::new();
        let ttl = Duration::from_millis(20);

        assert!(store.acquire_lease("a", "res", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.ping_lease("a", "res").await.unwrap());
        assert!(store.acquire_lease("b", "res", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = InMemoryDocumentEventStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.insert(&record("x", 1)).await,
            Err(StoreError::Database(_))
        ));
        assert!(store
            .acquire_lease("a", "res", Duration::from_secs(1))
            .await
            .is_err());
    }
}
