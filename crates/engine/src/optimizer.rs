//! Supersede/merge optimization of events sharing an identity
//!
//! Events are offered one at a time, in fetch order, to the
//! [`OptimizationBatch`] of their identity. Each offer is compared against the
//! survivors kept so far:
//!
//! 1. superseded by a survivor: the survivor absorbs it, it is retired as
//!    `superseded`
//! 2. supersedes a survivor: it absorbs the survivor, the survivor is retired
//!    as `superseded`, comparison continues
//! 3. mergeable with a survivor: both are retired as `merged` and a fresh
//!    merged event continues in their place
//! 4. otherwise it is kept as `processing`

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::event::{Event, Identity};
use crate::persistence::PendingWrite;

/// A pending write for one event
#[derive(Debug, Clone)]
pub struct DocumentEventUpdate {
    pub event: Event,
    /// Processing date the store must still hold for the write to apply
    pub expected_processing_date: Option<DateTime<Utc>>,
}

impl DocumentEventUpdate {
    fn new(event: Event) -> Self {
        let expected_processing_date = event.observed_processing_date();
        Self {
            event,
            expected_processing_date,
        }
    }

    /// Whether the event has never been stored
    pub fn is_insert(&self) -> bool {
        self.event.id().is_none()
    }

    pub fn to_write(&self) -> PendingWrite {
        let record = self.event.record().clone();
        match record.id {
            None => PendingWrite::Insert(record),
            Some(id) => PendingWrite::ConditionalUpdate {
                id,
                expected_processing_date: self.expected_processing_date,
                record,
            },
        }
    }
}

/// Survivors and retired events for one identity
#[derive(Debug)]
pub struct OptimizationBatch {
    identity: Identity,
    kept: Vec<Event>,
    retired: Vec<Event>,
}

impl OptimizationBatch {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            kept: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Events currently kept as `processing`
    pub fn kept(&self) -> &[Event] {
        &self.kept
    }

    /// Events retired as `superseded` or `merged`
    pub fn retired(&self) -> &[Event] {
        &self.retired
    }

    /// Fold one event into the batch
    pub fn offer(&mut self, incoming: Event, now: DateTime<Utc>) {
        let mut incoming = incoming;
        let mut i = 0;

        while i < self.kept.len() {
            if incoming.is_superseded_by(&self.kept[i]) {
                debug!(
                    identity = %self.identity,
                    event_id = ?incoming.id(),
                    survivor_id = ?self.kept[i].id(),
                    "event superseded by kept survivor"
                );
                let survivor = self.kept.remove(i).absorb(&incoming);
                self.kept.insert(i, survivor);
                self.retired.push(incoming.into_superseded(now));
                return;
            }

            if self.kept[i].is_superseded_by(&incoming) {
                let survivor = self.kept.remove(i);
                debug!(
                    identity = %self.identity,
                    event_id = ?incoming.id(),
                    superseded_id = ?survivor.id(),
                    "event supersedes kept survivor"
                );
                incoming = incoming.absorb(&survivor);
                self.retired.push(survivor.into_superseded(now));
                continue;
            }

            if incoming.could_merge_with(&self.kept[i]) {
                if let Some(merged) = self.kept[i].merge(&incoming) {
                    let survivor = self.kept.remove(i);
                    debug!(
                        identity = %self.identity,
                        event_id = ?incoming.id(),
                        survivor_id = ?survivor.id(),
                        "events merged"
                    );
                    self.retired.push(survivor.into_merged(now));
                    self.retired.push(incoming.into_merged(now));
                    incoming = merged;
                    continue;
                }
            }

            i += 1;
        }

        self.kept.push(incoming.into_processing(now));
    }

    /// Drain the pending writes of the batch
    ///
    /// Retired events that were never stored are dropped: their history lives
    /// on in the survivor that absorbed them.
    pub fn take_updates(&mut self) -> Vec<DocumentEventUpdate> {
        let retired = std::mem::take(&mut self.retired);
        let kept = std::mem::take(&mut self.kept);

        retired
            .into_iter()
            .filter(|event| event.id().is_some())
            .chain(kept)
            .map(DocumentEventUpdate::new)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        downcast, DocumentEvent, EventStatus, EntityChangeEvent, EventRecord, EventTypeRegistry, Parameters,
        ParseFailure, Payload, StringEvent,
    };
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use uuid::Uuid;

    fn stored(document: impl DocumentEvent, priority: i32) -> Event {
        let document: Arc<dyn DocumentEvent> = Arc::new(document);
        let record = EventRecord::new(document.event_type(), document.parameters(), priority)
            .with_id(Uuid::now_v7());
        Event::loaded(record, Payload::Document(document))
    }

    fn change(entity: &str, version: u64, fields: &[&str]) -> Event {
        stored(EntityChangeEvent::new(entity, version, fields.iter().copied()), 0)
    }

    fn status_of(events: &[Event], id: Option<Uuid>) -> Option<EventStatus> {
        events.iter().find(|e| e.id() == id).map(Event::status)
    }

    #[test]
    fn test_first_duplicate_survives() {
        let now = Utc::now();
        let a = stored(StringEvent::new("x"), 0);
        let b = stored(StringEvent::new("x"), 0);
        let mut batch = OptimizationBatch::new(a.identity());

        batch.offer(a.clone(), now);
        batch.offer(b.clone(), now);

        assert_eq!(batch.kept().len(), 1);
        let survivor = &batch.kept()[0];
        assert_eq!(survivor.id(), a.id());
        assert_eq!(survivor.status(), EventStatus::Processing);
        assert_eq!(
            survivor.record().survivor_of_ids,
            BTreeSet::from([b.id().unwrap()])
        );
        assert_eq!(status_of(batch.retired(), b.id()), Some(EventStatus::Superseded));
    }

    #[test]
    fn test_supersede_is_order_independent() {
        let now = Utc::now();
        let older = change("doc-1", 1, &["title"]);
        let newer = change("doc-1", 2, &["title", "body"]);

        for order in [[older.clone(), newer.clone()], [newer.clone(), older.clone()]] {
            let mut batch = OptimizationBatch::new(older.identity());
            for event in order {
                batch.offer(event, now);
            }

            assert_eq!(batch.kept().len(), 1);
            let survivor = &batch.kept()[0];
            assert_eq!(survivor.id(), newer.id());
            assert!(survivor.record().survivor_of_ids.contains(&older.id().unwrap()));

            let retired = &batch.retired()[0];
            assert_eq!(retired.id(), older.id());
            assert_eq!(retired.status(), EventStatus::Superseded);
            assert_eq!(retired.record().processed_date, Some(now));
        }
    }

    #[test]
    fn test_merge_conserves_ids() {
        let now = Utc::now();
        let a = change("doc-1", 3, &["title"]);
        let b = change("doc-1", 5, &["body"]);
        let mut batch = OptimizationBatch::new(a.identity());

        batch.offer(a.clone(), now);
        batch.offer(b.clone(), now);

        assert_eq!(batch.kept().len(), 1);
        let merged = &batch.kept()[0];
        assert_eq!(merged.id(), None);
        assert_eq!(merged.status(), EventStatus::Processing);
        assert!(merged
            .record()
            .survivor_of_ids
            .is_superset(&BTreeSet::from([a.id().unwrap(), b.id().unwrap()])));

        let document = merged.document().unwrap();
        let merged_change = downcast::<EntityChangeEvent>(document).unwrap();
        assert_eq!(merged_change.version, 5);
        assert_eq!(merged_change.fields.len(), 2);

        assert_eq!(status_of(batch.retired(), a.id()), Some(EventStatus::Merged));
        assert_eq!(status_of(batch.retired(), b.id()), Some(EventStatus::Merged));
    }

    #[test]
    fn test_chained_merge_drops_intermediate_record() {
        let now = Utc::now();
        let a = change("doc-1", 1, &["a"]);
        let b = change("doc-1", 2, &["b"]);
        let c = change("doc-1", 3, &["c"]);
        let mut batch = OptimizationBatch::new(a.identity());

        for event in [a.clone(), b.clone(), c.clone()] {
            batch.offer(event, now);
        }

        let updates = batch.take_updates();
        let inserts: Vec<_> = updates.iter().filter(|u| u.is_insert()).collect();
        assert_eq!(inserts.len(), 1);
        let survivors = &inserts[0].event.record().survivor_of_ids;
        for id in [a.id(), b.id(), c.id()] {
            assert!(survivors.contains(&id.unwrap()));
        }
        // a, b, c merged plus the final insert; the intermediate merge is never stored
        assert_eq!(updates.len(), 4);
        assert!(batch.kept().is_empty());
    }

    #[test]
    fn test_merged_record_takes_highest_priority_and_earliest_creation() {
        let now = Utc::now();
        let a = stored(EntityChangeEvent::new("doc-1", 1, ["a"]), 7);
        let b = stored(EntityChangeEvent::new("doc-1", 2, ["b"]), 2);
        let mut batch = OptimizationBatch::new(a.identity());

        batch.offer(a.clone(), now);
        batch.offer(b.clone(), now);

        let merged = batch.kept()[0].record();
        assert_eq!(merged.priority, 7);
        assert_eq!(merged.creation_date, a.record().creation_date);
    }

    #[test]
    fn test_unparseable_is_kept_for_failure() {
        let now = Utc::now();
        let record = EventRecord::new("str", Parameters::new().with("wrong", "x"), 0)
            .with_id(Uuid::now_v7());
        let event = EventTypeRegistry::new().with::<StringEvent>().parse(record);
        assert!(event.is_unparseable());

        let mut batch = OptimizationBatch::new(event.identity());
        batch.offer(event.clone(), now);
        batch.offer(stored(StringEvent::new("x"), 0), now);

        assert_eq!(batch.kept().len(), 2);
        assert!(batch.kept()[0].is_unparseable());
        assert!(matches!(
            batch.kept()[0].document(),
            Err(ParseFailure { .. })
        ));
    }

    #[test]
    fn test_updates_expect_observed_processing_date() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(10);
        let record = EventRecord::new("str", StringEvent::new("x").parameters(), 0)
            .with_id(Uuid::now_v7())
            .into_processing(earlier);
        let event = Event::loaded(record, Payload::Document(Arc::new(StringEvent::new("x"))));

        let mut batch = OptimizationBatch::new(event.identity());
        batch.offer(event, now);

        let updates = batch.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].expected_processing_date, Some(earlier));
        assert_eq!(updates[0].event.record().processing_date, Some(now));
        assert_eq!(updates[0].event.status(), EventStatus::Processing);
        assert!(matches!(
            updates[0].to_write(),
            PendingWrite::ConditionalUpdate { expected_processing_date: Some(d), .. } if d == earlier
        ));
    }
}
