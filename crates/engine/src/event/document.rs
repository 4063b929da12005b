//! Document event capability and the in-flight event value

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, EventRecord, EventStatus, Identity, Parameters};

/// Behavior an event type supplies to the engine
///
/// The engine never inspects concrete event types; it groups events by
/// [`identity`](DocumentEvent::identity) and sequences the supersede/merge
/// predicates. Implementations compare against `other` by downcasting through
/// [`as_any`](DocumentEvent::as_any), see [`downcast`].
pub trait DocumentEvent: fmt::Debug + Send + Sync + 'static {
    /// Type discriminator persisted with the record
    fn event_type(&self) -> &str;

    /// Grouping key; must depend only on the logical payload
    fn identity(&self) -> Identity;

    /// Payload to persist
    fn parameters(&self) -> Parameters;

    /// Whether `other` already covers this event
    fn is_superseded_by(&self, other: &dyn DocumentEvent) -> bool;

    /// Whether this event and `other` can be combined into one
    fn could_merge_with(&self, _other: &dyn DocumentEvent) -> bool {
        false
    }

    /// Combine this event with `other`
    ///
    /// Only called when [`could_merge_with`](DocumentEvent::could_merge_with)
    /// returned true. Returning `None` keeps both events.
    fn merge(&self, _other: &dyn DocumentEvent) -> Option<Arc<dyn DocumentEvent>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Downcast a document event to its concrete type
pub fn downcast<T: DocumentEvent>(event: &dyn DocumentEvent) -> Option<&T> {
    event.as_any().downcast_ref::<T>()
}

/// A registrable event type
///
/// ```ignore
/// let mut registry = EventTypeRegistry::new();
/// registry.register::<StringEvent>();
/// ```
pub trait EventType: DocumentEvent + Sized {
    /// Type discriminator
    const TYPE: &'static str;

    /// Parse the persisted payload
    fn from_parameters(parameters: &Parameters) -> Result<Self, String>;
}

/// A record's payload could not be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("cannot parse {event_type} event: {reason}")]
pub struct ParseFailure {
    pub event_type: String,
    pub reason: String,
}

/// Interpreted payload of an event
#[derive(Debug, Clone)]
pub enum Payload {
    Document(Arc<dyn DocumentEvent>),
    /// Placeholder for a malformed record; never supersedes or merges
    Unparseable(ParseFailure),
}

/// An event record together with its interpreted payload
///
/// Events are values: every transition consumes the event and returns the
/// new state.
#[derive(Debug, Clone)]
pub struct Event {
    record: EventRecord,
    payload: Payload,
    /// Processing date as last read from the store, used for conflict detection
    observed_processing_date: Option<DateTime<Utc>>,
}

impl Event {
    /// Wrap a record read from the store
    pub fn loaded(record: EventRecord, payload: Payload) -> Self {
        let observed_processing_date = record.processing_date;
        Self {
            record,
            payload,
            observed_processing_date,
        }
    }

    /// Create a new unsaved event from a document
    pub fn new(document: Arc<dyn DocumentEvent>, priority: i32) -> Self {
        let record = EventRecord::new(document.event_type(), document.parameters(), priority);
        Self {
            record,
            payload: Payload::Document(document),
            observed_processing_date: None,
        }
    }

    pub fn id(&self) -> Option<EventId> {
        self.record.id
    }

    pub fn status(&self) -> EventStatus {
        self.record.status
    }

    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    pub fn into_record(self) -> EventRecord {
        self.record
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn observed_processing_date(&self) -> Option<DateTime<Utc>> {
        self.observed_processing_date
    }

    /// The parsed document, or the parse failure for a placeholder
    pub fn document(&self) -> Result<&dyn DocumentEvent, ParseFailure> {
        match &self.payload {
            Payload::Document(document) => Ok(document.as_ref()),
            Payload::Unparseable(failure) => Err(failure.clone()),
        }
    }

    pub fn is_unparseable(&self) -> bool {
        matches!(self.payload, Payload::Unparseable(_))
    }

    pub fn identity(&self) -> Identity {
        match &self.payload {
            Payload::Document(document) => document.identity(),
            Payload::Unparseable(_) => {
                Identity::unparseable(&self.record.event_type, self.record.id)
            }
        }
    }

    pub fn is_superseded_by(&self, other: &Event) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Document(this), Payload::Document(that)) => {
                this.is_superseded_by(that.as_ref())
            }
            _ => false,
        }
    }

    pub fn could_merge_with(&self, other: &Event) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Document(this), Payload::Document(that)) => {
                this.could_merge_with(that.as_ref())
            }
            _ => false,
        }
    }

    /// Produce a fresh, unsaved event representing both `self` and `other`
    ///
    /// The result takes the higher priority and the earlier creation date of
    /// its inputs and absorbs both of their audit trails.
    pub fn merge(&self, other: &Event) -> Option<Event> {
        let (Payload::Document(this), Payload::Document(that)) = (&self.payload, &other.payload)
        else {
            return None;
        };
        let merged = this.merge(that.as_ref())?;

        let record = EventRecord::new(
            merged.event_type(),
            merged.parameters(),
            self.record.priority.max(other.record.priority),
        )
        .with_creation_date(self.record.creation_date.min(other.record.creation_date))
        .absorb(&self.record)
        .absorb(&other.record);

        Some(Self {
            record,
            payload: Payload::Document(merged),
            observed_processing_date: None,
        })
    }

    /// Take over the id and audit trail of an event this one replaces
    pub fn absorb(self, other: &Event) -> Self {
        self.map_record(|record| record.absorb(&other.record))
    }

    pub fn into_processing(self, now: DateTime<Utc>) -> Self {
        self.map_record(|record| record.into_processing(now))
    }

    pub fn into_superseded(self, now: DateTime<Utc>) -> Self {
        self.map_record(|record| record.into_superseded(now))
    }

    pub fn into_merged(self, now: DateTime<Utc>) -> Self {
        self.map_record(|record| record.into_merged(now))
    }

    pub fn into_published(self, now: DateTime<Utc>) -> Self {
        self.map_record(|record| record.into_published(now))
    }

    pub fn into_failed(self, now: DateTime<Utc>, cause: impl Into<String>) -> Self {
        self.map_record(|record| record.into_failed(now, cause))
    }

    /// Record the store-assigned id after an insert
    pub fn with_id(self, id: EventId) -> Self {
        self.map_record(|record| record.with_id(id))
    }

    /// Mark the current processing date as the one the store now holds
    pub(crate) fn persisted(mut self) -> Self {
        self.observed_processing_date = self.record.processing_date;
        self
    }

    fn map_record(mut self, f: impl FnOnce(EventRecord) -> EventRecord) -> Self {
        self.record = f(self.record);
        self
    }
}
