//! Persisted event records

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned record identifier
pub type EventId = Uuid;

/// Event record status
///
/// ```text
/// unprocessed ──► processing ──► published
///                     ├────────► failed
///                     ├────────► superseded
///                     └────────► merged
/// ```
///
/// A `processing` record whose processing date is older than the processing
/// timeout is treated as abandoned and may be reclaimed by another worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Unprocessed,
    Processing,
    Published,
    Superseded,
    Merged,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::Published => "published",
            Self::Superseded => "superseded",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Published | Self::Superseded | Self::Merged | Self::Failed
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(Self::Unprocessed),
            "processing" => Ok(Self::Processing),
            "published" => Ok(Self::Published),
            "superseded" => Ok(Self::Superseded),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Ordered key/value payload of an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a value, replacing an existing entry in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// The persisted unit of work
///
/// Status changes go through the `into_*` transitions, which stamp the
/// matching timestamp: a `processing` record always has a processing date and
/// a terminal record always has a processed date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Option<EventId>,
    pub event_type: String,
    pub parameters: Parameters,
    pub status: EventStatus,
    pub priority: i32,
    pub creation_date: DateTime<Utc>,
    pub processing_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
    pub survivor_of_ids: BTreeSet<EventId>,
    pub failure_cause: Option<String>,
    /// Set when the stored parameters could not be decoded
    ///
    /// Such a record carries empty parameters in memory; stores keep the
    /// stored payload untouched when writing it back.
    #[serde(skip)]
    pub decode_error: Option<String>,
}

impl EventRecord {
    /// Create a new unprocessed record
    pub fn new(event_type: impl Into<String>, parameters: Parameters, priority: i32) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            parameters,
            status: EventStatus::Unprocessed,
            priority,
            creation_date: Utc::now(),
            processing_date: None,
            processed_date: None,
            survivor_of_ids: BTreeSet::new(),
            failure_cause: None,
            decode_error: None,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_creation_date(mut self, date: DateTime<Utc>) -> Self {
        self.creation_date = date;
        self
    }

    pub fn into_processing(mut self, now: DateTime<Utc>) -> Self {
        self.status = EventStatus::Processing;
        self.processing_date = Some(now);
        self.processed_date = None;
        self
    }

    pub fn into_superseded(self, now: DateTime<Utc>) -> Self {
        self.finish(EventStatus::Superseded, now)
    }

    pub fn into_merged(self, now: DateTime<Utc>) -> Self {
        self.finish(EventStatus::Merged, now)
    }

    pub fn into_published(self, now: DateTime<Utc>) -> Self {
        self.finish(EventStatus::Published, now)
    }

    pub fn into_failed(mut self, now: DateTime<Utc>, cause: impl Into<String>) -> Self {
        self.failure_cause = Some(cause.into());
        self.finish(EventStatus::Failed, now)
    }

    fn finish(mut self, status: EventStatus, now: DateTime<Utc>) -> Self {
        self.status = status;
        self.processed_date = Some(now);
        self
    }

    /// Take over the id and audit trail of a record this one replaces
    pub fn absorb(mut self, other: &EventRecord) -> Self {
        if let Some(id) = other.id {
            self.survivor_of_ids.insert(id);
        }
        self.survivor_of_ids
            .extend(other.survivor_of_ids.iter().copied());
        if let Some(id) = self.id {
            self.survivor_of_ids.remove(&id);
        }
        self
    }

    /// Whether the status/timestamp invariant holds
    pub fn is_consistent(&self) -> bool {
        match self.status {
            EventStatus::Processing => self.processing_date.is_some(),
            status if status.is_terminal() => self.processed_date.is_some(),
            _ => true,
        }
    }
}
