//! Error types shared across the engine

use chrono::{DateTime, Utc};

use crate::event::{EventId, ParseFailure};
use crate::persistence::StoreError;

/// Lease failures
///
/// Neither variant is fatal for a retrieval: an unavailable lease means another
/// worker owns the identity this cycle, a lost lease means pending work for the
/// identity must be dropped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// The resource is owned by someone else, or the store could not be reached
    #[error("lease unavailable: {resource_id}")]
    Unavailable { resource_id: String },

    /// The lease expired or its liveness ping failed after acquisition
    #[error("lease lost on {resource_id}: {message}")]
    Lost { resource_id: String, message: String },
}

impl LeaseError {
    /// Resource id the failure refers to
    pub fn resource_id(&self) -> &str {
        match self {
            Self::Unavailable { resource_id } | Self::Lost { resource_id, .. } => resource_id,
        }
    }
}

/// Errors surfaced by [`DocumentEventRepository`](crate::DocumentEventRepository)
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The store could not be reached or rejected the request
    #[error("transport failure: {0}")]
    Store(#[from] StoreError),

    /// The event is too close to its processing timeout to be treated as owned
    #[error("event {event_id:?} expired: processing deadline was {deadline}")]
    Expired {
        event_id: Option<EventId>,
        deadline: DateTime<Utc>,
    },

    /// The event is not in `processing` state
    #[error("event {event_id:?} is not being processed")]
    NotProcessing { event_id: Option<EventId> },

    /// An optimistic write matched no record
    #[error("conflict detected on event {event_id}")]
    Conflict { event_id: EventId },

    /// The event payload could not be parsed
    #[error(transparent)]
    Unparseable(#[from] ParseFailure),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another value
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("cannot parse {var}={value}")]
    Parse { var: String, value: String },
}
