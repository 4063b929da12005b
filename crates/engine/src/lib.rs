//! # Document Event Engine
//!
//! Lease-coordinated deduplication and persistence of document events for a
//! fleet of independent publishing workers.
//!
//! ## Features
//!
//! - **Advisory leases**: one worker at a time owns an event identity, with background renewal
//! - **Supersede/merge optimization**: redundant events collapse into a single survivor
//! - **Optimistic concurrency**: writes apply only if the record is unchanged since it was read
//! - **Pluggable stores**: in-memory for tests, PostgreSQL for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  DocumentEventRepository                     │
//! │  (fetch candidates, group by identity, persist, release)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌──────────────────────┐
//! │  LeaseManager   │ │ OptimizationBatch│ │  DocumentEventStore   │
//! │ (one identity,  │ │ (supersede/merge │ │ (conditional writes,  │
//! │  one owner)     │ │  per identity)   │ │  lease rows)          │
//! └─────────────────┘ └──────────────────┘ └──────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use docevents_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryDocumentEventStore::new());
//! let registry = Arc::new(EventTypeRegistry::new().with::<StringEvent>());
//! let repository = DocumentEventRepository::new(
//!     store.clone(),
//!     store,
//!     registry,
//!     RepositoryConfig::default(),
//! );
//!
//! repository.submit(Arc::new(StringEvent::new("x")), 0).await?;
//! let events = repository.retrieve().await?;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod lease;
pub mod optimizer;
pub mod persistence;
pub mod repository;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{LeaseConfig, RepositoryConfig};
    pub use crate::error::{ConfigError, LeaseError, RepositoryError};
    pub use crate::event::{
        DocumentEvent, EntityChangeEvent, Event, EventId, EventRecord, EventStatus, EventType,
        EventTypeRegistry, Identity, Parameters, ParseFailure, StringEvent,
    };
    pub use crate::lease::{Lease, LeaseGroup, LeaseManager};
    pub use crate::persistence::{
        DocumentEventStore, InMemoryDocumentEventStore, LeaseStore, PostgresDocumentEventStore,
        StoreError,
    };
    pub use crate::repository::{DocumentEventRepository, MarkOutcome};
}

// Re-export key types at crate root
pub use config::{LeaseConfig, RepositoryConfig};
pub use error::{ConfigError, LeaseError, RepositoryError};
pub use event::{
    DocumentEvent, EntityChangeEvent, Event, EventId, EventRecord, EventStatus, EventType,
    EventTypeRegistry, Identity, Parameters, ParseFailure, Payload, StringEvent,
};
pub use lease::{Lease, LeaseGroup, LeaseManager};
pub use optimizer::{DocumentEventUpdate, OptimizationBatch};
pub use persistence::{
    DocumentEventStore, InMemoryDocumentEventStore, LeaseStore, PendingWrite,
    PostgresDocumentEventStore, StoreError, WriteBatch, WriteOutcome,
};
pub use repository::{DocumentEventRepository, MarkOutcome};
