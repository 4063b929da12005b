//! Publish worker for document events
//!
//! Claims deduplicated document events from a [`DocumentEventRepository`],
//! hands them to a [`DocumentPublisher`] and records the outcome.
//!
//! [`DocumentEventRepository`]: docevents_engine::DocumentEventRepository

pub mod config;
pub mod poller;
pub mod publisher;
pub mod worker;

// Re-export main types
pub use config::WorkerConfig;
pub use poller::{IdleBackoff, PollerConfig};
pub use publisher::{DocumentPublisher, LoggingPublisher, PublishError, RecordingPublisher};
pub use worker::{CycleStats, PublishWorker};
