//! Persistence layer for document events
//!
//! This module provides:
//! - [`DocumentEventStore`] trait for event record persistence
//! - [`LeaseStore`] trait for advisory leases
//! - [`InMemoryDocumentEventStore`] for testing
//! - [`PostgresDocumentEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryDocumentEventStore;
pub use postgres::PostgresDocumentEventStore;
pub use store::{DocumentEventStore, LeaseStore, PendingWrite, StoreError, WriteBatch, WriteOutcome};
