//! Advisory leases
//!
//! This module provides:
//! - [`LeaseManager`] - single-attempt acquisition against a [`LeaseStore`](crate::persistence::LeaseStore)
//! - [`Lease`] - a held lease with background renewal
//! - [`LeaseGroup`] - acquire several leases with rollback on failure

mod group;
mod manager;

pub use group::LeaseGroup;
pub use manager::{Lease, LeaseManager};
