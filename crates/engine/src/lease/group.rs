//! All-or-nothing acquisition of several leases

use futures::future::join_all;
use tracing::debug;

use super::{Lease, LeaseManager};
use crate::error::LeaseError;

/// A set of leases acquired together
///
/// Acquisition happens in the given order. If any lease cannot be acquired,
/// every lease already taken is closed before the error is returned.
#[derive(Debug, Default)]
pub struct LeaseGroup {
    leases: Vec<Lease>,
}

impl LeaseGroup {
    pub async fn acquire_all<I, S>(manager: &LeaseManager, resource_ids: I) -> Result<Self, LeaseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut group = Self::default();
        for resource_id in resource_ids {
            match manager.try_acquire(resource_id.as_ref()).await {
                Ok(lease) => group.leases.push(lease),
                Err(e) => {
                    debug!(
                        failed = %e.resource_id(),
                        rolled_back = group.leases.len(),
                        "lease group acquisition failed"
                    );
                    group.close().await;
                    return Err(e);
                }
            }
        }
        Ok(group)
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Check every lease, failing on the first one that is lost
    pub async fn check_live_or_fail(&self, message: &str) -> Result<(), LeaseError> {
        for lease in &self.leases {
            lease.check_live_or_fail(message).await?;
        }
        Ok(())
    }

    /// Close every lease in the group
    pub async fn close(&mut self) {
        join_all(self.leases.iter_mut().map(|lease| lease.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::persistence::{InMemoryDocumentEventStore, LeaseStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryDocumentEventStore>, LeaseManager) {
        let store = Arc::new(InMemoryDocumentEventStore::new());
        let manager = LeaseManager::new(
            Arc::clone(&store) as Arc<dyn LeaseStore>,
            LeaseConfig::with_ttl(Duration::from_secs(30)),
        );
        (store, manager)
    }

    #[tokio::test]
    async fn test_acquires_all_in_order() {
        let (store, manager) = setup();

        let mut group = LeaseGroup::acquire_all(&manager, ["a", "b", "c"]).await.unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(store.active_lease_count(), 3);
        group.check_live_or_fail("checking").await.unwrap();

        group.close().await;
        assert_eq!(store.active_lease_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_acquired_leases() {
        let (store, manager) = setup();
        let mut held = manager.try_acquire("b").await.unwrap();

        let err = LeaseGroup::acquire_all(&manager, ["a", "b", "c"]).await.unwrap_err();
        assert_eq!(err.resource_id(), "b");

        // only the outside holder of "b" remains; "c" was never attempted
        assert_eq!(store.active_lease_count(), 1);
        assert_eq!(store.lease_holder("b").as_deref(), Some(held.owner()));
        assert!(store.lease_holder("a").is_none());
        assert_eq!(store.lease_acquisition_attempts(), 3);

        held.close().await;
    }
}
