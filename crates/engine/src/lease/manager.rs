//! Advisory lease with background renewal

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::error::LeaseError;
use crate::persistence::LeaseStore;

/// Hands out leases against a [`LeaseStore`]
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Make a single, non-blocking attempt to acquire `resource_id`
    ///
    /// A resource held by someone else and an unreachable store both yield
    /// [`LeaseError::Unavailable`]. On success the returned lease renews
    /// itself until it is closed.
    #[instrument(skip(self))]
    pub async fn try_acquire(&self, resource_id: &str) -> Result<Lease, LeaseError> {
        let owner = Uuid::now_v7().to_string();
        let unavailable = || LeaseError::Unavailable {
            resource_id: resource_id.to_string(),
        };

        match self
            .store
            .acquire_lease(&owner, resource_id, self.config.ttl)
            .await
        {
            Ok(true) => {
                debug!(%owner, "lease acquired");
                Ok(Lease::start(
                    Arc::clone(&self.store),
                    owner,
                    resource_id.to_string(),
                    self.config.clone(),
                ))
            }
            Ok(false) => {
                debug!("lease held by another owner");
                Err(unavailable())
            }
            Err(e) => {
                warn!(error = %e, "lease acquisition failed");
                Err(unavailable())
            }
        }
    }
}

#[derive(Debug, Default)]
struct LeaseState {
    /// Reason the lease was lost, if it was
    lost: Option<String>,
    closed: bool,
}

struct Shared {
    store: Arc<dyn LeaseStore>,
    owner: String,
    resource_id: String,
    state: Mutex<LeaseState>,
}

impl Shared {
    fn mark_lost(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if !state.closed && state.lost.is_none() {
            state.lost = Some(reason.into());
        }
    }

    fn lost(&self, message: &str) -> LeaseError {
        LeaseError::Lost {
            resource_id: self.resource_id.clone(),
            message: message.to_string(),
        }
    }
}

/// A held advisory lease
///
/// The background renewal is optimistic: a failed ping is logged and retried
/// until the TTL elapses without a successful one. Only
/// [`check_live_or_fail`](Lease::check_live_or_fail) and TTL exhaustion decide
/// that the lease is lost.
///
/// Call [`close`](Lease::close) to release. Dropping an open lease stops the
/// renewal and releases in the background.
pub struct Lease {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl Lease {
    fn start(
        store: Arc<dyn LeaseStore>,
        owner: String,
        resource_id: String,
        config: LeaseConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            owner,
            resource_id,
            state: Mutex::new(LeaseState::default()),
        });
        let cancel = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            Arc::clone(&shared),
            cancel.clone(),
            config.ttl,
            config.ping_interval,
        ));

        Self {
            shared,
            cancel,
            renewal: Some(renewal),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.shared.resource_id
    }

    /// Owner token this lease was acquired with
    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether the lease is known to be lost, without contacting the store
    pub fn is_lost(&self) -> bool {
        self.shared.state.lock().lost.is_some()
    }

    /// Confirm with the store that the lease is still held
    ///
    /// A negative ping or a transport failure marks the lease lost and stops
    /// renewal. `message` describes what the caller was about to do.
    #[instrument(skip(self), fields(resource_id = %self.shared.resource_id))]
    pub async fn check_live_or_fail(&self, message: &str) -> Result<(), LeaseError> {
        {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(self.shared.lost(&format!("{message}: lease already closed")));
            }
            if let Some(reason) = &state.lost {
                return Err(self.shared.lost(&format!("{message}: {reason}")));
            }
        }

        let reason = match self
            .shared
            .store
            .ping_lease(&self.shared.owner, &self.shared.resource_id)
            .await
        {
            Ok(true) => return Ok(()),
            Ok(false) => "lease no longer held".to_string(),
            Err(e) => format!("lease ping failed: {e}"),
        };

        warn!(%reason, "{}", message);
        self.shared.mark_lost(reason.clone());
        self.cancel.cancel();
        Err(self.shared.lost(&format!("{message}: {reason}")))
    }

    /// Stop renewal and release the lease
    ///
    /// Idempotent. A failed release is logged; the lease then expires on its
    /// own after the TTL.
    pub async fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.cancel.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
            let _ = renewal.await;
        }

        match self
            .shared
            .store
            .release_lease(&self.shared.owner, &self.shared.resource_id)
            .await
        {
            Ok(true) => debug!(resource_id = %self.shared.resource_id, "lease released"),
            Ok(false) => debug!(
                resource_id = %self.shared.resource_id,
                "lease was no longer held at release"
            ),
            Err(e) => warn!(
                resource_id = %self.shared.resource_id,
                error = %e,
                "failed to release lease"
            ),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Lease")
            .field("resource_id", &self.shared.resource_id)
            .field("owner", &self.shared.owner)
            .field("closed", &state.closed)
            .field("lost", &state.lost)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }

        let closed = std::mem::replace(&mut self.shared.state.lock().closed, true);
        if closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                if let Err(e) = shared
                    .store
                    .release_lease(&shared.owner, &shared.resource_id)
                    .await
                {
                    warn!(resource_id = %shared.resource_id, error = %e, "failed to release dropped lease");
                }
            });
        }
    }
}

/// Renewal loop, one per lease
async fn renew(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    ttl: Duration,
    ping_interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match shared.store.ping_lease(&shared.owner, &shared.resource_id).await {
                    Ok(true) => {
                        last_renewed = Instant::now();
                        continue;
                    }
                    Ok(false) => warn!(
                        resource_id = %shared.resource_id,
                        "lease renewal rejected, retrying"
                    ),
                    Err(e) => warn!(
                        resource_id = %shared.resource_id,
                        error = %e,
                        "lease renewal failed, retrying"
                    ),
                }

                if last_renewed.elapsed() >= ttl {
                    warn!(resource_id = %shared.resource_id, "lease TTL elapsed without renewal");
                    shared.mark_lost("TTL elapsed without renewal");
                    break;
                }
            }
        }
    }

    debug!(resource_id = %shared.resource_id, "lease renewal stopped");
}
