//! Detection of deployments no lease protects any longer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::ControlResult;
use crate::store::LifecycleStore;
use crate::types::ExpiredDeployment;

/// Finds live deployments whose protection horizon has passed.
///
/// The reaper only reads. Candidates are handed back to the caller, which
/// decides whether to start undeploying them. A lease renewed just after a
/// scan survives until the next one.
pub struct TimeoutReaper {
    store: Arc<dyn LifecycleStore>,
}

impl TimeoutReaper {
    /// Create a new reaper over the given store.
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self { store }
    }

    /// Live deployments whose every timed lease has expired.
    pub async fn find_expired_deployments(&self) -> ControlResult<Vec<ExpiredDeployment>> {
        self.find_expired_deployments_at(Utc::now()).await
    }

    /// Same as [`find_expired_deployments`](Self::find_expired_deployments),
    /// evaluated at `now`.
    pub async fn find_expired_deployments_at(
        &self,
        now: DateTime<Utc>,
    ) -> ControlResult<Vec<ExpiredDeployment>> {
        let horizons = self.store.protection_horizons().await?;
        let scanned = horizons.len();

        let expired: Vec<ExpiredDeployment> = horizons
            .into_iter()
            .filter(|p| is_expired(p.horizon, now))
            .map(|p| ExpiredDeployment {
                id: p.deployment.id,
                locator: p.deployment.locator,
                server: p.deployment.server,
            })
            .collect();

        debug!(scanned, expired = expired.len(), "expiry scan finished");
        Ok(expired)
    }
}

/// Whether a deployment with the given protection horizon has expired.
///
/// A deployment without any timed lease has no horizon and never expires
/// here; its pending leases receive a lifetime once it goes live.
#[must_use]
pub fn is_expired(horizon: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    horizon.is_some_and(|h| h < now)
}

impl std::fmt::Debug for TimeoutReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutReaper").finish_non_exhaustive()
    }
}
