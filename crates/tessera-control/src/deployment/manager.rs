//! Deployment placement and state transitions.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::lease::expiry_after;
use crate::state::{Transition, Transitioned};
use crate::store::{DeploymentFilter, LifecycleStore};
use crate::types::{DeployStatus, DeploymentId, DeploymentRecord, Locator, PersistedState, Server};

/// Places deployments and drives them through their lifecycle.
///
/// The provisioning worker calls back into the manager with the outcome of
/// each out-of-band step; every callback is one conditional update against
/// the store.
pub struct DeploymentManager {
    store: Arc<dyn LifecycleStore>,
    lease_config: LeaseConfig,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(store: Arc<dyn LifecycleStore>, lease_config: LeaseConfig) -> Self {
        Self {
            store,
            lease_config,
        }
    }

    /// Place a new deployment of `locator` on the fastest server.
    ///
    /// The returned deployment is `starting`; the caller provisions the
    /// dataset on the returned server and then reports the outcome with
    /// [`complete_deployment`](Self::complete_deployment) or
    /// [`fail_deployment`](Self::fail_deployment).
    pub async fn start_deployment(
        &self,
        locator: &Locator,
    ) -> ControlResult<(Server, DeploymentId)> {
        let record = self.store.place_deployment(locator).await?;

        info!(
            deployment_id = %record.id,
            locator = %locator,
            server = %record.server.addr(),
            "deployment placed"
        );

        Ok((record.server, record.id))
    }

    /// Mark a deployment live and activate its pending leases.
    pub async fn complete_deployment(&self, id: DeploymentId) -> ControlResult<Transitioned> {
        let lease_expiry = expiry_after(Utc::now(), self.lease_config.activation_ttl())?;
        self.apply(id, Transition::Complete { lease_expiry }).await
    }

    /// Mark a deployment that failed to provision as dead.
    pub async fn fail_deployment(&self, id: DeploymentId) -> ControlResult<Transitioned> {
        self.apply(id, Transition::Fail).await
    }

    /// Begin tearing down a live deployment.
    pub async fn start_undeployment(&self, id: DeploymentId) -> ControlResult<Transitioned> {
        self.apply(id, Transition::StartUndeploy).await
    }

    /// Mark a deployment whose teardown finished as dead.
    pub async fn complete_undeployment(&self, id: DeploymentId) -> ControlResult<Transitioned> {
        self.apply(id, Transition::CompleteUndeploy).await
    }

    /// Record a failed teardown.
    ///
    /// Failed teardowns are not tracked separately: the deployment stays in
    /// `killing` until the worker reports completion.
    pub fn fail_undeployment(&self, id: DeploymentId) {
        warn!(deployment_id = %id, "undeployment failed, leaving state unchanged");
    }

    /// Status of the most recent deployment of `locator`.
    ///
    /// A locator that was never deployed reports [`DeployStatus::Dead`].
    pub async fn deployment_status(&self, locator: &Locator) -> ControlResult<DeployStatus> {
        let active = self
            .store
            .list_deployments(
                &DeploymentFilter::new()
                    .with_locator(locator.clone())
                    .active_only(),
            )
            .await?;

        match active.as_slice() {
            [record] => return Ok(DeployStatus::from_record(record)),
            [] => {}
            many => {
                let ids: Vec<String> = many.iter().map(|d| d.id.to_string()).collect();
                return Err(ControlError::integrity(format!(
                    "locator {locator} has {} active deployments: {}",
                    many.len(),
                    ids.join(", ")
                )));
            }
        }

        let latest = self
            .store
            .list_deployments(
                &DeploymentFilter::new()
                    .with_locator(locator.clone())
                    .with_limit(1),
            )
            .await?;

        let status = match latest.first() {
            Some(record) if record.state == PersistedState::Killing => DeployStatus::Killing,
            _ => DeployStatus::Dead,
        };

        debug!(locator = %locator, status = ?status, "deployment status resolved");
        Ok(status)
    }

    /// Get a deployment by ID.
    pub async fn get(&self, id: DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.store.get_deployment(id).await
    }

    async fn apply(&self, id: DeploymentId, transition: Transition) -> ControlResult<Transitioned> {
        let outcome = self.store.transition(id, transition).await?;

        match outcome {
            Transitioned::Applied { leases_activated } => info!(
                deployment_id = %id,
                operation = transition.name(),
                from = %transition.from(),
                to = %transition.to(),
                leases_activated,
                "deployment state changed"
            ),
            Transitioned::Unchanged => debug!(
                deployment_id = %id,
                operation = transition.name(),
                state = %transition.to(),
                "deployment already in target state"
            ),
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager").finish_non_exhaustive()
    }
}
