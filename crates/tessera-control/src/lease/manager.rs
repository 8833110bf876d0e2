//! Lease creation, renewal, and resolution.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::LeaseConfig;
use crate::error::{ControlError, ControlResult, RecordKind};
use crate::store::LifecycleStore;
use crate::types::{
    DeployStatus, DeploymentId, DeploymentRecord, Lease, LeaseId, LeaseLifetime, Locator,
    NewLease, ResolvedLease,
};

/// Compute `now + ttl`.
///
/// A negative `ttl` is rejected: lifetimes only ever shrink by time passing.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> ControlResult<DateTime<Utc>> {
    if ttl < Duration::zero() {
        return Err(ControlError::InvalidTtl(ttl.to_string()));
    }
    now.checked_add_signed(ttl)
        .ok_or_else(|| ControlError::internal(format!("lease ttl {ttl} out of range")))
}

/// Issues and maintains leases on deployments.
pub struct LeaseManager {
    store: Arc<dyn LifecycleStore>,
    lease_config: LeaseConfig,
}

impl LeaseManager {
    /// Create a new lease manager.
    pub fn new(store: Arc<dyn LifecycleStore>, lease_config: LeaseConfig) -> Self {
        Self {
            store,
            lease_config,
        }
    }

    /// Create a lease that starts protecting `deployment` once it goes live.
    ///
    /// On a deployment that is not live yet the lease is pending and receives
    /// the activation TTL on completion. If the deployment is already live
    /// the lease gets the activation TTL straight away.
    pub async fn create_lease(
        &self,
        locator: &Locator,
        deployment: DeploymentId,
        tag: impl Into<Vec<u8>>,
    ) -> ControlResult<Lease> {
        let activation_expiry = expiry_after(Utc::now(), self.lease_config.activation_ttl())?;
        let lease = self
            .store
            .insert_lease(&NewLease {
                locator: locator.clone(),
                deployment,
                lifetime: LeaseLifetime::Pending,
                activation_expiry: Some(activation_expiry),
                tag: tag.into(),
            })
            .await?;

        info!(
            lease_id = %lease.id,
            deployment_id = %deployment,
            locator = %locator,
            pending = lease.lifetime.is_pending(),
            "lease created"
        );

        Ok(lease)
    }

    /// Create a lease that protects `deployment` for `ttl` from now.
    pub async fn attach_lease(
        &self,
        locator: &Locator,
        deployment: DeploymentId,
        tag: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> ControlResult<Lease> {
        let expiry = expiry_after(Utc::now(), ttl)?;
        let lease = self
            .store
            .insert_lease(&NewLease {
                locator: locator.clone(),
                deployment,
                lifetime: LeaseLifetime::ActiveUntil(expiry),
                activation_expiry: None,
                tag: tag.into(),
            })
            .await?;

        info!(
            lease_id = %lease.id,
            deployment_id = %deployment,
            locator = %locator,
            until = %expiry,
            "lease attached"
        );

        Ok(lease)
    }

    /// Set a lease to expire `ttl` from now, whatever its previous lifetime.
    pub async fn renew_lease(&self, id: LeaseId, ttl: Duration) -> ControlResult<Lease> {
        let expiry = expiry_after(Utc::now(), ttl)?;
        let lease = self.store.renew_lease(id, expiry).await?;

        debug!(lease_id = %id, until = %expiry, "lease renewed");
        Ok(lease)
    }

    /// Dereference a lease to the server hosting its deployment.
    pub async fn resolve_lease(&self, id: LeaseId) -> ControlResult<ResolvedLease> {
        let (lease, deployment) = self.lease_with_deployment(id).await?;

        Ok(ResolvedLease {
            locator: lease.locator,
            lifetime: lease.lifetime,
            server: deployment.server,
        })
    }

    /// Status of the deployment a lease protects.
    pub async fn check_lease_deployment(&self, id: LeaseId) -> ControlResult<DeployStatus> {
        let (_, deployment) = self.lease_with_deployment(id).await?;
        Ok(DeployStatus::from_record(&deployment))
    }

    /// All leases of a deployment, pending and timed.
    pub async fn list_leases(&self, deployment: DeploymentId) -> ControlResult<Vec<Lease>> {
        self.store.list_leases(deployment).await
    }

    async fn lease_with_deployment(&self, id: LeaseId) -> ControlResult<(Lease, DeploymentRecord)> {
        let lease = self
            .store
            .get_lease(id)
            .await?
            .ok_or_else(|| ControlError::not_found(RecordKind::Lease, id))?;

        let deployment = self
            .store
            .get_deployment(lease.deployment)
            .await?
            .ok_or_else(|| ControlError::not_found(RecordKind::Deployment, lease.deployment))?;

        Ok((lease, deployment))
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Transition;
    use crate::store::MemoryStore;
    use crate::types::{PersistedState, Server};

    async fn setup() -> (LeaseManager, Arc<MemoryStore>, DeploymentId) {
        let store = Arc::new(MemoryStore::new());
        store
            .register_server(&Server::new("a", 8080, "/data"))
            .await
            .expect("register failed");
        let record = store
            .place_deployment(&Locator::new("layer1"))
            .await
            .expect("place failed");
        let manager = LeaseManager::new(
            Arc::clone(&store) as Arc<dyn LifecycleStore>,
            LeaseConfig::default(),
        );
        (manager, store, record.id)
    }

    #[tokio::test]
    async fn create_then_list_round_trip() {
        let (manager, _, deployment) = setup().await;
        let locator = Locator::new("layer1");

        let lease = manager
            .create_lease(&locator, deployment, b"client-7".to_vec())
            .await
            .expect("create failed");

        let leases = manager.list_leases(deployment).await.expect("list failed");
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].tag, b"client-7");
        assert_eq!(leases[0].lifetime, LeaseLifetime::Pending);

        let renewed = manager
            .renew_lease(lease.id, Duration::hours(1))
            .await
            .expect("renew failed");
        assert_eq!(renewed.tag, lease.tag);
        assert_eq!(renewed.locator, lease.locator);
        assert_eq!(renewed.deployment, lease.deployment);
        assert!(!renewed.lifetime.is_pending());
    }

    #[tokio::test]
    async fn renew_only_touches_one_lease() {
        let (manager, _, deployment) = setup().await;
        let locator = Locator::new("layer1");

        let first = manager
            .create_lease(&locator, deployment, "first")
            .await
            .expect("create failed");
        let second = manager
            .create_lease(&locator, deployment, "second")
            .await
            .expect("create failed");

        manager
            .renew_lease(first.id, Duration::minutes(5))
            .await
            .expect("renew failed");

        let leases = manager.list_leases(deployment).await.expect("list failed");
        let second_now = leases
            .iter()
            .find(|l| l.id == second.id)
            .expect("second lease missing");
        assert!(second_now.lifetime.is_pending());
    }

    #[tokio::test]
    async fn renew_can_shorten_to_fresh_instant() {
        let (manager, _, deployment) = setup().await;
        let lease = manager
            .attach_lease(&Locator::new("layer1"), deployment, "x", Duration::hours(4))
            .await
            .expect("attach failed");

        let renewed = manager
            .renew_lease(lease.id, Duration::minutes(1))
            .await
            .expect("renew failed");

        assert!(renewed.lifetime.expiry() < lease.lifetime.expiry());
    }

    #[tokio::test]
    async fn attach_sets_lifetime_from_ttl() {
        let (manager, _, deployment) = setup().await;

        let before = Utc::now();
        let lease = manager
            .attach_lease(&Locator::new("layer1"), deployment, "x", Duration::minutes(30))
            .await
            .expect("attach failed");
        let after = Utc::now();

        let expiry = lease.lifetime.expiry().expect("lease pending");
        assert!(expiry >= before + Duration::minutes(30));
        assert!(expiry <= after + Duration::minutes(30));
    }

    #[tokio::test]
    async fn resolve_and_check_follow_deployment() {
        let (manager, store, deployment) = setup().await;
        let lease = manager
            .create_lease(&Locator::new("layer1"), deployment, "x")
            .await
            .expect("create failed");

        assert_eq!(
            manager
                .check_lease_deployment(lease.id)
                .await
                .expect("check failed"),
            DeployStatus::Starting { id: deployment }
        );

        store
            .transition(
                deployment,
                Transition::Complete {
                    lease_expiry: Utc::now() + Duration::hours(1),
                },
            )
            .await
            .expect("complete failed");

        let resolved = manager.resolve_lease(lease.id).await.expect("resolve failed");
        assert_eq!(resolved.locator, Locator::new("layer1"));
        assert_eq!(resolved.server.host, "a");
        assert!(!resolved.lifetime.is_pending());

        let record = store
            .get_deployment(deployment)
            .await
            .expect("get failed")
            .expect("missing");
        assert_eq!(record.state, PersistedState::Live);
        assert!(matches!(
            manager
                .check_lease_deployment(lease.id)
                .await
                .expect("check failed"),
            DeployStatus::Live { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_lease_is_not_found() {
        let (manager, _, _) = setup().await;

        assert!(matches!(
            manager.resolve_lease(LeaseId::new(9)).await,
            Err(ControlError::NotFound {
                kind: RecordKind::Lease,
                ..
            })
        ));
        assert!(matches!(
            manager.renew_lease(LeaseId::new(9), Duration::hours(1)).await,
            Err(ControlError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn lease_on_unknown_deployment_is_rejected() {
        let (manager, _, _) = setup().await;
        let result = manager
            .create_lease(&Locator::new("layer1"), DeploymentId::new(77), "x")
            .await;
        assert!(matches!(result, Err(ControlError::NotFound { .. })));
    }

    #[tokio::test]
    async fn lease_created_after_completion_is_timed() {
        let (manager, store, deployment) = setup().await;
        store
            .transition(
                deployment,
                Transition::Complete {
                    lease_expiry: Utc::now() + Duration::hours(1),
                },
            )
            .await
            .expect("complete failed");

        let before = Utc::now();
        let lease = manager
            .create_lease(&Locator::new("layer1"), deployment, "late")
            .await
            .expect("create failed");

        let expiry = lease.lifetime.expiry().expect("lease left pending");
        assert!(expiry >= before + Duration::hours(1));

        let stored = manager.list_leases(deployment).await.expect("list failed");
        assert_eq!(stored[0].lifetime, lease.lifetime);
    }

    #[tokio::test]
    async fn negative_ttl_is_rejected() {
        let (manager, _, deployment) = setup().await;
        let lease = manager
            .attach_lease(&Locator::new("layer1"), deployment, "x", Duration::hours(1))
            .await
            .expect("attach failed");

        let renewed = manager.renew_lease(lease.id, Duration::hours(-5)).await;
        assert!(matches!(renewed, Err(ControlError::InvalidTtl(_))));

        let attached = manager
            .attach_lease(&Locator::new("layer1"), deployment, "y", Duration::seconds(-1))
            .await;
        assert!(matches!(attached, Err(ControlError::InvalidTtl(_))));

        let leases = manager.list_leases(deployment).await.expect("list failed");
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].lifetime, lease.lifetime);
    }

    #[test]
    fn expiry_bounds() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, Duration::zero()).ok(), Some(now));
        assert!(expiry_after(now, Duration::milliseconds(-1)).is_err());
        assert!(expiry_after(DateTime::<Utc>::MAX_UTC, Duration::seconds(1)).is_err());
    }
}
