//! Durable storage for servers, deployments, and leases.
//!
//! This module provides the [`LifecycleStore`] trait and its implementations.
//! The primary implementation uses PostgreSQL, but an in-memory
//! implementation is provided for testing and local development.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ControlResult;
use crate::state::{Transition, Transitioned};
use crate::types::{
    DeploymentId, DeploymentRecord, Lease, LeaseId, Locator, NewLease, PersistedState,
    ProtectedDeployment, Server, ServerAddr,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by locator.
    pub locator: Option<Locator>,
    /// Filter by state.
    pub state: Option<PersistedState>,
    /// Only deployments that own their locator (`starting` or `live`).
    pub active_only: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locator: None,
            state: None,
            active_only: false,
            limit: None,
        }
    }

    /// Filter by locator.
    #[must_use]
    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Filter by state.
    #[must_use]
    pub const fn with_state(mut self, state: PersistedState) -> Self {
        self.state = Some(state);
        self
    }

    /// Only return `starting` and `live` deployments.
    #[must_use]
    pub const fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes the filter, ignoring `limit`.
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        if let Some(ref locator) = self.locator {
            if &record.locator != locator {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        !self.active_only || record.state.is_active()
    }
}

/// Backend for server, deployment, and lease records.
///
/// Every method is one atomic unit: either all of its writes become visible
/// or none do. Callers never need a lock of their own.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Register a server, or replace the record of an existing one.
    ///
    /// Re-registering keeps the server's original position in the
    /// placement tie-break order.
    async fn register_server(&self, server: &Server) -> ControlResult<()>;

    /// List servers in registration order.
    async fn list_servers(&self) -> ControlResult<Vec<Server>>;

    /// Record a new response-time sample for a server.
    ///
    /// Returns `NotFound` if the server is not registered.
    async fn update_response_time(
        &self,
        addr: &ServerAddr,
        response_time: Duration,
    ) -> ControlResult<()>;

    /// Select the best server and insert a `starting` deployment on it.
    ///
    /// Selection and insert form one atomic unit. Fails with `Placement`
    /// when no server is registered and with `DeploymentAlreadyActive` when
    /// the locator already has a `starting` or `live` deployment.
    async fn place_deployment(&self, locator: &Locator) -> ControlResult<DeploymentRecord>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get_deployment(&self, id: DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter criteria.
    ///
    /// Results are ordered newest first.
    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>>;

    /// Apply a state transition as a conditional update.
    ///
    /// For [`Transition::Complete`] every pending lease of the deployment is
    /// activated in the same atomic unit.
    async fn transition(
        &self,
        id: DeploymentId,
        transition: Transition,
    ) -> ControlResult<Transitioned>;

    /// Insert a lease and return it with its generated ID.
    ///
    /// The stored lifetime is [`NewLease::lifetime_for`] the deployment's
    /// state, read in the same atomic unit as the insert. Returns `NotFound`
    /// if the deployment does not exist.
    async fn insert_lease(&self, lease: &NewLease) -> ControlResult<Lease>;

    /// Set a lease's expiry, replacing whatever it was.
    ///
    /// Returns `NotFound` if the lease does not exist.
    async fn renew_lease(&self, id: LeaseId, expiry: DateTime<Utc>) -> ControlResult<Lease>;

    /// Get a lease by ID.
    async fn get_lease(&self, id: LeaseId) -> ControlResult<Option<Lease>>;

    /// List all leases of a deployment in creation order.
    async fn list_leases(&self, deployment: DeploymentId) -> ControlResult<Vec<Lease>>;

    /// List every `live` deployment with the latest expiry among its leases.
    async fn protection_horizons(&self) -> ControlResult<Vec<ProtectedDeployment>>;
}
