//! In-memory lifecycle store for testing.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult, RecordKind};
use crate::placement::select_server;
use crate::state::{Step, Transition, Transitioned};
use crate::types::{
    DeploymentId, DeploymentRecord, Lease, LeaseId, LeaseLifetime, Locator, NewLease,
    PersistedState, ProtectedDeployment, Server, ServerAddr,
};

use super::{DeploymentFilter, LifecycleStore};

/// In-memory lifecycle store for testing.
///
/// All tables sit behind one lock so that multi-record operations are atomic.
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Registration order doubles as the placement tie-break.
    servers: Vec<Server>,
    deployments: BTreeMap<i64, DeploymentRow>,
    leases: BTreeMap<i64, Lease>,
    last_deployment_id: i64,
    last_lease_id: i64,
}

#[derive(Debug, Clone)]
struct DeploymentRow {
    id: DeploymentId,
    locator: Locator,
    server: ServerAddr,
    state: PersistedState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Tables {
    fn server(&self, addr: &ServerAddr) -> Option<&Server> {
        self.servers
            .iter()
            .find(|s| s.host == addr.host && s.port == addr.port)
    }

    fn hydrate(&self, row: &DeploymentRow) -> ControlResult<DeploymentRecord> {
        let server = self
            .server(&row.server)
            .ok_or_else(|| ControlError::not_found(RecordKind::Server, &row.server))?;

        Ok(DeploymentRecord {
            id: row.id,
            locator: row.locator.clone(),
            server: server.clone(),
            state: row.state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Tables>> {
        self.inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Tables>> {
        self.inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn register_server(&self, server: &Server) -> ControlResult<()> {
        let mut tables = self.write()?;

        match tables
            .servers
            .iter_mut()
            .find(|s| s.host == server.host && s.port == server.port)
        {
            Some(existing) => *existing = server.clone(),
            None => tables.servers.push(server.clone()),
        }

        Ok(())
    }

    async fn list_servers(&self) -> ControlResult<Vec<Server>> {
        Ok(self.read()?.servers.clone())
    }

    async fn update_response_time(
        &self,
        addr: &ServerAddr,
        response_time: Duration,
    ) -> ControlResult<()> {
        let mut tables = self.write()?;

        let server = tables
            .servers
            .iter_mut()
            .find(|s| s.host == addr.host && s.port == addr.port)
            .ok_or_else(|| ControlError::not_found(RecordKind::Server, addr))?;

        server.response_time = response_time;
        Ok(())
    }

    async fn place_deployment(&self, locator: &Locator) -> ControlResult<DeploymentRecord> {
        let mut guard = self.write()?;
        let tables = &mut *guard;

        let server = select_server(&tables.servers)
            .cloned()
            .ok_or_else(|| ControlError::placement("no servers registered"))?;

        if let Some(existing) = tables
            .deployments
            .values()
            .find(|d| &d.locator == locator && d.state.is_active())
        {
            return Err(ControlError::DeploymentAlreadyActive {
                locator: locator.to_string(),
                id: existing.id.to_string(),
            });
        }

        tables.last_deployment_id += 1;
        let now = Utc::now();
        let row = DeploymentRow {
            id: DeploymentId::new(tables.last_deployment_id),
            locator: locator.clone(),
            server: server.addr(),
            state: PersistedState::Starting,
            created_at: now,
            updated_at: now,
        };
        tables.deployments.insert(row.id.as_i64(), row.clone());

        Ok(DeploymentRecord {
            id: row.id,
            locator: row.locator,
            server,
            state: row.state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn get_deployment(&self, id: DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let tables = self.read()?;

        tables
            .deployments
            .get(&id.as_i64())
            .map(|row| tables.hydrate(row))
            .transpose()
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let tables = self.read()?;

        #[allow(clippy::as_conversions)]
        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);

        let mut results = Vec::new();
        for row in tables.deployments.values().rev() {
            if results.len() >= limit {
                break;
            }
            let record = tables.hydrate(row)?;
            if filter.matches(&record) {
                results.push(record);
            }
        }

        Ok(results)
    }

    async fn transition(
        &self,
        id: DeploymentId,
        transition: Transition,
    ) -> ControlResult<Transitioned> {
        let mut guard = self.write()?;
        let tables = &mut *guard;

        let row = tables
            .deployments
            .get_mut(&id.as_i64())
            .ok_or_else(|| ControlError::not_found(RecordKind::Deployment, id))?;

        if transition.check(row.state)? == Step::Skip {
            return Ok(Transitioned::Unchanged);
        }

        row.state = transition.to();
        row.updated_at = Utc::now();

        let mut leases_activated = 0;
        if let Some(expiry) = transition.lease_expiry() {
            for lease in tables
                .leases
                .values_mut()
                .filter(|l| l.deployment == id && l.lifetime.is_pending())
            {
                lease.lifetime = LeaseLifetime::ActiveUntil(expiry);
                leases_activated += 1;
            }
        }

        Ok(Transitioned::Applied { leases_activated })
    }

    async fn insert_lease(&self, lease: &NewLease) -> ControlResult<Lease> {
        let mut tables = self.write()?;

        // Read under the same lock as the insert so a concurrent completion
        // either sees this lease as pending or this insert sees it live.
        let state = tables
            .deployments
            .get(&lease.deployment.as_i64())
            .map(|row| row.state)
            .ok_or_else(|| ControlError::not_found(RecordKind::Deployment, lease.deployment))?;

        tables.last_lease_id += 1;
        let record = Lease {
            id: LeaseId::new(tables.last_lease_id),
            locator: lease.locator.clone(),
            deployment: lease.deployment,
            lifetime: lease.lifetime_for(state),
            tag: lease.tag.clone(),
        };
        tables.leases.insert(record.id.as_i64(), record.clone());

        Ok(record)
    }

    async fn renew_lease(&self, id: LeaseId, expiry: DateTime<Utc>) -> ControlResult<Lease> {
        let mut tables = self.write()?;

        let lease = tables
            .leases
            .get_mut(&id.as_i64())
            .ok_or_else(|| ControlError::not_found(RecordKind::Lease, id))?;

        lease.lifetime = LeaseLifetime::ActiveUntil(expiry);
        Ok(lease.clone())
    }

    async fn get_lease(&self, id: LeaseId) -> ControlResult<Option<Lease>> {
        Ok(self.read()?.leases.get(&id.as_i64()).cloned())
    }

    async fn list_leases(&self, deployment: DeploymentId) -> ControlResult<Vec<Lease>> {
        Ok(self
            .read()?
            .leases
            .values()
            .filter(|l| l.deployment == deployment)
            .cloned()
            .collect())
    }

    async fn protection_horizons(&self) -> ControlResult<Vec<ProtectedDeployment>> {
        let tables = self.read()?;

        tables
            .deployments
            .values()
            .filter(|row| row.state == PersistedState::Live)
            .map(|row| {
                let horizon = tables
                    .leases
                    .values()
                    .filter(|l| l.deployment == row.id)
                    .filter_map(|l| l.lifetime.expiry())
                    .max();
                Ok(ProtectedDeployment {
                    deployment: tables.hydrate(row)?,
                    horizon,
                })
            })
            .collect()
    }
}
