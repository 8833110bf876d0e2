//! PostgreSQL lifecycle store implementation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult, RecordKind};
use crate::state::{Step, Transition, Transitioned};
use crate::types::{
    DeploymentId, DeploymentRecord, Lease, LeaseId, LeaseLifetime, Locator, NewLease,
    PersistedState, ProtectedDeployment, Server, ServerAddr,
};

use super::{DeploymentFilter, LifecycleStore};

/// Columns selected for a deployment joined with its server.
const DEPLOYMENT_COLUMNS: &str = r#"
    d.id, d.locator, d.state, d.created_at, d.updated_at,
    s.host, s.port, s.local_path, s.response_time_us
"#;

/// PostgreSQL-backed lifecycle store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                response_time_us BIGINT NOT NULL DEFAULT 0,
                seq BIGSERIAL NOT NULL,
                PRIMARY KEY (host, port)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id BIGSERIAL PRIMARY KEY,
                locator TEXT NOT NULL,
                server_host TEXT NOT NULL,
                server_port INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                FOREIGN KEY (server_host, server_port) REFERENCES servers (host, port)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one starting/live deployment per locator.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_active_locator
            ON deployments (locator)
            WHERE state IN ('starting', 'live')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_state
            ON deployments (state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                id BIGSERIAL PRIMARY KEY,
                locator TEXT NOT NULL,
                deployment BIGINT NOT NULL REFERENCES deployments (id),
                lifetime TIMESTAMPTZ,
                tag BYTEA NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_leases_deployment
            ON leases (deployment)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a joined deployment/server row into a DeploymentRecord.
    fn row_to_deployment(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let id: i64 = row.get("id");
        let locator: String = row.get("locator");
        let state_str: String = row.get("state");
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        let state: PersistedState = state_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse state '{state_str}': {e}"))
        })?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(id),
            locator: Locator::new(locator),
            server: Self::row_to_server(row)?,
            state,
            created_at,
            updated_at,
        })
    }

    fn row_to_server(row: &PgRow) -> ControlResult<Server> {
        let host: String = row.get("host");
        let port: i32 = row.get("port");
        let local_path: String = row.get("local_path");
        let response_time_us: i64 = row.get("response_time_us");

        let port = u16::try_from(port)
            .map_err(|e| ControlError::Serialisation(format!("invalid port {port}: {e}")))?;

        Ok(Server {
            host,
            port,
            local_path: PathBuf::from(local_path),
            response_time: Duration::from_micros(u64::try_from(response_time_us).unwrap_or(0)),
        })
    }

    fn row_to_lease(row: &PgRow) -> Lease {
        let id: i64 = row.get("id");
        let locator: String = row.get("locator");
        let deployment: i64 = row.get("deployment");
        let lifetime: Option<DateTime<Utc>> = row.get("lifetime");
        let tag: Vec<u8> = row.get("tag");

        Lease {
            id: LeaseId::new(id),
            locator: Locator::new(locator),
            deployment: DeploymentId::new(deployment),
            lifetime: LeaseLifetime::from_expiry(lifetime),
            tag,
        }
    }
}

fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}


#[async_trait]
impl LifecycleStore for PostgresStore {
    async fn register_server(&self, server: &Server) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO servers (host, port, local_path, response_time_us)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (host, port) DO UPDATE
            SET local_path = EXCLUDED.local_path,
                response_time_us = EXCLUDED.response_time_us
            "#,
        )
        .bind(&server.host)
        .bind(i32::from(server.port))
        .bind(server.local_path.to_string_lossy().into_owned())
        .bind(micros(server.response_time))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_servers(&self) -> ControlResult<Vec<Server>> {
        let rows = sqlx::query(
            r#"
            SELECT host, port, local_path, response_time_us
            FROM servers
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_server).collect()
    }

    async fn update_response_time(
        &self,
        addr: &ServerAddr,
        response_time: Duration,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE servers
            SET response_time_us = $1
            WHERE host = $2 AND port = $3
            "#,
        )
        .bind(micros(response_time))
        .bind(&addr.host)
        .bind(i32::from(addr.port))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(RecordKind::Server, addr));
        }

        Ok(())
    }

    async fn place_deployment(&self, locator: &Locator) -> ControlResult<DeploymentRecord> {
        // Ranking and insert in one statement; the partial unique index
        // rejects a second starting/live row for the locator.
        let result = sqlx::query(
            r#"
            WITH s AS (
                SELECT host, port, local_path, response_time_us
                FROM servers
                ORDER BY response_time_us ASC, seq ASC
                LIMIT 1
            ), d AS (
                INSERT INTO deployments (locator, server_host, server_port, state)
                SELECT $1, s.host, s.port, 'starting' FROM s
                RETURNING id, locator, state, created_at, updated_at
            )
            SELECT d.id, d.locator, d.state, d.created_at, d.updated_at,
                   s.host, s.port, s.local_path, s.response_time_us
            FROM d CROSS JOIN s
            "#,
        )
        .bind(locator.as_str())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Self::row_to_deployment(&row),
            Ok(None) => Err(ControlError::placement("no servers registered")),
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .list_deployments(
                        &DeploymentFilter::new()
                            .with_locator(locator.clone())
                            .active_only()
                            .with_limit(1),
                    )
                    .await?;
                Err(ControlError::DeploymentAlreadyActive {
                    locator: locator.to_string(),
                    id: existing
                        .first()
                        .map_or_else(|| "unknown".to_owned(), |d| d.id.to_string()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(&self, id: DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM deployments d
            INNER JOIN servers s ON s.host = d.server_host AND s.port = d.server_port
            WHERE d.id = $1
            "#
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_deployment(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM deployments d
            INNER JOIN servers s ON s.host = d.server_host AND s.port = d.server_port
            WHERE 1=1
            "#
        );

        let mut params: Vec<String> = Vec::new();

        if let Some(ref locator) = filter.locator {
            params.push(locator.as_str().to_owned());
            query.push_str(&format!(" AND d.locator = ${}", params.len()));
        }

        if let Some(state) = filter.state {
            params.push(state.as_str().to_owned());
            query.push_str(&format!(" AND d.state = ${}", params.len()));
        }

        if filter.active_only {
            query.push_str(" AND d.state IN ('starting', 'live')");
        }

        query.push_str(" ORDER BY d.id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn transition(
        &self,
        id: DeploymentId,
        transition: Transition,
    ) -> ControlResult<Transitioned> {
        // Dropping the transaction without commit rolls it back.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT state FROM deployments WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::not_found(RecordKind::Deployment, id))?;

        let state_str: String = row.get("state");
        let current: PersistedState = state_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse state '{state_str}': {e}"))
        })?;

        if transition.check(current)? == Step::Skip {
            debug!(deployment_id = %id, state = %current, "transition already applied");
            return Ok(Transitioned::Unchanged);
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET state = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(transition.to().as_str())
        .bind(id.as_i64())
        .execute(&mut *tx)
        .await?;

        let mut leases_activated = 0;
        if let Some(expiry) = transition.lease_expiry() {
            leases_activated = sqlx::query(
                r#"
                UPDATE leases
                SET lifetime = $1
                WHERE deployment = $2 AND lifetime IS NULL
                "#,
            )
            .bind(expiry)
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        Ok(Transitioned::Applied { leases_activated })
    }

    async fn insert_lease(&self, lease: &NewLease) -> ControlResult<Lease> {
        // FOR SHARE conflicts with the FOR UPDATE taken by transitions, so the
        // state read here is the one the insert commits against. A pending
        // request on a live deployment takes the activation expiry.
        let row = sqlx::query(
            r#"
            INSERT INTO leases (locator, deployment, lifetime, tag)
            SELECT $1, d.id,
                   CASE
                       WHEN $3::timestamptz IS NULL AND d.state = 'live'
                           THEN $5::timestamptz
                       ELSE $3::timestamptz
                   END,
                   $4
            FROM deployments d
            WHERE d.id = $2
            FOR SHARE
            RETURNING id, locator, deployment, lifetime, tag
            "#,
        )
        .bind(lease.locator.as_str())
        .bind(lease.deployment.as_i64())
        .bind(lease.lifetime.expiry())
        .bind(&lease.tag)
        .bind(lease.activation_expiry)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlError::not_found(RecordKind::Deployment, lease.deployment))?;

        Ok(Self::row_to_lease(&row))
    }

    async fn renew_lease(&self, id: LeaseId, expiry: DateTime<Utc>) -> ControlResult<Lease> {
        let row = sqlx::query(
            r#"
            UPDATE leases
            SET lifetime = $1
            WHERE id = $2
            RETURNING id, locator, deployment, lifetime, tag
            "#,
        )
        .bind(expiry)
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlError::not_found(RecordKind::Lease, id))?;

        Ok(Self::row_to_lease(&row))
    }

    async fn get_lease(&self, id: LeaseId) -> ControlResult<Option<Lease>> {
        let row = sqlx::query(
            r#"
            SELECT id, locator, deployment, lifetime, tag
            FROM leases
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_lease))
    }

    async fn list_leases(&self, deployment: DeploymentId) -> ControlResult<Vec<Lease>> {
        let rows = sqlx::query(
            r#"
            SELECT id, locator, deployment, lifetime, tag
            FROM leases
            WHERE deployment = $1
            ORDER BY id
            "#,
        )
        .bind(deployment.as_i64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_lease).collect())
    }

    async fn protection_horizons(&self) -> ControlResult<Vec<ProtectedDeployment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}, MAX(l.lifetime) AS horizon
            FROM deployments d
            INNER JOIN servers s ON s.host = d.server_host AND s.port = d.server_port
            LEFT JOIN leases l ON l.deployment = d.id
            WHERE d.state = 'live'
            GROUP BY d.id, s.host, s.port
            ORDER BY d.id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let horizon: Option<DateTime<Utc>> = row.get("horizon");
                Ok(ProtectedDeployment {
                    deployment: Self::row_to_deployment(row)?,
                    horizon,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
