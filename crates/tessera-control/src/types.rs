//! Core types for tessera-control.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(i64);

impl DeploymentId {
    /// Wrap a raw store identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw identifier.
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier for a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wrap a raw store identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw identifier.
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a published dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    /// Create a new locator.
    #[must_use]
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    /// Get the locator as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Locator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Network address that identifies a rendering server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Host name or IP address.
    pub host: String,
    /// Port the rendering process listens on.
    pub port: u16,
}

impl ServerAddr {
    /// Create a new server address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A rendering node that can host deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Host name or IP address.
    pub host: String,
    /// Port the rendering process listens on.
    pub port: u16,
    /// Filesystem root for datasets on that node.
    pub local_path: PathBuf,
    /// Rolling response time, maintained by an external monitor.
    pub response_time: Duration,
}

impl Server {
    /// Create a server with a zero response time.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, local_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            local_path: local_path.into(),
            response_time: Duration::ZERO,
        }
    }

    /// Set the initial response time.
    #[must_use]
    pub const fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = response_time;
        self
    }

    /// Get the address identifying this server.
    #[must_use]
    pub fn addr(&self) -> ServerAddr {
        ServerAddr::new(self.host.clone(), self.port)
    }
}

/// Persisted deployment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedState {
    /// Placed on a server, provisioning in progress.
    Starting,
    /// Provisioned and serving.
    Live,
    /// Teardown initiated.
    Killing,
    /// Terminal: failed to provision or torn down.
    Dead,
}

impl PersistedState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Live => "live",
            Self::Killing => "killing",
            Self::Dead => "dead",
        }
    }

    /// Whether the state owns its locator (`starting` or `live`).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Live)
    }
}

impl fmt::Display for PersistedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PersistedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "live" => Ok(Self::Live),
            "killing" => Ok(Self::Killing),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("unknown deployment state: {s}")),
        }
    }
}

/// A deployment record as stored, joined with its server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Dataset being published.
    pub locator: Locator,
    /// Server hosting the deployment.
    pub server: Server,
    /// Current state.
    pub state: PersistedState,
    /// When the deployment was placed.
    pub created_at: DateTime<Utc>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

/// Lifetime of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "until", rename_all = "snake_case")]
pub enum LeaseLifetime {
    /// Not yet activated; protects nothing.
    Pending,
    /// Protects its deployment until the given instant.
    ActiveUntil(DateTime<Utc>),
}

impl LeaseLifetime {
    /// Decode from a nullable store column.
    #[must_use]
    pub const fn from_expiry(expiry: Option<DateTime<Utc>>) -> Self {
        match expiry {
            Some(until) => Self::ActiveUntil(until),
            None => Self::Pending,
        }
    }

    /// The expiry instant, or `None` while pending.
    #[must_use]
    pub const fn expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::ActiveUntil(until) => Some(*until),
        }
    }

    /// Whether the lease has not been activated yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Whether the lease still protects its deployment at `now`.
    #[must_use]
    pub fn protects_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Pending => false,
            Self::ActiveUntil(until) => *until >= now,
        }
    }
}

/// A time-boxed claim of interest in a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identifier.
    pub id: LeaseId,
    /// Dataset the lease was taken for.
    pub locator: Locator,
    /// Deployment the lease protects.
    pub deployment: DeploymentId,
    /// Expiry of the lease.
    pub lifetime: LeaseLifetime,
    /// Opaque holder identification.
    pub tag: Vec<u8>,
}

/// A lease that has not been assigned an identifier yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLease {
    /// Dataset the lease is taken for.
    pub locator: Locator,
    /// Deployment the lease protects.
    pub deployment: DeploymentId,
    /// Initial expiry.
    pub lifetime: LeaseLifetime,
    /// Expiry used in place of a pending lifetime when the deployment is
    /// already live at insert time.
    pub activation_expiry: Option<DateTime<Utc>>,
    /// Opaque holder identification.
    pub tag: Vec<u8>,
}

impl NewLease {
    /// Lifetime to store for this lease given the deployment's state at
    /// insert time.
    ///
    /// A pending lease on a live deployment would never be activated, so it
    /// takes `activation_expiry` instead.
    #[must_use]
    pub fn lifetime_for(&self, state: PersistedState) -> LeaseLifetime {
        match (self.lifetime, self.activation_expiry) {
            (LeaseLifetime::Pending, Some(expiry)) if state == PersistedState::Live => {
                LeaseLifetime::ActiveUntil(expiry)
            }
            (lifetime, _) => lifetime,
        }
    }
}

/// Externally visible status of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployStatus {
    /// Provisioning in progress.
    Starting {
        /// Deployment identifier.
        id: DeploymentId,
    },
    /// Serving from the given server.
    Live {
        /// Deployment identifier.
        id: DeploymentId,
        /// Server to route requests to.
        server: Server,
    },
    /// Teardown in progress.
    Killing,
    /// Torn down, failed, or never deployed.
    Dead,
}

impl DeployStatus {
    /// Status reported for a stored deployment.
    #[must_use]
    pub fn from_record(record: &DeploymentRecord) -> Self {
        match record.state {
            PersistedState::Starting => Self::Starting { id: record.id },
            PersistedState::Live => Self::Live {
                id: record.id,
                server: record.server.clone(),
            },
            PersistedState::Killing => Self::Killing,
            PersistedState::Dead => Self::Dead,
        }
    }
}

/// A lease dereferenced to the server currently hosting its deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLease {
    /// Dataset the lease was taken for.
    pub locator: Locator,
    /// Expiry of the lease.
    pub lifetime: LeaseLifetime,
    /// Server hosting the deployment.
    pub server: Server,
}

/// A live deployment together with its protection horizon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedDeployment {
    /// The live deployment.
    pub deployment: DeploymentRecord,
    /// Latest expiry over its timed leases, `None` if it has none.
    pub horizon: Option<DateTime<Utc>>,
}

/// A live deployment that no lease protects any longer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredDeployment {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Dataset being published.
    pub locator: Locator,
    /// Server hosting the deployment.
    pub server: Server,
}
