//! Error types for tessera-control.

use std::fmt;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The durable store could not be reached or the transaction failed.
    ///
    /// The whole atomic unit was rolled back; callers may retry it.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// A requested row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was being looked up.
        kind: RecordKind,
        /// The key that was looked up.
        id: String,
    },

    /// No server is available to host a new deployment.
    #[error("placement failed: {0}")]
    Placement(String),

    /// The locator already has a starting or live deployment.
    #[error("deployment {id} already active for locator {locator}")]
    DeploymentAlreadyActive {
        /// Dataset locator.
        locator: String,
        /// The deployment that currently owns the locator, if known.
        id: String,
    },

    /// More rows were found than an invariant allows.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// A lease lifetime was requested that would end before now.
    #[error("invalid lease ttl: {0}")]
    InvalidTtl(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stored value could not be decoded.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: RecordKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a placement error.
    #[must_use]
    pub fn placement(msg: impl Into<String>) -> Self {
        Self::Placement(msg.into())
    }

    /// Create an integrity violation error.
    #[must_use]
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::IntegrityViolation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the whole operation.
    ///
    /// Nothing is retried inside the crate: retrying a placement could
    /// provision the same locator twice.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Placement(_) | Self::StoreUnavailable(_))
    }
}

/// Kind of record named in a [`ControlError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A rendering server.
    Server,
    /// A deployment.
    Deployment,
    /// A lease.
    Lease,
}

impl RecordKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Deployment => "deployment",
            Self::Lease => "lease",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
