//! Deployment state machine.
//!
//! Deployments move along a fixed set of edges:
//!
//! ```text
//! Starting ──▶ Live ──▶ Killing ──▶ Dead
//!     │                              ▲
//!     └──────────────────────────────┘
//! ```
//!
//! Each edge is a [`Transition`]. Stores apply a transition as one conditional
//! update: the row must currently be in [`Transition::from`], otherwise the
//! update is rejected. A row already in [`Transition::to`] is left alone so
//! that repeated callbacks from the provisioning worker are harmless.

use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::types::PersistedState;

/// A single edge of the deployment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `starting -> live`, activating pending leases until `lease_expiry`.
    Complete {
        /// Expiry given to every pending lease of the deployment.
        lease_expiry: DateTime<Utc>,
    },
    /// `starting -> dead`.
    Fail,
    /// `live -> killing`.
    StartUndeploy,
    /// `killing -> dead`.
    CompleteUndeploy,
}

impl Transition {
    /// State the deployment must be in for the transition to apply.
    #[must_use]
    pub const fn from(&self) -> PersistedState {
        match self {
            Self::Complete { .. } | Self::Fail => PersistedState::Starting,
            Self::StartUndeploy => PersistedState::Live,
            Self::CompleteUndeploy => PersistedState::Killing,
        }
    }

    /// State the deployment is in afterwards.
    #[must_use]
    pub const fn to(&self) -> PersistedState {
        match self {
            Self::Complete { .. } => PersistedState::Live,
            Self::StartUndeploy => PersistedState::Killing,
            Self::Fail | Self::CompleteUndeploy => PersistedState::Dead,
        }
    }

    /// Operation name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete_deployment",
            Self::Fail => "fail_deployment",
            Self::StartUndeploy => "start_undeployment",
            Self::CompleteUndeploy => "complete_undeployment",
        }
    }

    /// Pending-lease expiry to apply alongside the state change.
    #[must_use]
    pub const fn lease_expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Complete { lease_expiry } => Some(*lease_expiry),
            _ => None,
        }
    }

    /// Decide what applying this transition to a row in `current` does.
    ///
    /// Stores call this while holding the row, so the check and the write
    /// form one atomic unit.
    pub fn check(&self, current: PersistedState) -> ControlResult<Step> {
        if current == self.from() {
            Ok(Step::Apply)
        } else if current == self.to() {
            Ok(Step::Skip)
        } else {
            Err(ControlError::InvalidStateTransition {
                from: current.as_str(),
                to: self.to().as_str(),
            })
        }
    }
}

/// What a store should do with a row, as decided by [`Transition::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Write the new state.
    Apply,
    /// The row is already in the target state.
    Skip,
}

/// Outcome of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transitioned {
    /// The state changed.
    Applied {
        /// Number of pending leases that received an expiry.
        leases_activated: u64,
    },
    /// The deployment was already in the target state.
    Unchanged,
}

impl Transitioned {
    /// Whether the state changed.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}
