//! Tessera Control
//!
//! This crate manages the lifecycle of deployments: datasets published onto
//! one of a pool of rendering servers. It places each deployment on the
//! fastest server, tracks it through provisioning and teardown, and finds
//! deployments that no lease keeps alive any more.
//!
//! # Architecture
//!
//! - **Placement**: choosing the server with the lowest response time and
//!   recording a `starting` deployment in the same atomic unit
//! - **State machine**: applying provisioning and teardown callbacks as
//!   conditional updates
//! - **Leases**: time-boxed claims of interest; pending leases are activated
//!   when their deployment goes live
//! - **Reaper**: a read-only scan for live deployments whose leases have all
//!   expired
//!
//! # State Machine
//!
//! ```text
//! Starting ──▶ Live ──▶ Killing ──▶ Dead
//!     │                              ▲
//!     └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera_control::{ControlConfig, Lifecycle, Locator, MemoryStore};
//!
//! let lifecycle = Lifecycle::new(Arc::new(MemoryStore::new()), &ControlConfig::default());
//!
//! let locator = Locator::new("layer1");
//! let (server, id) = lifecycle.deployments.start_deployment(&locator).await?;
//! let lease = lifecycle.leases.create_lease(&locator, id, "viewer-1").await?;
//!
//! // provisioning on `server` succeeded
//! lifecycle.deployments.complete_deployment(id).await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod error;
pub mod lease;
pub mod placement;
pub mod reaper;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::DeploymentManager;
pub use error::{ControlError, ControlResult, RecordKind};
pub use lease::LeaseManager;
pub use reaper::TimeoutReaper;
pub use service::{ControlService, Lifecycle};
pub use state::{Transition, Transitioned};
pub use store::{DeploymentFilter, LifecycleStore, MemoryStore, PostgresStore};
pub use types::{
    DeployStatus, DeploymentId, DeploymentRecord, ExpiredDeployment, Lease, LeaseId,
    LeaseLifetime, Locator, NewLease, PersistedState, ResolvedLease, Server, ServerAddr,
};
