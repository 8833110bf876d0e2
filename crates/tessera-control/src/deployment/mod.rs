//! Deployment placement and lifecycle management.
//!
//! This module places new deployments on rendering servers and applies the
//! provisioning worker's outcome callbacks to the state machine.

mod manager;

pub use manager::DeploymentManager;
