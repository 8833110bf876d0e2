//! Lease management.
//!
//! Leases keep deployments alive. A lease is either pending (created before
//! its deployment went live) or timed; only timed leases protect anything.

mod manager;

pub use manager::{expiry_after, LeaseManager};
