//! Server selection for new deployments.
//!
//! Placement is greedy: the server with the lowest rolling response time wins,
//! and ties go to the server registered first. There is no capacity model.
//! The PostgreSQL store expresses the same ordering in SQL
//! (`ORDER BY response_time_us, seq`) so that selection and the deployment
//! insert run as one statement.

use crate::types::Server;

/// Pick the server a new deployment should be placed on.
///
/// `servers` must be in registration order. Returns `None` when the slice is
/// empty.
#[must_use]
pub fn select_server(servers: &[Server]) -> Option<&Server> {
    // min_by_key keeps the first of several equal minima
    servers.iter().min_by_key(|s| s.response_time)
}
