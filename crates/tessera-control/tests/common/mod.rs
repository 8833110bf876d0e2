//! Common test utilities for lifecycle integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use tessera_control::{
    ControlConfig, DeploymentId, Lease, LeaseLifetime, Lifecycle, LifecycleStore, Locator,
    MemoryStore, NewLease, Server,
};

/// Lifecycle components over a fresh in-memory store.
pub struct TestLifecycle {
    pub store: Arc<MemoryStore>,
    pub lifecycle: Lifecycle,
}

impl TestLifecycle {
    /// Creates a lifecycle with no servers registered.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = Lifecycle::new(
            Arc::clone(&store) as Arc<dyn LifecycleStore>,
            &ControlConfig::default(),
        );
        Self { store, lifecycle }
    }

    /// Creates a lifecycle with the given servers registered in order.
    pub async fn with_servers(servers: &[Server]) -> Self {
        let test = Self::new();
        for server in servers {
            test.store
                .register_server(server)
                .await
                .expect("register failed");
        }
        test
    }

    /// Inserts a timed lease that ran out `secs_ago` seconds ago.
    pub async fn expired_lease(
        &self,
        locator: &Locator,
        deployment: DeploymentId,
        secs_ago: i64,
    ) -> Lease {
        self.store
            .insert_lease(&NewLease {
                locator: locator.clone(),
                deployment,
                lifetime: LeaseLifetime::ActiveUntil(Utc::now() - TimeDelta::seconds(secs_ago)),
                activation_expiry: None,
                tag: b"holder".to_vec(),
            })
            .await
            .expect("insert failed")
    }
}

/// The single server used by the reference scenarios.
pub fn server_a() -> Server {
    Server::new("a", 8080, "/data")
}

/// A server with a given response time.
pub fn server_with_latency(host: &str, millis: u64) -> Server {
    Server::new(host, 8080, "/data").with_response_time(Duration::from_millis(millis))
}
