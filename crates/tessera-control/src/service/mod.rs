//! Service lifecycle management.
//!
//! Provides the main service runner with the periodic expiry sweep, signal
//! handling, and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ControlConfig, StoreBackend};
use crate::deployment::DeploymentManager;
use crate::error::ControlResult;
use crate::lease::LeaseManager;
use crate::reaper::TimeoutReaper;
use crate::store::{LifecycleStore, MemoryStore, PostgresStore};

/// The lifecycle components sharing one store.
#[derive(Debug)]
pub struct Lifecycle {
    /// Placement and state transitions.
    pub deployments: DeploymentManager,
    /// Lease issue and renewal.
    pub leases: LeaseManager,
    /// Expiry detection.
    pub reaper: TimeoutReaper,
}

impl Lifecycle {
    /// Wire all components to `store`.
    pub fn new(store: Arc<dyn LifecycleStore>, config: &ControlConfig) -> Self {
        Self {
            deployments: DeploymentManager::new(Arc::clone(&store), config.leases.clone()),
            leases: LeaseManager::new(Arc::clone(&store), config.leases.clone()),
            reaper: TimeoutReaper::new(store),
        }
    }
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired deployments found.
    pub expired: usize,
    /// Deployments moved to `killing` by this sweep.
    pub undeploying: usize,
}

/// Find expired deployments and, if `auto_undeploy` is set, start tearing
/// them down.
///
/// A failure to undeploy one deployment is logged and does not stop the
/// others; failing to scan at all is returned.
pub async fn sweep(lifecycle: &Lifecycle, auto_undeploy: bool) -> ControlResult<SweepReport> {
    let expired = lifecycle.reaper.find_expired_deployments().await?;
    let mut report = SweepReport {
        expired: expired.len(),
        undeploying: 0,
    };

    for candidate in expired {
        if !auto_undeploy {
            info!(
                deployment_id = %candidate.id,
                locator = %candidate.locator,
                server = %candidate.server.addr(),
                "deployment expired"
            );
            continue;
        }

        match lifecycle.deployments.start_undeployment(candidate.id).await {
            Ok(outcome) if outcome.is_applied() => report.undeploying += 1,
            Ok(_) => {}
            Err(e) => warn!(
                deployment_id = %candidate.id,
                error = %e,
                "failed to start undeployment"
            ),
        }
    }

    Ok(report)
}

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Store connection
/// - Periodic expiry sweep
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the configured store (or use in-memory store as fallback)
    /// 2. Create the lifecycle components
    /// 3. Sweep for expired deployments until a shutdown signal arrives
    pub async fn run(&self) -> ControlResult<()> {
        let store = self.create_store().await;
        self.run_with_store(store).await
    }

    /// Run the control service against an existing store.
    pub async fn run_with_store(&self, store: Arc<dyn LifecycleStore>) -> ControlResult<()> {
        let lifecycle = Lifecycle::new(store, &self.config);
        info!("lifecycle manager initialised");

        let shutdown = shutdown_signal(self.cancel.clone());
        tokio::pin!(shutdown);

        if !self.config.reaper.enabled {
            info!("expiry sweep disabled");
            shutdown.await;
            info!("control service shutdown complete");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.config.reaper.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.reaper.interval_secs,
            auto_undeploy = self.config.reaper.auto_undeploy,
            "expiry sweep running"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    match sweep(&lifecycle, self.config.reaper.auto_undeploy).await {
                        Ok(report) => debug!(
                            expired = report.expired,
                            undeploying = report.undeploying,
                            "expiry sweep finished"
                        ),
                        Err(e) => error!(error = %e, "expiry sweep failed"),
                    }
                }
            }
        }

        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn LifecycleStore> {
        if self.config.store.backend == StoreBackend::Memory {
            info!("using in-memory store");
            return Arc::new(MemoryStore::new());
        }

        match PostgresStore::new(&self.config.database).await {
            Ok(store) => {
                info!(url = %self.config.database.url, "connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
