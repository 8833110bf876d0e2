//! Integration tests for deployment and lease lifecycle scenarios.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{server_a, server_with_latency, TestLifecycle};
use tessera_control::{
    ControlError, DeployStatus, DeploymentId, LeaseLifetime, LifecycleStore, Locator,
    PersistedState, ServerAddr, Transitioned,
};

#[tokio::test]
async fn single_server_deployment_goes_live() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let deployments = &test.lifecycle.deployments;
    let locator = Locator::new("layer1");

    let (server, id) = deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    assert_eq!(server, server_a());
    assert_eq!(id, DeploymentId::new(1));

    let record = deployments.get(id).await.expect("get failed").expect("missing");
    assert_eq!(record.locator, locator);
    assert_eq!(record.server.addr(), ServerAddr::new("a", 8080));
    assert_eq!(record.state, PersistedState::Starting);

    deployments.complete_deployment(id).await.expect("complete failed");

    assert_eq!(
        deployments
            .deployment_status(&locator)
            .await
            .expect("status failed"),
        DeployStatus::Live {
            id,
            server: server_a()
        }
    );
}

#[tokio::test]
async fn expired_deployment_is_reaped_and_torn_down() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = &test.lifecycle;
    let locator = Locator::new("layer1");

    let (_, id) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    lifecycle
        .deployments
        .complete_deployment(id)
        .await
        .expect("complete failed");
    test.expired_lease(&locator, id, 1).await;

    let expired = lifecycle
        .reaper
        .find_expired_deployments()
        .await
        .expect("scan failed");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, id);
    assert_eq!(expired[0].locator, locator);
    assert_eq!(expired[0].server, server_a());

    lifecycle
        .deployments
        .start_undeployment(id)
        .await
        .expect("start undeploy failed");
    lifecycle
        .deployments
        .complete_undeployment(id)
        .await
        .expect("complete undeploy failed");

    assert_eq!(
        lifecycle
            .deployments
            .deployment_status(&locator)
            .await
            .expect("status failed"),
        DeployStatus::Dead
    );
}

#[tokio::test]
async fn pending_leases_activate_on_completion_and_timed_leases_keep_lifetime() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = &test.lifecycle;
    let locator = Locator::new("layer1");

    let (_, id) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    let pending = lifecycle
        .leases
        .create_lease(&locator, id, "early-viewer")
        .await
        .expect("create failed");
    let timed = lifecycle
        .leases
        .attach_lease(&locator, id, "timed-viewer", Duration::minutes(5))
        .await
        .expect("attach failed");

    let activated_at = Utc::now();
    let outcome = lifecycle
        .deployments
        .complete_deployment(id)
        .await
        .expect("complete failed");
    assert_eq!(outcome, Transitioned::Applied { leases_activated: 1 });

    let leases = lifecycle.leases.list_leases(id).await.expect("list failed");
    let pending_now = leases.iter().find(|l| l.id == pending.id).expect("missing");
    let timed_now = leases.iter().find(|l| l.id == timed.id).expect("missing");

    let expiry = pending_now.lifetime.expiry().expect("still pending");
    assert!(expiry >= activated_at + Duration::hours(1));
    assert!(expiry < activated_at + Duration::hours(1) + Duration::minutes(1));
    assert_eq!(timed_now.lifetime, timed.lifetime);
}

#[tokio::test]
async fn lease_requested_after_completion_protects_and_expires() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = &test.lifecycle;
    let locator = Locator::new("layer1");

    let (_, id) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    lifecycle
        .deployments
        .complete_deployment(id)
        .await
        .expect("complete failed");

    let lease = lifecycle
        .leases
        .create_lease(&locator, id, "late")
        .await
        .expect("create failed");
    assert!(!lease.lifetime.is_pending());

    let now = Utc::now();
    assert!(lifecycle
        .reaper
        .find_expired_deployments_at(now)
        .await
        .expect("scan failed")
        .is_empty());

    let expired = lifecycle
        .reaper
        .find_expired_deployments_at(now + Duration::days(3650))
        .await
        .expect("scan failed");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, id);
}

#[tokio::test]
async fn renewal_protects_deployment_from_the_reaper() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = &test.lifecycle;
    let locator = Locator::new("layer1");

    let (_, id) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    lifecycle
        .deployments
        .complete_deployment(id)
        .await
        .expect("complete failed");
    let lease = test.expired_lease(&locator, id, 30).await;

    assert_eq!(
        lifecycle
            .reaper
            .find_expired_deployments()
            .await
            .expect("scan failed")
            .len(),
        1
    );

    lifecycle
        .leases
        .renew_lease(lease.id, Duration::hours(1))
        .await
        .expect("renew failed");

    assert!(lifecycle
        .reaper
        .find_expired_deployments()
        .await
        .expect("scan failed")
        .is_empty());
}

#[tokio::test]
async fn placement_prefers_lowest_response_time_then_registration_order() {
    let test = TestLifecycle::with_servers(&[
        server_with_latency("slow", 80),
        server_with_latency("fast-1", 4),
        server_with_latency("fast-2", 4),
    ])
    .await;

    let (server, _) = test
        .lifecycle
        .deployments
        .start_deployment(&Locator::new("layer1"))
        .await
        .expect("start failed");
    assert_eq!(server.host, "fast-1");

    test.store
        .update_response_time(&ServerAddr::new("fast-1", 8080), std::time::Duration::from_millis(9))
        .await
        .expect("update failed");

    let (server, _) = test
        .lifecycle
        .deployments
        .start_deployment(&Locator::new("layer2"))
        .await
        .expect("start failed");
    assert_eq!(server.host, "fast-2");
}

#[tokio::test]
async fn concurrent_starts_for_one_locator_place_once() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = Arc::new(test.lifecycle);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                lifecycle
                    .deployments
                    .start_deployment(&Locator::new("layer1"))
                    .await
            })
        })
        .collect();

    let mut placed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => placed += 1,
            Err(ControlError::DeploymentAlreadyActive { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(placed, 1);
    assert_eq!(rejected, 15);
    assert!(matches!(
        lifecycle
            .deployments
            .deployment_status(&Locator::new("layer1"))
            .await
            .expect("status failed"),
        DeployStatus::Starting { .. }
    ));
}

#[tokio::test]
async fn concurrent_starts_for_different_locators_all_succeed() {
    let test = TestLifecycle::with_servers(&[server_a(), server_with_latency("b", 2)]).await;
    let lifecycle = Arc::new(test.lifecycle);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                lifecycle
                    .deployments
                    .start_deployment(&Locator::new(format!("layer{i}")))
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let (_, id) = handle
            .await
            .expect("task panicked")
            .expect("start failed");
        ids.push(id);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn redeploy_after_failure_gets_new_id() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let deployments = &test.lifecycle.deployments;
    let locator = Locator::new("layer1");

    let (_, first) = deployments.start_deployment(&locator).await.expect("start failed");
    deployments.fail_deployment(first).await.expect("fail failed");
    assert_eq!(
        deployments.deployment_status(&locator).await.expect("status failed"),
        DeployStatus::Dead
    );

    let (_, second) = deployments.start_deployment(&locator).await.expect("start failed");
    assert_ne!(first, second);
    assert_eq!(
        deployments.deployment_status(&locator).await.expect("status failed"),
        DeployStatus::Starting { id: second }
    );
}

#[tokio::test]
async fn lease_tracks_its_own_deployment_not_the_locator() {
    let test = TestLifecycle::with_servers(&[server_a()]).await;
    let lifecycle = &test.lifecycle;
    let locator = Locator::new("layer1");

    let (_, first) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    let lease = lifecycle
        .leases
        .create_lease(&locator, first, "holder")
        .await
        .expect("create failed");
    lifecycle
        .deployments
        .fail_deployment(first)
        .await
        .expect("fail failed");

    let (_, second) = lifecycle
        .deployments
        .start_deployment(&locator)
        .await
        .expect("start failed");
    lifecycle
        .deployments
        .complete_deployment(second)
        .await
        .expect("complete failed");

    assert_eq!(
        lifecycle
            .leases
            .check_lease_deployment(lease.id)
            .await
            .expect("check failed"),
        DeployStatus::Dead
    );
    let resolved = lifecycle
        .leases
        .resolve_lease(lease.id)
        .await
        .expect("resolve failed");
    assert_eq!(resolved.lifetime, LeaseLifetime::Pending);
}
