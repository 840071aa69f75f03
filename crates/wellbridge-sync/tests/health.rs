//! Permission negotiation and the two sync phases, driven through the
//! health bloc of a running bridge.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{eventually, within, Fixture};
use wellbridge_core::permission::{ServiceAvailability, CRITICAL_PERMISSIONS, PHYSICAL_ACTIVITY_PERMISSIONS};
use wellbridge_core::{HealthPermission, HealthPermissionStatus, SyncPhase};
use wellbridge_db::{Database, DbConfig};
use wellbridge_sync::simulated::PermissionScript;
use wellbridge_sync::{BridgeError, PhaseOutcome};

fn identifiers(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn critical() -> Vec<String> {
    identifiers(&["weight", "height", "steps", "sleep_asleep"])
}

// =============================================================================
// Permissions
// =============================================================================

#[tokio::test]
async fn test_partial_grant_is_not_granted() {
    let fx = Fixture::new();
    fx.platform.script(PermissionScript::Grant(BTreeSet::from([
        HealthPermission::Weight,
        HealthPermission::Height,
    ])));
    let bridge = fx.start(common::config()).await;

    let authorization = bridge.health.request_permissions(critical()).await.unwrap();

    assert_eq!(authorization.status, HealthPermissionStatus::PartiallyGranted);
    assert_eq!(
        authorization.granted,
        BTreeSet::from([HealthPermission::Weight, HealthPermission::Height])
    );
    assert_eq!(
        bridge.health.state().permission_status(),
        Some(HealthPermissionStatus::PartiallyGranted)
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_physical_activity_is_itemized() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    bridge
        .health
        .request_permissions(identifiers(&["physical_activity"]))
        .await
        .unwrap();

    let requested = fx.platform.last_requested().unwrap();
    assert!(requested.is_superset(&BTreeSet::from(PHYSICAL_ACTIVITY_PERMISSIONS)));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_unknown_identifiers_are_skipped() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    let authorization = bridge
        .health
        .request_permissions(identifiers(&["weight", "teleportation"]))
        .await
        .unwrap();

    assert_eq!(fx.platform.last_requested(), Some(BTreeSet::from([HealthPermission::Weight])));
    assert!(authorization.granted.contains(&HealthPermission::Weight));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_check_has_no_side_effects() {
    let fx = Fixture::new();
    fx.platform.set_granted([HealthPermission::Steps, HealthPermission::Weight]);
    let bridge = fx.start(common::config()).await;

    let types = BTreeSet::from(CRITICAL_PERMISSIONS);
    let first = bridge.health.check_permissions(&types).await.unwrap();
    let second = bridge.health.check_permissions(&types).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.get(&HealthPermission::Steps), Some(&true));
    assert_eq!(first.get(&HealthPermission::Height), Some(&false));
    assert_eq!(fx.platform.request_count(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_second_request_is_rejected_until_first_resolves() {
    let fx = Fixture::new();
    fx.platform.script(PermissionScript::Hold);
    let bridge = fx.start(common::config()).await;

    let health = bridge.health.clone();
    let first = tokio::spawn(async move { health.request_permissions(critical()).await });
    eventually(|| fx.platform.has_pending()).await;

    let second = bridge.health.request_permissions(critical()).await;
    assert!(matches!(second, Err(BridgeError::RequestInFlight)));
    assert_eq!(fx.platform.request_count(), 1);

    assert!(fx.platform.resolve_pending(true));
    let authorization = within(first).await.unwrap().unwrap();
    assert_eq!(authorization.status, HealthPermissionStatus::Granted);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_settings_fallback_resolves_the_request() {
    let fx = Fixture::new();
    fx.platform.script(PermissionScript::LaunchFails);
    fx.platform.grant_in_settings(CRITICAL_PERMISSIONS);
    let bridge = fx.start(common::config()).await;

    let authorization = within(bridge.health.request_permissions(critical()))
        .await
        .unwrap();

    assert_eq!(authorization.status, HealthPermissionStatus::Granted);
    assert_eq!(fx.platform.settings_opened(), 1);

    // The slot is free again.
    fx.platform.script(PermissionScript::GrantAll);
    bridge
        .health
        .request_permissions(identifiers(&["heart_rate"]))
        .await
        .unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_missing_service_is_unavailable_not_denied() {
    let fx = Fixture::new();
    fx.platform.set_availability(ServiceAvailability::not_installed());
    let bridge = fx.start(common::config()).await;

    let result = bridge.health.request_permissions(critical()).await;

    assert!(matches!(result, Err(BridgeError::PermissionUnavailable(_))));
    assert_eq!(fx.platform.request_count(), 0);
    assert_eq!(
        bridge.health.state().permission_status(),
        Some(HealthPermissionStatus::Unavailable)
    );

    bridge.shutdown().await;
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn test_digital_twin_outlives_its_observer() {
    let fx = Fixture::with_grants();
    fx.hub.set_upload_delay(Duration::from_millis(20));
    let bridge = fx.start(common::config()).await;

    let job = bridge.health.start_sync(SyncPhase::DigitalTwin).await.unwrap();
    let mut progress = job.progress();
    within(progress.wait_for(|p| p.successful_uploads > 0)).await.unwrap();

    // The screen goes away.
    drop(progress);
    drop(job);

    let mut late = bridge
        .health
        .watch_progress(SyncPhase::DigitalTwin)
        .await
        .unwrap()
        .unwrap();
    let done = within(late.wait_for(|p| p.is_complete)).await.unwrap().clone();

    assert_eq!(done.successful_uploads, 20);
    assert_eq!(done.percentage, 1.0);
    let state = common::wait_health(&bridge.health, |s| s.last_digital_twin.is_some()).await;
    assert!(!state.is_syncing(SyncPhase::DigitalTwin));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_progress_never_goes_backwards() {
    let fx = Fixture::with_grants();
    fx.hub.set_upload_delay(Duration::from_millis(5));
    let bridge = fx.start(common::config()).await;

    let job = bridge.health.start_sync(SyncPhase::DigitalTwin).await.unwrap();
    let mut progress = job.progress();

    let mut seen = vec![progress.borrow_and_update().percentage];
    within(async {
        loop {
            if progress.changed().await.is_err() {
                break;
            }
            let snapshot = progress.borrow_and_update().clone();
            seen.push(snapshot.percentage);
            if snapshot.is_complete {
                break;
            }
        }
    })
    .await;

    assert!(seen.len() > 2);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&1.0));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_rejected_batch_is_counted_not_fatal() {
    let fx = Fixture::with_grants();
    fx.hub.fail_uploads(1, false);
    let bridge = fx.start(common::config()).await;

    let job = bridge.health.start_sync(SyncPhase::BodyPrep).await.unwrap();
    let PhaseOutcome::Completed(summary) = within(job.wait()).await else {
        panic!("body prep did not complete");
    };

    // 4 critical types over 2 days, batches of 4.
    assert_eq!(summary.total_data_points, 8);
    assert_eq!(summary.successful_uploads, 4);
    assert_eq!(summary.failed_uploads, 4);
    assert_eq!(fx.hub.upload_calls(), 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_sync_without_permissions_fails() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    let job = bridge.health.start_sync(SyncPhase::BodyPrep).await.unwrap();
    assert!(matches!(within(job.wait()).await, PhaseOutcome::Failed(_)));
    assert_eq!(fx.hub.network_calls(), 0);

    let state = common::wait_health(&bridge.health, |s| s.error_message.is_some()).await;
    assert!(state.last_body_prep.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_finished_phase_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");
    let fx = Fixture::with_grants();

    {
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let bridge = fx.start_with_history(common::config(), db.sync_runs()).await;
        let job = bridge.health.start_sync(SyncPhase::BodyPrep).await.unwrap();
        assert!(matches!(within(job.wait()).await, PhaseOutcome::Completed(_)));
        bridge.shutdown().await;

        let latest = db.sync_runs().latest(SyncPhase::BodyPrep).await.unwrap().unwrap();
        assert_eq!(latest.summary.total_data_points, 8);
        assert_eq!(latest.summary.failed_uploads, 0);
        db.close().await;
    }

    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    let bridge = fx.start_with_history(common::config(), db.sync_runs()).await;
    let state = common::wait_health(&bridge.health, |s| s.last_body_prep.is_some()).await;
    assert_eq!(state.last_body_prep.unwrap().successful_uploads, 8);
    assert!(state.last_digital_twin.is_none());

    bridge.shutdown().await;
}
