//! End-to-end handoff: token issue, browser launch, realtime validation,
//! reconnect codes, retries and disconnect.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{eventually, start_time, within, Fixture};
use wellbridge_core::connection::{ConnectionStatus, RealtimeStatus};
use wellbridge_core::SyncPhase;
use wellbridge_db::{keys, PrefValue};
use wellbridge_sync::ports::{KeyValueStore, TokenValidation};
use wellbridge_sync::realtime::{RealtimeChannel, RealtimeSubscription, RealtimeUpdate};
use wellbridge_sync::simulated::SimulatedRealtime;
use wellbridge_sync::BridgeError;

fn status_is(status: ConnectionStatus) -> impl Fn(&wellbridge_core::connection::ConnectionState) -> bool {
    move |s| s.status == status
}

#[tokio::test]
async fn test_validation_links_device_and_starts_body_prep() {
    let fx = Fixture::with_grants();
    let bridge = fx.start(common::config()).await;

    let state = bridge.connection.connect().await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Connecting);

    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    assert!(state.is_awaiting_web_validation);
    assert_eq!(state.connection_code.as_deref(), Some("TKN0-0001"));
    assert!(state.device_name.is_none());
    assert_eq!(fx.realtime.subscribed_tokens(), vec!["TKN00001".to_string()]);

    eventually(|| !fx.launcher.opened().is_empty()).await;
    let opened = fx.launcher.opened();
    assert!(opened[0].as_str().starts_with("https://hub.wellbridge.app/connect?"));
    assert!(opened[0].as_str().contains("token=TKN00001"));
    assert!(opened[0].as_str().contains(common::DEVICE_ID));

    // Nothing links until the web side confirms.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.connection.state().status, ConnectionStatus::AwaitingWebValidation);

    assert_eq!(fx.realtime.validate("TKN00001", "Ada's Pixel").await, 1);

    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));
    assert_eq!(state.last_sync, Some(start_time()));
    assert!(state.error_message.is_none());
    assert!(!state.sync_degraded);
    assert!(state.invariants_hold());
    assert!(fx.hub.uploaded() > 0);

    assert_eq!(
        fx.store.get_string(keys::CONNECTION_DEVICE_NAME).await.unwrap().as_deref(),
        Some("Ada's Pixel")
    );
    assert!(fx.store.get_string(keys::CONNECTION_LAST_SYNC).await.unwrap().is_some());

    // Digital Twin follows Body Prep.
    let health = common::wait_health(&bridge.health, |s| s.last_digital_twin.is_some()).await;
    assert!(health.last_body_prep.is_some());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_sync_intro_waits_for_acknowledgement() {
    let fx = Fixture::with_grants();
    let mut config = common::config();
    config.connection.show_sync_intro = true;
    let bridge = fx.start(config).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    fx.realtime.validate("TKN00001", "Ada's Pixel").await;

    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::SyncIntro)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));
    assert_eq!(fx.hub.upload_calls(), 0);

    let state = bridge.connection.acknowledge_sync_intro().await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Syncing);

    within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert!(fx.hub.upload_calls() > 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_is_never_accepted() {
    let fx = Fixture::with_grants();
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();

    fx.clock.advance(chrono::Duration::minutes(31));
    fx.realtime.validate("TKN00001", "Ada's Pixel").await;

    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Error)))
        .await
        .unwrap();
    assert!(state.error_message.unwrap().contains("expired"));
    assert!(state.device_name.is_none());
    assert!(!state.is_awaiting_web_validation);
    assert!(fx.store.get(keys::CONNECTION_DEVICE_NAME).await.unwrap().is_none());
    assert!(bridge.tokens.current_token().await.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_regenerated_token_supersedes_previous() {
    let fx = Fixture::with_grants();
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(|s| {
        s.status == ConnectionStatus::AwaitingWebValidation
            && s.connection_code.as_deref() == Some("TKN0-0002")
    }))
    .await
    .unwrap();
    assert!(state.is_awaiting_web_validation);
    assert_eq!(
        bridge.tokens.current_token().await.map(|t| t.raw().to_string()),
        Some("TKN00002".to_string())
    );

    // The first code still has time left but no longer links.
    fx.realtime.validate("TKN00001", "Old tab").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.connection.state().status, ConnectionStatus::AwaitingWebValidation);

    fx.realtime.validate("TKN00002", "Ada's Pixel").await;
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_malformed_code_is_rejected_before_any_network_call() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    let state = bridge.connection.reconnect_with_code("abc123").await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Error);
    assert!(state.error_message.is_some());
    assert_eq!(fx.hub.network_calls(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_code_links_with_hub_device_name() {
    let fx = Fixture::with_grants();
    fx.hub.set_redeemed_device_name("Kitchen tablet");
    let bridge = fx.start(common::config()).await;

    let state = bridge.connection.reconnect_with_code("user-42/TKN9-QX7A").await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Connecting);

    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Kitchen tablet"));
    assert_eq!(state.session_id.as_deref(), Some("sess-user-42"));
    assert_eq!(fx.hub.redeem_calls(), 1);
    assert_eq!(fx.hub.token_calls(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_retryable_token_failure_is_retried() {
    let fx = Fixture::new();
    fx.hub.fail_next_token(BridgeError::Network("connection reset".into()));
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    assert_eq!(fx.hub.token_calls(), 2);
    assert_eq!(state.connection_code.as_deref(), Some("TKN0-0002"));
    assert_eq!(state.reconnect_attempts, 0);
    assert!(state.error_message.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_rejected_token_request_needs_user_action() {
    let fx = Fixture::new();
    fx.hub.fail_next_token(BridgeError::Server {
        status: 403,
        message: "device not allowed".into(),
    });
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Error)))
        .await
        .unwrap();
    assert!(state.error_message.unwrap().contains("device not allowed"));
    assert_eq!(state.reconnect_attempts, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.hub.token_calls(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_handoff_falls_back_to_second_url() {
    let fx = Fixture::new();
    fx.launcher.fail_primary("https://hub.wellbridge.app");
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();

    eventually(|| !fx.launcher.opened().is_empty()).await;
    let opened = fx.launcher.opened();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].as_str().starts_with("https://wellbridge.app/connect?"));
    assert!(bridge.connection.state().error_message.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_failed_browser_launch_still_accepts_manual_entry() {
    let fx = Fixture::with_grants();
    fx.launcher.fail_all();
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(|s| {
        s.status == ConnectionStatus::AwaitingWebValidation && s.error_message.is_some()
    }))
    .await
    .unwrap();
    assert!(state.error_message.unwrap().contains("enter the code manually"));
    assert!(fx.launcher.opened().is_empty());

    fx.realtime.validate("TKN00001", "Ada's Pixel").await;
    within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_stops_sync_and_forgets_device() {
    let fx = Fixture::with_grants();
    fx.hub.set_upload_delay(Duration::from_secs(30));
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    fx.realtime.validate("TKN00001", "Ada's Pixel").await;
    within(bridge.connection.wait_for(status_is(ConnectionStatus::Syncing)))
        .await
        .unwrap();
    common::wait_health(&bridge.health, |s| s.is_syncing(SyncPhase::BodyPrep)).await;

    let state = bridge.connection.disconnect().await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.device_name.is_none());
    assert!(state.last_sync.is_none());

    common::wait_health(&bridge.health, |s| s.running.is_empty()).await;
    assert_eq!(fx.hub.uploaded(), 0);
    assert!(fx.store.get(keys::CONNECTION_DEVICE_NAME).await.unwrap().is_none());
    assert!(fx.store.get(keys::CONNECTION_LAST_SYNC).await.unwrap().is_none());
    assert!(bridge.tokens.current_token().await.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_cancel_handoff_discards_token() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    assert!(bridge.tokens.current_token().await.is_some());

    let state = bridge.connection.cancel_handoff().await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.connection_code.is_none());
    assert!(bridge.tokens.current_token().await.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_linked_device_resumes_after_restart() {
    let fx = Fixture::new();
    fx.store
        .set(keys::CONNECTION_DEVICE_NAME, PrefValue::from("Ada's Pixel"))
        .await
        .unwrap();
    fx.store
        .set(keys::CONNECTION_LAST_SYNC, PrefValue::from(start_time().to_rfc3339()))
        .await
        .unwrap();

    let bridge = fx.start(common::config()).await;

    let state = bridge.connection.state();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));
    assert_eq!(state.last_sync, Some(start_time()));
    assert_eq!(fx.hub.network_calls(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_offline_connect_resumes_when_back_online() {
    let fx = Fixture::new();
    let bridge = fx.start(common::config()).await;

    fx.connectivity.set_online(false);
    within(bridge.connection.wait_for(|s| !s.is_online)).await.unwrap();

    let state = bridge.connection.connect().await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Error);
    assert!(state.error_message.unwrap().contains("offline"));
    assert_eq!(fx.hub.token_calls(), 0);

    fx.connectivity.set_online(true);
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::AwaitingWebValidation)))
        .await
        .unwrap();
    assert!(state.is_online);
    assert_eq!(fx.hub.token_calls(), 1);

    bridge.shutdown().await;
}

/// Gives up on the first `failures` subscriptions, then behaves like the
/// simulated channel.
struct DroppingRealtime {
    inner: Arc<SimulatedRealtime>,
    failures: usize,
    subscribes: AtomicUsize,
}

impl DroppingRealtime {
    fn new(inner: Arc<SimulatedRealtime>, failures: usize) -> Self {
        DroppingRealtime {
            inner,
            failures,
            subscribes: AtomicUsize::new(0),
        }
    }

    fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

impl RealtimeChannel for DroppingRealtime {
    fn subscribe(&self, token: &str, updates: mpsc::Sender<RealtimeUpdate>) -> RealtimeSubscription {
        let call = self.subscribes.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            let _ = updates.try_send(RealtimeUpdate::Status(RealtimeStatus::Retrying));
            let _ = updates.try_send(RealtimeUpdate::Status(RealtimeStatus::NetworkError));
            return RealtimeSubscription::detached();
        }
        self.inner.subscribe(token, updates)
    }
}

#[tokio::test]
async fn test_lost_realtime_channel_is_resubscribed() {
    let fx = Fixture::with_grants();
    let realtime = Arc::new(DroppingRealtime::new(fx.realtime.clone(), 1));
    let bridge = fx.start_with_realtime(common::config(), realtime.clone()).await;

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(|s| {
        s.status == ConnectionStatus::AwaitingWebValidation
            && s.realtime_status == RealtimeStatus::Subscribed
    }))
    .await
    .unwrap();
    assert!(state.is_awaiting_web_validation);
    assert_eq!(realtime.subscribes(), 2);
    eventually(|| fx.hub.validation_polls() >= 1).await;

    assert!(fx.realtime.validate("TKN00001", "Ada's Pixel").await >= 1);
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_polling_confirms_validation_when_realtime_is_down() {
    let fx = Fixture::with_grants();
    let realtime = Arc::new(DroppingRealtime::new(fx.realtime.clone(), usize::MAX));
    fx.hub.set_validation(
        "TKN00001",
        TokenValidation::Validated {
            device_name: Some("Ada's Pixel".to_string()),
            session_id: Some("sess-poll".to_string()),
        },
    );
    let bridge = fx.start_with_realtime(common::config(), realtime.clone()).await;

    bridge.connection.connect().await.unwrap();
    let state = within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();
    assert_eq!(state.device_name.as_deref(), Some("Ada's Pixel"));
    assert!(fx.hub.validation_polls() >= 1);
    assert!(fx.realtime.subscribed_tokens().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_realtime_recovers_after_connectivity_returns() {
    let fx = Fixture::with_grants();
    let bridge = fx.start(common::config()).await;

    bridge.connection.connect().await.unwrap();
    within(bridge.connection.wait_for(|s| s.realtime_status == RealtimeStatus::Subscribed))
        .await
        .unwrap();

    fx.connectivity.set_online(false);
    let state = within(bridge.connection.wait_for(|s| !s.is_online)).await.unwrap();
    assert_eq!(state.status, ConnectionStatus::AwaitingWebValidation);
    assert_eq!(state.realtime_status, RealtimeStatus::NetworkError);

    fx.connectivity.set_online(true);
    within(bridge.connection.wait_for(|s| {
        s.is_online && s.realtime_status == RealtimeStatus::Subscribed
    }))
    .await
    .unwrap();
    eventually(|| fx.hub.validation_polls() >= 1).await;

    assert!(fx.realtime.validate("TKN00001", "Ada's Pixel").await >= 1);
    within(bridge.connection.wait_for(status_is(ConnectionStatus::Connected)))
        .await
        .unwrap();

    bridge.shutdown().await;
}
