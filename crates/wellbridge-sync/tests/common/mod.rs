//! Shared fixture for the end-to-end tests: a bridge wired to simulated
//! collaborators and a hand-moved clock.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use wellbridge_core::HealthPermission;
use wellbridge_db::SyncRunRepository;
use wellbridge_sync::realtime::RealtimeChannel;
use wellbridge_sync::simulated::{
    ManualClock, MemoryStore, RecordingLauncher, SimulatedHealthPlatform, SimulatedHub,
    SimulatedRealtime,
};
use wellbridge_sync::{
    Bridge, BridgeBuilder, BridgeConfig, ConnectivityMonitor, HealthHandle, HealthState,
};

pub const DEVICE_ID: &str = "4f6c1d2e-8a37-4b1f-9e35-2c7d0a9b1e55";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
}

/// Small windows and fast retries so a full handoff finishes quickly.
pub fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.device.id = DEVICE_ID.to_string();
    config.device.name = "Pixel 8".to_string();
    config.connection.show_sync_intro = false;
    config.connection.initial_backoff_ms = 10;
    config.connection.max_backoff_secs = 1;
    config.sync.body_prep_window_days = 2;
    config.sync.digital_twin_days = 5;
    config.sync.batch_size = 4;
    config.permissions.settings_fallback_delay_ms = 50;
    config
}

pub struct Fixture {
    pub hub: Arc<SimulatedHub>,
    pub platform: Arc<SimulatedHealthPlatform>,
    pub store: Arc<MemoryStore>,
    pub realtime: Arc<SimulatedRealtime>,
    pub launcher: Arc<RecordingLauncher>,
    pub clock: Arc<ManualClock>,
    pub connectivity: ConnectivityMonitor,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            hub: Arc::new(SimulatedHub::new()),
            platform: Arc::new(SimulatedHealthPlatform::new()),
            store: Arc::new(MemoryStore::new()),
            realtime: Arc::new(SimulatedRealtime::new()),
            launcher: Arc::new(RecordingLauncher::new()),
            clock: Arc::new(ManualClock::new(start_time())),
            connectivity: ConnectivityMonitor::new(true),
        }
    }

    /// A fixture whose platform already granted the critical set.
    pub fn with_grants() -> Self {
        let fixture = Fixture::new();
        fixture.platform.set_granted([
            HealthPermission::Weight,
            HealthPermission::Height,
            HealthPermission::Steps,
            HealthPermission::SleepAsleep,
        ]);
        fixture
    }

    fn builder(&self, config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder::new(config)
            .with_hub(self.hub.clone())
            .with_auth(self.hub.clone())
            .with_platform(self.platform.clone())
            .with_store(self.store.clone())
            .with_realtime(self.realtime.clone())
            .with_launcher(self.launcher.clone())
            .with_clock(self.clock.clone())
            .with_connectivity(self.connectivity.clone())
    }

    pub async fn start(&self, config: BridgeConfig) -> Bridge {
        self.builder(config).start().await.unwrap()
    }

    /// Starts with a realtime channel other than the fixture's.
    pub async fn start_with_realtime(
        &self,
        config: BridgeConfig,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Bridge {
        self.builder(config).with_realtime(realtime).start().await.unwrap()
    }

    pub async fn start_with_history(&self, config: BridgeConfig, history: SyncRunRepository) -> Bridge {
        self.builder(config).with_history(history).start().await.unwrap()
    }
}

/// Fails the test instead of hanging when `future` never resolves.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out waiting for the bridge")
}

/// Polls `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Resolves with the first health state matching `predicate`.
pub async fn wait_health(health: &HealthHandle, predicate: impl Fn(&HealthState) -> bool) -> HealthState {
    let mut rx = health.subscribe();
    within(async move {
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("health bloc stopped");
        }
    })
    .await
}
