//! # Bridge
//!
//! Wires the blocs together and forwards their state to the host UI.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Bridge                                     │
//! │                                                                         │
//! │   BridgeBuilder ──start()──►  ConnectionBloc ──┐                        │
//! │     hub, auth, platform,      AuthBloc ────────┼──► HealthBloc          │
//! │     store, realtime,          HealthBloc       │     (permissions, sync)│
//! │     launcher, clock                            │                        │
//! │                                                ▼                        │
//! │   STATE EVENTS (to host):  BridgeEventEmitter                           │
//! │   ──────────────────────                                                │
//! │   emit_connection(&ConnectionState)                                     │
//! │   emit_health(&HealthState)                                             │
//! │   emit_auth(&AuthState)                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wellbridge_core::auth::AuthState;
use wellbridge_core::connection::ConnectionState;
use wellbridge_db::SyncRunRepository;

use crate::auth_bloc::{AuthBloc, AuthDeps, AuthHandle};
use crate::config::BridgeConfig;
use crate::connection_bloc::{ConnectionBloc, ConnectionBlocConfig, ConnectionDeps, ConnectionHandle};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{BridgeError, BridgeResult};
use crate::health_bloc::{HealthBloc, HealthHandle, HealthState};
use crate::health_sync::HealthSyncOrchestrator;
use crate::hub_client::HubClient;
use crate::permissions::HealthPermissionBridge;
use crate::ports::{
    AuthApi, Clock, DeviceIdentity, HubApi, KeyValueStore, NativeHealthPlatform, SystemClock,
    UrlLauncher,
};
use crate::profile_store::ProfileStore;
use crate::realtime::{RealtimeChannel, RealtimeConfig, WebSocketRealtime};
use crate::token_manager::TokenManager;

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives every published state (implemented by the host UI).
pub trait BridgeEventEmitter: Send + Sync {
    fn emit_connection(&self, state: &ConnectionState);

    fn emit_health(&self, state: &HealthState);

    fn emit_auth(&self, state: &AuthState);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl BridgeEventEmitter for NoOpEmitter {
    fn emit_connection(&self, _state: &ConnectionState) {}
    fn emit_health(&self, _state: &HealthState) {}
    fn emit_auth(&self, _state: &AuthState) {}
}

// =============================================================================
// Bridge
// =============================================================================

/// A running bridge.
pub struct Bridge {
    pub connection: ConnectionHandle,
    pub auth: AuthHandle,
    pub health: HealthHandle,
    pub tokens: Arc<TokenManager>,
    pub connectivity: ConnectivityMonitor,
    blocs: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Stops the blocs and waits for them to exit.
    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        if let Err(e) = self.connection.shutdown().await {
            warn!(error = %e, "Connection bloc shutdown");
        }
        if let Err(e) = self.auth.shutdown().await {
            warn!(error = %e, "Auth bloc shutdown");
        }
        if let Err(e) = self.health.shutdown().await {
            warn!(error = %e, "Health bloc shutdown");
        }
        for bloc in self.blocs {
            let _ = bloc.await;
        }
        info!("Bridge stopped");
    }
}

/// Pushes every change of `rx` into `emit`.
fn forward<T, F>(mut rx: watch::Receiver<T>, emit: F) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let value = rx.borrow_and_update().clone();
            emit(&value);
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`Bridge`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    hub: Option<Arc<dyn HubApi>>,
    auth: Option<Arc<dyn AuthApi>>,
    platform: Option<Arc<dyn NativeHealthPlatform>>,
    store: Option<Arc<dyn KeyValueStore>>,
    realtime: Option<Arc<dyn RealtimeChannel>>,
    launcher: Option<Arc<dyn UrlLauncher>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<ConnectivityMonitor>,
    history: Option<SyncRunRepository>,
    emitter: Option<Arc<dyn BridgeEventEmitter>>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        BridgeBuilder {
            config,
            hub: None,
            auth: None,
            platform: None,
            store: None,
            realtime: None,
            launcher: None,
            clock: None,
            connectivity: None,
            history: None,
            emitter: None,
        }
    }

    pub fn with_hub(mut self, hub: Arc<dyn HubApi>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthApi>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the native health SDK.
    pub fn with_platform(mut self, platform: Arc<dyn NativeHealthPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_realtime(mut self, realtime: Arc<dyn RealtimeChannel>) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn UrlLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Records finished sync phases.
    pub fn with_history(mut self, history: SyncRunRepository) -> Self {
        self.history = Some(history);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn BridgeEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Starts every bloc.
    ///
    /// Hub and realtime default to [`HubClient`] and [`WebSocketRealtime`]
    /// built from the configuration. Platform, storage and browser launcher
    /// must be supplied.
    pub async fn start(self) -> BridgeResult<Bridge> {
        let config = self.config;
        config.validate()?;

        let platform = self
            .platform
            .ok_or_else(|| BridgeError::InvalidConfig("Health platform required".into()))?;
        let store = self
            .store
            .ok_or_else(|| BridgeError::InvalidConfig("Storage required".into()))?;
        let launcher = self
            .launcher
            .ok_or_else(|| BridgeError::InvalidConfig("URL launcher required".into()))?;

        let (hub, auth) = match (self.hub, self.auth) {
            (Some(hub), Some(auth)) => (hub, auth),
            (hub, auth) => {
                let client = Arc::new(HubClient::new(
                    &config.hub.api_url,
                    config.hub.request_timeout(),
                )?);
                let default_hub: Arc<dyn HubApi> = client.clone();
                let default_auth: Arc<dyn AuthApi> = client;
                (hub.unwrap_or(default_hub), auth.unwrap_or(default_auth))
            }
        };

        let realtime = self.realtime.unwrap_or_else(|| {
            Arc::new(WebSocketRealtime::new(RealtimeConfig {
                url: config.hub.realtime_url.clone(),
                device_id: config.device_id().to_string(),
                initial_backoff: config.connection.initial_backoff(),
                max_backoff: config.connection.max_backoff(),
                max_retries: config.connection.max_reconnect_attempts,
                ..RealtimeConfig::default()
            }))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let connectivity = self.connectivity.unwrap_or_default();
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let device = DeviceIdentity {
            device_id: config.device.id.clone(),
            device_name: config.device.name.clone(),
            platform: config.device.platform,
        };
        info!(
            device_id = %device.device_id,
            platform = %device.platform,
            "Starting bridge"
        );

        // Health
        let permissions = Arc::new(HealthPermissionBridge::new(
            Arc::clone(&platform),
            config.capabilities(),
            config.permissions.settings_fallback_delay(),
        ));
        let mut orchestrator = HealthSyncOrchestrator::new(
            Arc::clone(&hub),
            Arc::clone(&permissions),
            platform,
            config.sync.clone(),
            Arc::clone(&clock),
        );
        if let Some(history) = self.history {
            orchestrator = orchestrator.with_history(history);
        }
        let (health, health_task) = HealthBloc::spawn(permissions, Arc::new(orchestrator));

        // Connection
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&hub),
            Arc::clone(&store),
            Arc::clone(&clock),
            device,
            config.connection.token_ttl(),
            config.connection.token_group_size,
        ));
        let (connection, connection_task) = ConnectionBloc::spawn(
            ConnectionBlocConfig {
                policy: config.connection.policy(),
                handoff_url: config.hub.handoff_url.clone(),
                handoff_fallback_url: config.hub.handoff_fallback_url.clone(),
                validation_timeout: config.connection.validation_timeout(),
            },
            ConnectionDeps {
                tokens: Arc::clone(&tokens),
                hub,
                realtime,
                launcher,
                store: Arc::clone(&store),
                health: health.clone(),
                connectivity: connectivity.clone(),
                clock,
            },
        )
        .await;

        // Auth
        let (auth, auth_task) = AuthBloc::spawn(
            config.auth_policy(),
            AuthDeps {
                auth,
                profiles: ProfileStore::new(store),
                health: health.clone(),
            },
        );

        let forwarders = vec![
            {
                let emitter = Arc::clone(&emitter);
                forward(connection.subscribe(), move |s| emitter.emit_connection(s))
            },
            {
                let emitter = Arc::clone(&emitter);
                forward(health.subscribe(), move |s| emitter.emit_health(s))
            },
            forward(auth.subscribe(), move |s| emitter.emit_auth(s)),
        ];

        Ok(Bridge {
            connection,
            auth,
            health,
            tokens,
            connectivity,
            blocs: vec![connection_task, auth_task, health_task],
            forwarders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{MemoryStore, RecordingLauncher, SimulatedHealthPlatform};

    #[tokio::test]
    async fn test_builder_requires_platform() {
        let result = BridgeBuilder::new(BridgeConfig::default())
            .with_store(Arc::new(MemoryStore::new()))
            .with_launcher(Arc::new(RecordingLauncher::new()))
            .start()
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));

        let result = BridgeBuilder::new(BridgeConfig::default())
            .with_platform(Arc::new(SimulatedHealthPlatform::new()))
            .with_launcher(Arc::new(RecordingLauncher::new()))
            .start()
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));
    }
}
