//! Subcommand implementations.
//!
//! Every command opens the local database, starts a bridge on top of it and
//! shuts the bridge down before returning. The health platform is always the
//! simulated one; `--simulate` also replaces the hub and the realtime channel
//! and validates handoff tokens on the web side's behalf.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use wellbridge_core::auth::ONBOARDING_PERMISSIONS;
use wellbridge_core::connection::{ConnectionState, ConnectionStatus};
use wellbridge_core::SyncPhase;
use wellbridge_db::{Database, DbConfig};
use wellbridge_sync::simulated::{SimulatedHealthPlatform, SimulatedHub, SimulatedRealtime};
use wellbridge_sync::{
    Bridge, BridgeBuilder, BridgeConfig, BridgeError, BridgeResult, ConnectivityMonitor,
    HealthHandle,
};

use crate::console::{label, print_summary, LogEmitter, PrintLauncher};

const PROGRESS_TICK: Duration = Duration::from_millis(250);
const CONNECTIVITY_PROBE: Duration = Duration::from_secs(15);

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub simulate: bool,
}

/// A started bridge plus what the commands need next to it.
struct Session {
    bridge: Bridge,
    db: Database,
    config: BridgeConfig,
    realtime: Option<Arc<SimulatedRealtime>>,
    probe: Option<JoinHandle<()>>,
}

impl Session {
    async fn close(self) {
        if let Some(probe) = &self.probe {
            probe.abort();
        }
        self.bridge.shutdown().await;
        self.db.close().await;
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Loads the configuration, writing it on first use so the device id is
/// stable across runs.
fn load_config(ctx: &Context) -> BridgeResult<BridgeConfig> {
    let path = ctx.config_path.clone().or_else(BridgeConfig::default_config_path);
    let config = BridgeConfig::load(path.clone())?;

    if let Some(path) = path.filter(|p| !p.exists()) {
        config.save(Some(path))?;
        info!(device_id = %config.device_id(), "Created config with a new device id");
    }
    Ok(config)
}

async fn open(ctx: &Context) -> BridgeResult<Session> {
    let config = load_config(ctx)?;

    let db_path = ctx
        .db_path
        .clone()
        .or_else(BridgeConfig::default_database_path)
        .ok_or_else(|| BridgeError::InvalidConfig("No database path available".into()))?;
    let db = Database::new(DbConfig::new(db_path)).await?;

    let mut builder = BridgeBuilder::new(config.clone())
        .with_platform(Arc::new(SimulatedHealthPlatform::new()))
        .with_store(Arc::new(db.preferences()))
        .with_history(db.sync_runs())
        .with_launcher(Arc::new(PrintLauncher))
        .with_emitter(Arc::new(LogEmitter));

    let mut realtime = None;
    let mut probe = None;
    if ctx.simulate {
        info!("Using the simulated hub");
        let hub = Arc::new(SimulatedHub::new());
        let channel = Arc::new(SimulatedRealtime::new());
        builder = builder
            .with_hub(hub.clone())
            .with_auth(hub)
            .with_realtime(channel.clone());
        realtime = Some(channel);
    } else {
        let connectivity = ConnectivityMonitor::new(true);
        probe = Some(connectivity.spawn_probe(Url::parse(&config.hub.api_url)?, CONNECTIVITY_PROBE));
        builder = builder.with_connectivity(connectivity);
    }

    let bridge = builder.start().await?;
    Ok(Session {
        bridge,
        db,
        config,
        realtime,
        probe,
    })
}

// =============================================================================
// connect
// =============================================================================

/// True once the handoff needs nothing more from this process.
///
/// `Error` with a non-zero attempt count means a retry is scheduled.
pub fn settled(state: &ConnectionState) -> bool {
    match state.status {
        ConnectionStatus::Connected
        | ConnectionStatus::NetworkError
        | ConnectionStatus::Disconnected => true,
        ConnectionStatus::Error => state.reconnect_attempts == 0,
        _ => false,
    }
}

/// What Ctrl-C does to a running `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Abandon the handoff and its token.
    CancelHandoff,
    /// Stop printing progress but let the sync finish.
    FollowQuietly,
    Exit,
}

impl InterruptAction {
    /// Only the handoff is cancelled; a started sync is never stopped here.
    pub fn for_state(state: &ConnectionState) -> Self {
        match state.status {
            status if status.is_pre_connected() => InterruptAction::CancelHandoff,
            ConnectionStatus::Syncing | ConnectionStatus::Connected => InterruptAction::FollowQuietly,
            _ => InterruptAction::Exit,
        }
    }
}

pub async fn connect(ctx: &Context, code: Option<String>, detach: bool) -> BridgeResult<()> {
    let session = open(ctx).await?;
    let started = Utc::now();
    let result = tokio::select! {
        result = run_connect(&session, code, detach, started) => result,
        _ = tokio::signal::ctrl_c() => interrupt(&session, started).await,
    };
    session.close().await;
    result
}

async fn run_connect(
    session: &Session,
    code: Option<String>,
    detach: bool,
    started: chrono::DateTime<Utc>,
) -> BridgeResult<()> {
    let bridge = &session.bridge;

    if bridge.connection.state().status.is_linked() {
        println!("Already linked. Run `wellbridge disconnect` first to link again.");
        return Ok(());
    }

    let identifiers: Vec<String> = ONBOARDING_PERMISSIONS.iter().map(|s| s.to_string()).collect();
    match bridge.health.request_permissions(identifiers).await {
        Ok(authorization) => println!("Health permissions: {}", label(&authorization.status)),
        Err(e) => warn!(error = %e, "Permission request failed, sync may be limited"),
    }

    let state = match code {
        Some(code) => bridge.connection.reconnect_with_code(&code).await?,
        None => bridge.connection.connect().await?,
    };
    if state.status == ConnectionStatus::Error {
        return Err(BridgeError::Internal(
            state.error_message.unwrap_or_else(|| "Connect was refused".into()),
        ));
    }

    let state = follow_handoff(session).await?;
    match state.status {
        ConnectionStatus::Connected => {
            println!(
                "Linked as {}.",
                state.device_name.as_deref().unwrap_or("this device")
            );
        }
        _ => {
            let message = state
                .error_message
                .unwrap_or_else(|| format!("Handoff ended in {}", label(&state.status)));
            return Err(BridgeError::Internal(message));
        }
    }

    if let Some(summary) = bridge.health.state().last_body_prep.filter(|s| s.completed_at >= started) {
        print_summary(&summary);
    }
    if state.sync_degraded {
        println!(
            "Body Prep did not upload everything: {}",
            state.sync_error.as_deref().unwrap_or("some batches were rejected")
        );
    }

    if detach {
        println!("Digital Twin continues without progress output. This process exits when it finishes.");
    }
    follow_digital_twin(&bridge.health, started, detach).await
}

/// Waits for the handoff to settle, validating tokens when simulating and
/// acknowledging the sync intro.
async fn follow_handoff(session: &Session) -> BridgeResult<ConnectionState> {
    let connection = &session.bridge.connection;
    let mut rx = connection.subscribe();
    let mut validated: Option<String> = None;
    let mut last_status = None;

    loop {
        let state = rx.borrow_and_update().clone();

        if last_status != Some(state.status) {
            last_status = Some(state.status);
            match (&state.status, &state.error_message) {
                (ConnectionStatus::Error, Some(message)) => println!("{}", message),
                (ConnectionStatus::AwaitingWebValidation, _) => {
                    if let Some(code) = &state.connection_code {
                        println!("Or enter this code on the hub: {}", code);
                    }
                }
                _ => info!(status = %state.status, "Handoff"),
            }
        }

        if settled(&state) {
            return Ok(state);
        }

        match state.status {
            ConnectionStatus::AwaitingWebValidation => {
                if let Some(realtime) = &session.realtime {
                    if let Some(token) = session.bridge.tokens.current_token().await {
                        if validated.as_deref() != Some(token.raw()) {
                            let delivered = realtime
                                .validate(token.raw(), &session.config.device.name)
                                .await;
                            info!(delivered, token_prefix = %token.log_prefix(), "Simulated web validation");
                            validated = Some(token.raw().to_string());
                        }
                    }
                }
            }
            ConnectionStatus::SyncIntro => {
                println!("Your health data will now sync with the Wellness Hub.");
                connection.acknowledge_sync_intro().await?;
            }
            _ => {}
        }

        rx.changed().await.map_err(|_| BridgeError::ShuttingDown)?;
    }
}

/// Waits for the Digital Twin run that began after `started` to finish or
/// fail, printing progress unless `quiet`.
async fn follow_digital_twin(
    health: &HealthHandle,
    started: chrono::DateTime<Utc>,
    quiet: bool,
) -> BridgeResult<()> {
    let mut states = health.subscribe();
    let mut progress = None;
    let mut reported_decile = None;

    loop {
        {
            let state = states.borrow_and_update();
            if let Some(summary) = state.last_digital_twin.as_ref().filter(|s| s.completed_at >= started) {
                print_summary(summary);
                return Ok(());
            }
            if !state.is_syncing(SyncPhase::DigitalTwin) && progress.is_some() {
                if let Some(message) = &state.error_message {
                    println!("Digital Twin stopped: {}", message);
                    return Ok(());
                }
            }
        }

        if progress.is_none() {
            progress = health.watch_progress(SyncPhase::DigitalTwin).await?;
        }
        if let Some(rx) = &progress {
            let snapshot = rx.borrow().clone();
            let decile = (snapshot.percentage * 10.0).floor() as u32;
            if !quiet && reported_decile != Some(decile) {
                reported_decile = Some(decile);
                println!(
                    "Digital Twin {:>3.0}%  {}",
                    snapshot.percentage * 100.0,
                    snapshot.current_activity
                );
            }
        }

        tokio::select! {
            changed = states.changed() => changed.map_err(|_| BridgeError::ShuttingDown)?,
            _ = tokio::time::sleep(PROGRESS_TICK) => {}
        }
    }
}

/// Backs out of the handoff, or stops following a sync without cancelling it.
async fn interrupt(session: &Session, started: chrono::DateTime<Utc>) -> BridgeResult<()> {
    let bridge = &session.bridge;
    match InterruptAction::for_state(&bridge.connection.state()) {
        InterruptAction::CancelHandoff => {
            println!("Interrupted.");
            bridge.connection.cancel_handoff().await?;
            Ok(())
        }
        InterruptAction::FollowQuietly => {
            println!("Stopped following progress. The sync keeps running; press Ctrl-C again to exit now.");
            tokio::select! {
                result = follow_digital_twin(&bridge.health, started, true) => result,
                _ = tokio::signal::ctrl_c() => {
                    println!("Exiting before the sync finished. Run `wellbridge connect` again later.");
                    Ok(())
                }
            }
        }
        InterruptAction::Exit => {
            println!("Interrupted.");
            Ok(())
        }
    }
}

// =============================================================================
// status / token / disconnect
// =============================================================================

pub async fn status(ctx: &Context, json: bool) -> BridgeResult<()> {
    let session = open(ctx).await?;
    let state = session.bridge.connection.state();
    let body_prep = session.db.sync_runs().latest(SyncPhase::BodyPrep).await?;
    let digital_twin = session.db.sync_runs().latest(SyncPhase::DigitalTwin).await?;

    if json {
        let report = serde_json::json!({
            "deviceId": session.config.device_id(),
            "connection": state,
            "lastBodyPrep": body_prep.as_ref().map(|r| &r.summary),
            "lastDigitalTwin": digital_twin.as_ref().map(|r| &r.summary),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Device:    {} ({})", session.config.device.name, session.config.device_id());
        println!("Status:    {}", label(&state.status));
        if let Some(name) = &state.device_name {
            println!("Linked as: {}", name);
        }
        if let Some(last_sync) = state.last_sync {
            println!("Last sync: {}", last_sync.format("%Y-%m-%d %H:%M UTC"));
        }
        if let Some(message) = &state.error_message {
            println!("Error:     {}", message);
        }
        for record in body_prep.iter().chain(digital_twin.iter()) {
            print_summary(&record.summary);
        }
    }

    session.close().await;
    Ok(())
}

pub async fn token(ctx: &Context) -> BridgeResult<()> {
    let session = open(ctx).await?;
    let tokens = &session.bridge.tokens;

    match (tokens.formatted_token().await, tokens.remaining().await) {
        (Some(code), Some(remaining)) => {
            println!("Connection code: {}", code);
            println!("Expires in {} min", remaining.num_minutes().max(0));
        }
        _ => println!("No active connection code. Run `wellbridge connect` to get one."),
    }

    session.close().await;
    Ok(())
}

pub async fn disconnect(ctx: &Context) -> BridgeResult<()> {
    let session = open(ctx).await?;
    let state = session.bridge.connection.disconnect().await?;
    println!("Status: {}", label(&state.status));
    session.close().await;
    Ok(())
}

// =============================================================================
// permissions
// =============================================================================

pub async fn permissions(ctx: &Context, types: Vec<String>, check_only: bool) -> BridgeResult<()> {
    let session = open(ctx).await?;
    let health = &session.bridge.health;

    let result = if check_only {
        health.check_identifiers(&types).await.map(|granted| {
            for (permission, is_granted) in granted {
                let answer = if is_granted { "granted" } else { "not granted" };
                println!("{:<28} {}", permission.identifier(), answer);
            }
        })
    } else {
        health.request_permissions(types).await.map(|authorization| {
            println!("Status: {}", label(&authorization.status));
            for permission in &authorization.granted {
                println!("  granted {}", permission);
            }
        })
    };

    session.close().await;
    result
}

// =============================================================================
// config
// =============================================================================

pub fn config_init(ctx: &Context, force: bool) -> BridgeResult<()> {
    let path = ctx
        .config_path
        .clone()
        .or_else(BridgeConfig::default_config_path)
        .ok_or_else(|| BridgeError::ConfigSaveFailed("No config path available".into()))?;

    if path.exists() && !force {
        return Err(BridgeError::ConfigSaveFailed(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let config = BridgeConfig::new();
    let path = config.save(Some(path))?;
    println!("Wrote {} (device id {})", path.display(), config.device_id());
    Ok(())
}

pub fn config_show(ctx: &Context) -> BridgeResult<()> {
    let path = ctx.config_path.clone().or_else(BridgeConfig::default_config_path);
    let config = BridgeConfig::load(path)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: ConnectionStatus, reconnect_attempts: u32) -> ConnectionState {
        ConnectionState {
            status,
            reconnect_attempts,
            ..ConnectionState::disconnected()
        }
    }

    #[test]
    fn test_settled_waits_out_scheduled_retries() {
        assert!(!settled(&state(ConnectionStatus::Error, 2)));
        assert!(settled(&state(ConnectionStatus::Error, 0)));
        assert!(settled(&state(ConnectionStatus::NetworkError, 5)));
        assert!(settled(&state(ConnectionStatus::Connected, 0)));
    }

    #[test]
    fn test_interrupt_never_cancels_a_started_sync() {
        assert_eq!(
            InterruptAction::for_state(&state(ConnectionStatus::AwaitingWebValidation, 0)),
            InterruptAction::CancelHandoff
        );
        assert_eq!(
            InterruptAction::for_state(&state(ConnectionStatus::Connecting, 1)),
            InterruptAction::CancelHandoff
        );
        assert_eq!(
            InterruptAction::for_state(&state(ConnectionStatus::Syncing, 0)),
            InterruptAction::FollowQuietly
        );
        assert_eq!(
            InterruptAction::for_state(&state(ConnectionStatus::Connected, 0)),
            InterruptAction::FollowQuietly
        );
        assert_eq!(
            InterruptAction::for_state(&state(ConnectionStatus::NetworkError, 5)),
            InterruptAction::Exit
        );
    }

    #[test]
    fn test_settled_keeps_waiting_mid_handoff() {
        for status in [
            ConnectionStatus::Connecting,
            ConnectionStatus::AwaitingWebValidation,
            ConnectionStatus::SyncIntro,
            ConnectionStatus::Syncing,
        ] {
            assert!(!settled(&state(status, 0)), "{status:?}");
        }
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config_path: Some(dir.path().join("bridge.toml")),
            ..Context::default()
        };

        config_init(&ctx, false).unwrap();
        let first = BridgeConfig::load(ctx.config_path.clone()).unwrap();

        assert!(matches!(config_init(&ctx, false), Err(BridgeError::ConfigSaveFailed(_))));
        assert_eq!(BridgeConfig::load(ctx.config_path.clone()).unwrap(), first);

        config_init(&ctx, true).unwrap();
        let replaced = BridgeConfig::load(ctx.config_path.clone()).unwrap();
        assert_ne!(replaced.device.id, first.device.id);
    }

    #[test]
    fn test_first_load_persists_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config_path: Some(dir.path().join("nested").join("bridge.toml")),
            ..Context::default()
        };

        let first = load_config(&ctx).unwrap();
        let second = load_config(&ctx).unwrap();
        assert_eq!(first.device.id, second.device.id);
    }
}
