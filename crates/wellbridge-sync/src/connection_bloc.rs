//! # Connection Bloc
//!
//! Runtime around the pure [`ConnectionMachine`]: feeds it events one at a
//! time and executes the effects it returns.
//!
//! ## Effect Execution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ConnectionBloc loop                             │
//! │                                                                         │
//! │  inbox ──► machine.handle(event, now) ──► effects ──► execute ──► publish│
//! │    ▲                                         │                          │
//! │    │   ┌─────────────────────────────────────┘                          │
//! │    │   │ GenerateToken        → task: TokenManager::generate            │
//! │    │   │ RedeemReconnectCode  → task: HubApi::redeem_code               │
//! │    │   │ LaunchWebHandoff     → task: open primary, then fallback URL   │
//! │    │   │ SubscribeRealtime    → RealtimeChannel + forwarder task        │
//! │    │   │ PollValidation       → task: HubApi::validation_status         │
//! │    │   │ Schedule/Cancel*     → timer tasks (aborted on cancel)         │
//! │    │   │ Persist/Clear*       → inline storage writes                   │
//! │    │   │ Start*Sync           → task: HealthHandle::start_sync + progress│
//! │    │   └──────────────────────────────┐                                 │
//! │    └──── results, timer fires, realtime updates, connectivity ◄─┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State is published after the effects of a transition have run, so an
//! observer that sees `AwaitingWebValidation` can rely on the realtime
//! subscription being in place. Token and redeem results carry a sequence
//! number; results from superseded requests are discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use wellbridge_core::connection::{
    ConnectionEffect, ConnectionEvent, ConnectionMachine, ConnectionPolicy, ConnectionState,
};
use wellbridge_core::token::ReconnectCode;
use wellbridge_core::{ConnectionToken, SyncPhase};
use wellbridge_db::{keys, PrefValue};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{BridgeError, BridgeResult};
use crate::health_bloc::HealthHandle;
use crate::health_sync::PhaseOutcome;
use crate::ports::{Clock, HubApi, KeyValueStore, RedeemedCode, UrlLauncher};
use crate::realtime::{RealtimeChannel, RealtimeSubscription, RealtimeUpdate};
use crate::token_manager::TokenManager;

// =============================================================================
// Configuration
// =============================================================================

/// Handoff settings for the bloc.
#[derive(Debug, Clone)]
pub struct ConnectionBlocConfig {
    pub policy: ConnectionPolicy,
    pub handoff_url: String,
    pub handoff_fallback_url: String,
    pub validation_timeout: Duration,
}

/// Collaborators the bloc drives.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub tokens: Arc<TokenManager>,
    pub hub: Arc<dyn HubApi>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub launcher: Arc<dyn UrlLauncher>,
    pub store: Arc<dyn KeyValueStore>,
    pub health: HealthHandle,
    pub connectivity: ConnectivityMonitor,
    pub clock: Arc<dyn Clock>,
}

/// Builds the browser URL for a token.
///
/// ## Example
/// ```rust
/// use wellbridge_sync::connection_bloc::handoff_url;
///
/// let url = handoff_url("https://hub.example.com/connect", "AB3D9KQ2", "dev-1").unwrap();
/// assert_eq!(url.as_str(), "https://hub.example.com/connect?token=AB3D9KQ2&device=dev-1");
/// ```
pub fn handoff_url(base: &str, token: &str, device_id: &str) -> BridgeResult<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("device", device_id);
    Ok(url)
}

// =============================================================================
// Inbox
// =============================================================================

enum Inbox {
    Event {
        event: ConnectionEvent,
        reply: Option<oneshot::Sender<ConnectionState>>,
    },
    TokenResult {
        seq: u64,
        result: BridgeResult<ConnectionToken>,
    },
    RedeemResult {
        seq: u64,
        result: BridgeResult<RedeemedCode>,
    },
    Realtime {
        subscription: u64,
        update: RealtimeUpdate,
    },
    Shutdown,
}

/// Sends into the inbox if the bloc is still alive.
async fn post(inbox: &mpsc::WeakSender<Inbox>, message: Inbox) {
    if let Some(inbox) = inbox.upgrade() {
        let _ = inbox.send(message).await;
    }
}

async fn post_event(inbox: &mpsc::WeakSender<Inbox>, event: ConnectionEvent) {
    post(inbox, Inbox::Event { event, reply: None }).await
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the connection bloc.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Inbox>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Sends an event; resolves with the state once its effects have run.
    pub async fn dispatch(&self, event: ConnectionEvent) -> BridgeResult<ConnectionState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbox::Event {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;
        rx.await.map_err(|_| BridgeError::ShuttingDown)
    }

    /// Generates a token and starts the web handoff.
    pub async fn connect(&self) -> BridgeResult<ConnectionState> {
        self.dispatch(ConnectionEvent::ConnectRequested).await
    }

    /// Links with a manually entered `userId/token` code.
    pub async fn reconnect_with_code(&self, code: &str) -> BridgeResult<ConnectionState> {
        self.dispatch(ConnectionEvent::ReconnectWithCode {
            code: code.to_string(),
        })
        .await
    }

    pub async fn cancel_handoff(&self) -> BridgeResult<ConnectionState> {
        self.dispatch(ConnectionEvent::CancelHandoff).await
    }

    pub async fn acknowledge_sync_intro(&self) -> BridgeResult<ConnectionState> {
        self.dispatch(ConnectionEvent::SyncIntroAcknowledged).await
    }

    /// Unlinks the device and stops any sync.
    pub async fn disconnect(&self) -> BridgeResult<ConnectionState> {
        self.dispatch(ConnectionEvent::DisconnectRequested).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves with the first published state matching `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> BridgeResult<ConnectionState> {
        let mut rx = self.state.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return Ok(state.clone());
                }
            }
            rx.changed().await.map_err(|_| BridgeError::ShuttingDown)?;
        }
    }

    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.tx
            .send(Inbox::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelError("connection bloc already stopped".into()))
    }
}

// =============================================================================
// Bloc
// =============================================================================

struct LiveSubscription {
    id: u64,
    _subscription: RealtimeSubscription,
    forwarder: JoinHandle<()>,
}

/// Owns the handoff state machine.
pub struct ConnectionBloc {
    config: ConnectionBlocConfig,
    deps: ConnectionDeps,
    machine: ConnectionMachine,
    rx: mpsc::Receiver<Inbox>,
    inbox: mpsc::WeakSender<Inbox>,
    state_tx: watch::Sender<ConnectionState>,

    token_seq: u64,
    subscription_seq: u64,
    subscription: Option<LiveSubscription>,
    retry_timer: Option<JoinHandle<()>>,
    validation_timer: Option<JoinHandle<()>>,
    realtime_retry_timer: Option<JoinHandle<()>>,
    handoff: Option<JoinHandle<()>>,
    sync_forwarders: HashMap<SyncPhase, JoinHandle<()>>,
    connectivity_forwarder: Option<JoinHandle<()>>,
}

impl ConnectionBloc {
    pub fn new(config: ConnectionBlocConfig, deps: ConnectionDeps) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::channel(64);
        let machine = ConnectionMachine::new(config.policy.clone());
        let (state_tx, state_rx) = watch::channel(machine.state().clone());

        let bloc = ConnectionBloc {
            config,
            deps,
            machine,
            rx,
            inbox: tx.downgrade(),
            state_tx,
            token_seq: 0,
            subscription_seq: 0,
            subscription: None,
            retry_timer: None,
            validation_timer: None,
            realtime_retry_timer: None,
            handoff: None,
            sync_forwarders: HashMap::new(),
            connectivity_forwarder: None,
        };
        (bloc, ConnectionHandle { tx, state: state_rx })
    }

    /// Restores persisted state, then runs the bloc on the current runtime.
    pub async fn spawn(
        config: ConnectionBlocConfig,
        deps: ConnectionDeps,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (mut bloc, handle) = ConnectionBloc::new(config, deps);
        bloc.restore().await;
        (handle, tokio::spawn(bloc.run()))
    }

    /// Loads the persisted token and linked device.
    pub async fn restore(&mut self) {
        if let Err(e) = self.deps.tokens.restore().await {
            warn!(error = %e, "Failed to restore connection token");
        }

        let device_name = match self.deps.store.get_string(keys::CONNECTION_DEVICE_NAME).await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Failed to read linked device");
                None
            }
        };
        if let Some(device_name) = device_name {
            let last_sync = self
                .deps
                .store
                .get_string(keys::CONNECTION_LAST_SYNC)
                .await
                .ok()
                .flatten()
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            info!(device_name = %device_name, "Resuming linked device");
            self.machine = ConnectionMachine::resume(self.config.policy.clone(), device_name, last_sync);
            self.state_tx.send_replace(self.machine.state().clone());
        }
    }

    pub async fn run(mut self) {
        info!("Connection bloc starting");
        self.watch_connectivity();

        while let Some(message) = self.rx.recv().await {
            match message {
                Inbox::Event { event, reply } => {
                    let state = self.handle_event(event).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(state);
                    }
                }
                Inbox::TokenResult { seq, result } => self.on_token_result(seq, result).await,
                Inbox::RedeemResult { seq, result } => {
                    if seq != self.token_seq {
                        debug!(seq, current = self.token_seq, "Discarding stale redeem result");
                        continue;
                    }
                    let event = match result {
                        Ok(redeemed) => ConnectionEvent::CodeRedeemed {
                            device_name: redeemed.device_name,
                            session_id: redeemed.session_id,
                        },
                        Err(e) => ConnectionEvent::RequestFailed {
                            message: e.to_string(),
                            retryable: e.is_retryable(),
                        },
                    };
                    self.handle_event(event).await;
                }
                Inbox::Realtime {
                    subscription,
                    update,
                } => {
                    let current = self.subscription.as_ref().map(|s| s.id);
                    if current != Some(subscription) {
                        debug!(subscription, "Ignoring update from a closed subscription");
                        continue;
                    }
                    let event = match update {
                        RealtimeUpdate::Status(status) => {
                            ConnectionEvent::RealtimeStatusChanged(status)
                        }
                        RealtimeUpdate::Validation(signal) => {
                            ConnectionEvent::ValidationReceived(signal)
                        }
                    };
                    self.handle_event(event).await;
                }
                Inbox::Shutdown => break,
            }
        }

        self.teardown();
        info!("Connection bloc stopped");
    }

    async fn handle_event(&mut self, event: ConnectionEvent) -> ConnectionState {
        let before = self.machine.state().status;
        let transition = self.machine.handle(event, self.deps.clock.now());

        if let Some(rejection) = &transition.rejection {
            warn!(error = %rejection, status = %transition.state.status, "Connection input rejected");
        }
        if transition.state.status != before {
            info!(from = %before, to = %transition.state.status, "Connection status changed");
        }

        for effect in transition.effects {
            self.execute(effect).await;
        }

        let state = transition.state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        state
    }

    async fn on_token_result(&mut self, seq: u64, result: BridgeResult<ConnectionToken>) {
        if seq != self.token_seq {
            if let Ok(token) = result {
                debug!(token_prefix = %token.log_prefix(), "Discarding superseded token");
                if let Err(e) = self.deps.tokens.discard(&token).await {
                    warn!(error = %e, "Failed to discard superseded token");
                }
            }
            return;
        }
        let event = match result {
            Ok(token) => ConnectionEvent::TokenIssued { token },
            Err(e) => {
                warn!(error = %e, "Token request failed");
                ConnectionEvent::RequestFailed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };
        self.handle_event(event).await;
    }

    // -------------------------------------------------------------------------
    // Effects
    // -------------------------------------------------------------------------

    async fn execute(&mut self, effect: ConnectionEffect) {
        debug!(?effect, "Executing connection effect");
        match effect {
            ConnectionEffect::GenerateToken => {
                self.token_seq += 1;
                let seq = self.token_seq;
                let tokens = Arc::clone(&self.deps.tokens);
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let result = tokens.generate().await;
                    post(&inbox, Inbox::TokenResult { seq, result }).await;
                });
            }
            ConnectionEffect::RedeemReconnectCode(code) => {
                self.token_seq += 1;
                self.spawn_redeem(self.token_seq, code);
            }
            ConnectionEffect::LaunchWebHandoff { token } => self.spawn_handoff(token),
            ConnectionEffect::SubscribeRealtime { token } => self.subscribe_realtime(&token),
            ConnectionEffect::UnsubscribeRealtime => {
                if let Some(live) = self.subscription.take() {
                    live.forwarder.abort();
                    debug!(subscription = live.id, "Realtime subscription closed");
                }
            }
            ConnectionEffect::PollValidation { token } => self.spawn_poll(token),
            ConnectionEffect::ScheduleRealtimeRetry { after } => {
                debug!(?after, "Realtime channel lost, resubscribing after backoff");
                let task = self.timer(after, ConnectionEvent::RealtimeRetryFired);
                replace_task(&mut self.realtime_retry_timer, task);
            }
            ConnectionEffect::StartValidationTimeout => {
                let task = self.timer(
                    self.config.validation_timeout,
                    ConnectionEvent::ValidationTimedOut,
                );
                replace_task(&mut self.validation_timer, task);
            }
            ConnectionEffect::CancelValidationTimeout => abort_task(&mut self.validation_timer),
            ConnectionEffect::ScheduleRetry { attempt, after } => {
                info!(attempt, ?after, "Scheduling connection retry");
                let task = self.timer(after, ConnectionEvent::RetryTimerFired);
                replace_task(&mut self.retry_timer, task);
            }
            ConnectionEffect::CancelRetry => abort_task(&mut self.retry_timer),
            ConnectionEffect::PersistConnection {
                device_name,
                last_sync,
            } => {
                if let Err(e) = self.persist_connection(&device_name, last_sync).await {
                    warn!(error = %e, "Failed to persist linked device");
                }
            }
            ConnectionEffect::ClearToken => {
                self.token_seq += 1;
                abort_task(&mut self.handoff);
                if let Err(e) = self.deps.tokens.clear().await {
                    warn!(error = %e, "Failed to clear connection token");
                }
            }
            ConnectionEffect::ClearPersistedConnection => {
                if let Err(e) = self.deps.store.remove_all(&keys::DEVICE_KEYS).await {
                    warn!(error = %e, "Failed to clear linked device");
                }
            }
            ConnectionEffect::StartBodyPrepSync => self.spawn_sync(SyncPhase::BodyPrep),
            ConnectionEffect::StartDigitalTwinSync => self.spawn_sync(SyncPhase::DigitalTwin),
            ConnectionEffect::CancelSync => {
                for (_, forwarder) in self.sync_forwarders.drain() {
                    forwarder.abort();
                }
                if let Err(e) = self.deps.health.cancel_sync().await {
                    warn!(error = %e, "Failed to cancel sync");
                }
            }
        }
    }

    fn timer(&self, after: Duration, event: ConnectionEvent) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            post_event(&inbox, event).await;
        })
    }

    /// Asks the hub about `token`; an answer enters as a validation signal.
    fn spawn_poll(&self, token: String) {
        let hub = Arc::clone(&self.deps.hub);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            match hub.validation_status(&token).await {
                Ok(status) => {
                    if let Some(signal) = status.into_signal(&token) {
                        info!(success = signal.success, "Validation confirmed by polling");
                        post_event(&inbox, ConnectionEvent::ValidationReceived(signal)).await;
                    }
                }
                Err(e) => debug!(error = %e, "Validation poll failed"),
            }
        });
    }

    fn spawn_redeem(&self, seq: u64, code: ReconnectCode) {
        let hub = Arc::clone(&self.deps.hub);
        let device = self.deps.tokens.device().clone();
        let inbox = self.inbox.clone();
        info!(user_id = %code.user_id, "Redeeming reconnect code");
        tokio::spawn(async move {
            let result = hub.redeem_code(&code, &device).await;
            post(&inbox, Inbox::RedeemResult { seq, result }).await;
        });
    }

    fn spawn_handoff(&mut self, token: String) {
        let launcher = Arc::clone(&self.deps.launcher);
        let device_id = self.deps.tokens.device().device_id.clone();
        let primary = self.config.handoff_url.clone();
        let fallback = self.config.handoff_fallback_url.clone();
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            let event = match launch(&*launcher, &primary, &token, &device_id).await {
                Ok(()) => ConnectionEvent::HandoffLaunched {
                    fallback_used: false,
                },
                Err(e) => {
                    warn!(error = %e, "Primary handoff URL failed, trying fallback");
                    match launch(&*launcher, &fallback, &token, &device_id).await {
                        Ok(()) => ConnectionEvent::HandoffLaunched {
                            fallback_used: true,
                        },
                        Err(e) => {
                            warn!(error = %e, "Fallback handoff URL failed");
                            ConnectionEvent::HandoffLaunchFailed {
                                message: "Couldn't open the browser".to_string(),
                            }
                        }
                    }
                }
            };
            post_event(&inbox, event).await;
        });
        replace_task(&mut self.handoff, task);
    }

    fn subscribe_realtime(&mut self, token: &str) {
        if let Some(previous) = self.subscription.take() {
            previous.forwarder.abort();
        }

        self.subscription_seq += 1;
        let id = self.subscription_seq;
        let (tx, mut rx) = mpsc::channel(16);
        let subscription = self.deps.realtime.subscribe(token, tx);

        let inbox = self.inbox.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                post(
                    &inbox,
                    Inbox::Realtime {
                        subscription: id,
                        update,
                    },
                )
                .await;
            }
        });

        debug!(subscription = id, "Realtime subscription opened");
        self.subscription = Some(LiveSubscription {
            id,
            _subscription: subscription,
            forwarder,
        });
    }

    /// Starts `phase` on the health bloc and mirrors its progress.
    fn spawn_sync(&mut self, phase: SyncPhase) {
        let health = self.deps.health.clone();
        let inbox = self.inbox.clone();

        let forwarder = tokio::spawn(async move {
            let job = match health.start_sync(phase).await {
                Ok(job) => job,
                Err(e) => {
                    post_event(
                        &inbox,
                        ConnectionEvent::SyncFailed {
                            phase,
                            message: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            };

            let mut progress = job.progress();
            let outcome = job.wait();
            tokio::pin!(outcome);
            let mut progress_open = true;

            loop {
                tokio::select! {
                    outcome = &mut outcome => {
                        let last = progress.borrow().clone();
                        post_event(&inbox, ConnectionEvent::SyncProgressed(last)).await;
                        match outcome {
                            PhaseOutcome::Completed(summary) => {
                                post_event(&inbox, ConnectionEvent::SyncPhaseCompleted {
                                    phase,
                                    failed_uploads: summary.failed_uploads,
                                }).await;
                            }
                            PhaseOutcome::Failed(message) => {
                                post_event(&inbox, ConnectionEvent::SyncFailed { phase, message }).await;
                            }
                            PhaseOutcome::Cancelled => debug!(phase = %phase, "Sync phase cancelled"),
                        }
                        break;
                    }
                    changed = progress.changed(), if progress_open => match changed {
                        Ok(()) => {
                            let snapshot = progress.borrow_and_update().clone();
                            post_event(&inbox, ConnectionEvent::SyncProgressed(snapshot)).await;
                        }
                        Err(_) => progress_open = false,
                    },
                }
            }
        });

        if let Some(previous) = self.sync_forwarders.insert(phase, forwarder) {
            previous.abort();
        }
    }

    fn watch_connectivity(&mut self) {
        let mut online = self.deps.connectivity.subscribe();
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            let initial = *online.borrow_and_update();
            if !initial {
                post_event(&inbox, ConnectionEvent::ConnectivityChanged { online: false }).await;
            }
            while online.changed().await.is_ok() {
                let online = *online.borrow_and_update();
                post_event(&inbox, ConnectionEvent::ConnectivityChanged { online }).await;
            }
        });
        self.connectivity_forwarder = Some(task);
    }

    async fn persist_connection(&self, device_name: &str, last_sync: DateTime<Utc>) -> BridgeResult<()> {
        self.deps
            .store
            .set(keys::CONNECTION_DEVICE_NAME, PrefValue::from(device_name))
            .await?;
        self.deps
            .store
            .set(keys::CONNECTION_LAST_SYNC, PrefValue::from(last_sync.to_rfc3339()))
            .await
    }

    fn teardown(&mut self) {
        abort_task(&mut self.retry_timer);
        abort_task(&mut self.validation_timer);
        abort_task(&mut self.realtime_retry_timer);
        abort_task(&mut self.handoff);
        abort_task(&mut self.connectivity_forwarder);
        if let Some(live) = self.subscription.take() {
            live.forwarder.abort();
        }
        for (_, forwarder) in self.sync_forwarders.drain() {
            forwarder.abort();
        }
    }
}

async fn launch(
    launcher: &dyn UrlLauncher,
    base: &str,
    token: &str,
    device_id: &str,
) -> BridgeResult<()> {
    let url = handoff_url(base, token, device_id)?;
    launcher.open(&url).await?;
    info!(host = ?url.host_str(), "Web handoff opened");
    Ok(())
}

fn abort_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_url_encodes_parameters() {
        let url = handoff_url("https://hub.example.com/connect?src=app", "AB 3D", "dev/1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://hub.example.com/connect?src=app&token=AB+3D&device=dev%2F1"
        );
    }

    #[test]
    fn test_handoff_url_rejects_garbage() {
        assert!(matches!(
            handoff_url("not a url", "AB3D", "dev-1"),
            Err(BridgeError::InvalidUrl(_))
        ));
    }
}
