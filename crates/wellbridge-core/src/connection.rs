//! # Connection State Machine
//!
//! The pure transition function behind the device-to-hub handoff. It never
//! performs I/O: every transition returns the effects the runtime must carry
//! out (generate a token, open the browser, arm a timer, ...), and the results
//! of those effects come back in as new events.
//!
//! ## Handoff Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Connection Handoff                              │
//! │                                                                         │
//! │  Disconnected ──ConnectRequested──► Connecting ──TokenIssued──┐        │
//! │       ▲                               │   ▲                   │        │
//! │       │                  RequestFailed│   │RetryTimerFired    ▼        │
//! │       │                               ▼   │          AwaitingWebValidation
//! │       │                             Error ┘                   │        │
//! │       │                               │ attempts > max        │        │
//! │       │                               ▼                       │        │
//! │       │                         NetworkError    ValidationReceived     │
//! │       │                                         (success, active token,│
//! │       │                                          not expired)          │
//! │       │                                                       │        │
//! │       │                                  SyncIntro ◄──────────┤        │
//! │       │                                      │ acknowledged   │        │
//! │       │                                      ▼                ▼        │
//! │       │                                   Syncing ◄───────────┘        │
//! │       │                                      │ Body Prep done          │
//! │       │                                      ▼                         │
//! │       └──────────DisconnectRequested──── Connected                     │
//! │                                                                         │
//! │  Token generation alone never reaches SyncIntro/Syncing/Connected.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Realtime Sub-State
//! The realtime channel status is tracked for UI feedback only. A channel
//! reporting `Subscribed` does not complete anything; only a validation
//! signal whose token matches the active, unexpired token does.
//!
//! While awaiting validation, a channel that gives up (`NetworkError`) is
//! answered with a one-off `PollValidation` against the hub and a backed-off
//! resubscribe. Coming back online resubscribes immediately. A poll answer
//! enters as an ordinary `ValidationReceived`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::progress::{SyncPhase, SyncProgress};
use crate::token::{ConnectionToken, ReconnectCode};

// =============================================================================
// Status Enumerations
// =============================================================================

/// Top-level connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    AwaitingWebValidation,
    SyncIntro,
    Syncing,
    Connected,
    /// Transient failure; retry or user action possible.
    Error,
    /// Reconnect attempts exhausted.
    NetworkError,
}

impl ConnectionStatus {
    /// States reached only after a confirmed validation.
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::SyncIntro | ConnectionStatus::Syncing | ConnectionStatus::Connected
        )
    }

    /// States before the hub has confirmed the device.
    pub fn is_pre_connected(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::AwaitingWebValidation
        )
    }

    /// States from which a new connect attempt may start.
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected
                | ConnectionStatus::Error
                | ConnectionStatus::NetworkError
                | ConnectionStatus::AwaitingWebValidation
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::AwaitingWebValidation => "awaiting_web_validation",
            ConnectionStatus::SyncIntro => "sync_intro",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::NetworkError => "network_error",
        };
        f.write_str(label)
    }
}

/// Realtime channel sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum RealtimeStatus {
    Disconnected,
    Connecting,
    Retrying,
    Subscribed,
    Error,
    NetworkError,
}

impl std::fmt::Display for RealtimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RealtimeStatus::Disconnected => "disconnected",
            RealtimeStatus::Connecting => "connecting",
            RealtimeStatus::Retrying => "retrying",
            RealtimeStatus::Subscribed => "subscribed",
            RealtimeStatus::Error => "error",
            RealtimeStatus::NetworkError => "network_error",
        };
        f.write_str(label)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Published snapshot of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConnectionState {
    pub status: ConnectionStatus,

    /// Name the hub knows this device by, once linked.
    pub device_name: Option<String>,

    #[ts(type = "string | null")]
    pub last_sync: Option<DateTime<Utc>>,

    /// Never set while `Connected`.
    pub error_message: Option<String>,

    pub realtime_status: RealtimeStatus,

    pub reconnect_attempts: u32,

    /// Only ever true in a pre-connected status.
    pub is_awaiting_web_validation: bool,

    /// Display form of the active token, while one is outstanding.
    pub connection_code: Option<String>,

    #[ts(type = "string | null")]
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Hub session created by the validation.
    pub session_id: Option<String>,

    pub sync_progress: Option<SyncProgress>,

    /// A sync phase failed or lost batches; the link itself is fine.
    pub sync_degraded: bool,

    /// Last sync problem, shown next to the degraded flag.
    pub sync_error: Option<String>,

    pub is_online: bool,
}

impl ConnectionState {
    /// The disconnected baseline.
    pub fn disconnected() -> Self {
        ConnectionState {
            status: ConnectionStatus::Disconnected,
            device_name: None,
            last_sync: None,
            error_message: None,
            realtime_status: RealtimeStatus::Disconnected,
            reconnect_attempts: 0,
            is_awaiting_web_validation: false,
            connection_code: None,
            token_expires_at: None,
            session_id: None,
            sync_progress: None,
            sync_degraded: false,
            sync_error: None,
            is_online: true,
        }
    }

    /// True when the structural invariants hold.
    pub fn invariants_hold(&self) -> bool {
        let connected_without_error =
            self.status != ConnectionStatus::Connected || self.error_message.is_none();
        let awaiting_is_pre_connected =
            !self.is_awaiting_web_validation || self.status.is_pre_connected();
        connected_without_error && awaiting_is_pre_connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::disconnected()
    }
}

// =============================================================================
// Events & Effects
// =============================================================================

/// Confirmation from the web side, keyed by the token it validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSignal {
    /// Token the web side validated, in any display format.
    pub token: String,
    pub success: bool,
    pub device_name: Option<String>,
    pub session_id: Option<String>,
    /// Reason supplied by the hub on failure.
    pub message: Option<String>,
}

/// Inputs to the connection machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// User tapped "Generate Connection Code" (or regenerate).
    ConnectRequested,
    /// User typed a `userId/token` code.
    ReconnectWithCode { code: String },
    /// The hub issued a token.
    TokenIssued { token: ConnectionToken },
    /// Redeeming a reconnect code succeeded.
    CodeRedeemed {
        device_name: Option<String>,
        session_id: Option<String>,
    },
    /// Token generation or code redemption failed.
    RequestFailed { message: String, retryable: bool },
    RetryTimerFired,
    HandoffLaunched { fallback_used: bool },
    HandoffLaunchFailed { message: String },
    RealtimeStatusChanged(RealtimeStatus),
    /// Backoff after a lost realtime channel elapsed.
    RealtimeRetryFired,
    ValidationReceived(ValidationSignal),
    ValidationTimedOut,
    CancelHandoff,
    SyncIntroAcknowledged,
    SyncProgressed(SyncProgress),
    SyncPhaseCompleted { phase: SyncPhase, failed_uploads: u64 },
    SyncFailed { phase: SyncPhase, message: String },
    ConnectivityChanged { online: bool },
    DisconnectRequested,
}

/// Work the runtime performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEffect {
    GenerateToken,
    RedeemReconnectCode(ReconnectCode),
    LaunchWebHandoff { token: String },
    SubscribeRealtime { token: String },
    UnsubscribeRealtime,
    /// Ask the hub directly whether the token was validated.
    PollValidation { token: String },
    ScheduleRealtimeRetry { after: Duration },
    StartValidationTimeout,
    CancelValidationTimeout,
    ScheduleRetry { attempt: u32, after: Duration },
    CancelRetry,
    PersistConnection {
        device_name: String,
        last_sync: DateTime<Utc>,
    },
    ClearToken,
    ClearPersistedConnection,
    StartBodyPrepSync,
    StartDigitalTwinSync,
    CancelSync,
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    pub effects: Vec<ConnectionEffect>,
    /// Set when an input was refused on a domain rule.
    pub rejection: Option<CoreError>,
}

// =============================================================================
// Policy
// =============================================================================

/// Tunables for the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Automatic retries before `NetworkError`.
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Show the sync intro screen before Body Prep starts.
    pub show_sync_intro: bool,
    /// Used when the hub does not name the device.
    pub fallback_device_name: String,
    /// Characters per group in the displayed code.
    pub token_group_size: usize,
}

impl ConnectionPolicy {
    /// Exponential delay for the given attempt (1-based), capped.
    ///
    /// ## Example
    /// ```rust
    /// use std::time::Duration;
    /// use wellbridge_core::connection::ConnectionPolicy;
    ///
    /// let policy = ConnectionPolicy::default();
    /// assert_eq!(policy.retry_delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.retry_delay(3), Duration::from_secs(4));
    /// assert_eq!(policy.retry_delay(20), Duration::from_secs(30));
    /// ```
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        ConnectionPolicy {
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            show_sync_intro: true,
            fallback_device_name: "This device".to_string(),
            token_group_size: crate::DEFAULT_TOKEN_GROUP_SIZE,
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Request to repeat when a retry fires.
#[derive(Debug, Clone, PartialEq)]
enum PendingRequest {
    Generate,
    Redeem(ReconnectCode),
}

impl PendingRequest {
    fn effect(&self) -> ConnectionEffect {
        match self {
            PendingRequest::Generate => ConnectionEffect::GenerateToken,
            PendingRequest::Redeem(code) => ConnectionEffect::RedeemReconnectCode(code.clone()),
        }
    }
}

/// The connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ConnectionPolicy,
    state: ConnectionState,
    active_token: Option<ConnectionToken>,
    pending: Option<PendingRequest>,
    /// Resubscribes since the channel was last lost.
    realtime_retries: u32,
}

impl ConnectionMachine {
    /// A machine in the disconnected baseline.
    pub fn new(policy: ConnectionPolicy) -> Self {
        ConnectionMachine {
            policy,
            state: ConnectionState::disconnected(),
            active_token: None,
            pending: None,
            realtime_retries: 0,
        }
    }

    /// A machine for a device linked in an earlier session.
    pub fn resume(
        policy: ConnectionPolicy,
        device_name: String,
        last_sync: Option<DateTime<Utc>>,
    ) -> Self {
        let mut machine = Self::new(policy);
        machine.state.status = ConnectionStatus::Connected;
        machine.state.device_name = Some(device_name);
        machine.state.last_sync = last_sync;
        machine
    }

    /// Current snapshot.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The token a validation must match, if any.
    pub fn active_token(&self) -> Option<&ConnectionToken> {
        self.active_token.as_ref()
    }

    /// Applies one event.
    pub fn handle(&mut self, event: ConnectionEvent, now: DateTime<Utc>) -> Transition {
        let mut effects = Vec::new();
        let mut rejection = None;

        match event {
            ConnectionEvent::ConnectRequested => self.on_connect(&mut effects),
            ConnectionEvent::ReconnectWithCode { code } => {
                self.on_reconnect_code(&code, &mut effects, &mut rejection)
            }
            ConnectionEvent::TokenIssued { token } => self.on_token_issued(token, &mut effects),
            ConnectionEvent::CodeRedeemed {
                device_name,
                session_id,
            } => {
                if self.state.status == ConnectionStatus::Connecting
                    && matches!(self.pending, Some(PendingRequest::Redeem(_)))
                {
                    self.pending = None;
                    self.link(device_name, session_id, now, &mut effects);
                }
            }
            ConnectionEvent::RequestFailed { message, retryable } => {
                self.on_request_failed(message, retryable, &mut effects)
            }
            ConnectionEvent::RetryTimerFired => {
                if self.state.status == ConnectionStatus::Error {
                    if let Some(pending) = &self.pending {
                        effects.push(pending.effect());
                        self.state.status = ConnectionStatus::Connecting;
                    }
                }
            }
            ConnectionEvent::HandoffLaunched { fallback_used } => {
                if self.state.status == ConnectionStatus::AwaitingWebValidation && fallback_used {
                    self.state.error_message = None;
                }
            }
            ConnectionEvent::HandoffLaunchFailed { message } => {
                if self.state.status == ConnectionStatus::AwaitingWebValidation {
                    self.state.error_message = Some(format!(
                        "{}. Open the Wellness Hub and enter the code manually.",
                        message
                    ));
                }
            }
            ConnectionEvent::RealtimeStatusChanged(status) => {
                if self.state.status != ConnectionStatus::Disconnected
                    || status == RealtimeStatus::Disconnected
                {
                    self.state.realtime_status = status;
                }
                match status {
                    RealtimeStatus::Subscribed => self.realtime_retries = 0,
                    RealtimeStatus::NetworkError => self.on_realtime_lost(&mut effects),
                    _ => {}
                }
            }
            ConnectionEvent::RealtimeRetryFired => {
                if self.state.is_online && self.state.realtime_status == RealtimeStatus::NetworkError {
                    self.resubscribe(&mut effects);
                }
            }
            ConnectionEvent::ValidationReceived(signal) => {
                self.on_validation(signal, now, &mut effects, &mut rejection)
            }
            ConnectionEvent::ValidationTimedOut => {
                if self.state.status == ConnectionStatus::AwaitingWebValidation {
                    self.abandon_token(&mut effects);
                    self.state.status = ConnectionStatus::Error;
                    self.state.error_message = Some(
                        "The code was not confirmed in time. Generate a new code to try again."
                            .to_string(),
                    );
                }
            }
            ConnectionEvent::CancelHandoff => {
                if self.state.status.is_pre_connected()
                    || self.state.status == ConnectionStatus::Error
                {
                    effects.push(ConnectionEffect::CancelRetry);
                    self.abandon_token(&mut effects);
                    self.pending = None;
                    self.state.status = ConnectionStatus::Disconnected;
                    self.state.error_message = None;
                    self.state.reconnect_attempts = 0;
                }
            }
            ConnectionEvent::SyncIntroAcknowledged => {
                if self.state.status == ConnectionStatus::SyncIntro {
                    self.begin_body_prep(&mut effects);
                }
            }
            ConnectionEvent::SyncProgressed(progress) => {
                if matches!(
                    self.state.status,
                    ConnectionStatus::Syncing | ConnectionStatus::Connected
                ) {
                    self.state.sync_progress = Some(progress);
                }
            }
            ConnectionEvent::SyncPhaseCompleted {
                phase,
                failed_uploads,
            } => self.on_phase_completed(phase, failed_uploads, now, &mut effects),
            ConnectionEvent::SyncFailed { phase, message } => {
                self.on_sync_failed(phase, message, &mut effects)
            }
            ConnectionEvent::ConnectivityChanged { online } => {
                self.on_connectivity(online, &mut effects)
            }
            ConnectionEvent::DisconnectRequested => {
                let is_online = self.state.is_online;
                effects.extend([
                    ConnectionEffect::CancelRetry,
                    ConnectionEffect::CancelValidationTimeout,
                    ConnectionEffect::UnsubscribeRealtime,
                    ConnectionEffect::CancelSync,
                    ConnectionEffect::ClearToken,
                    ConnectionEffect::ClearPersistedConnection,
                ]);
                self.state = ConnectionState::disconnected();
                self.state.is_online = is_online;
                self.active_token = None;
                self.pending = None;
            }
        }

        Transition {
            state: self.state.clone(),
            effects,
            rejection,
        }
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    fn on_connect(&mut self, effects: &mut Vec<ConnectionEffect>) {
        if !self.state.status.accepts_connect() {
            return;
        }

        // Regenerating supersedes the outstanding token.
        if self.state.status == ConnectionStatus::AwaitingWebValidation {
            self.abandon_token(effects);
        }

        effects.push(ConnectionEffect::CancelRetry);
        self.pending = Some(PendingRequest::Generate);
        self.state.reconnect_attempts = 0;
        self.state.error_message = None;
        self.start_pending(effects);
    }

    fn on_reconnect_code(
        &mut self,
        code: &str,
        effects: &mut Vec<ConnectionEffect>,
        rejection: &mut Option<CoreError>,
    ) {
        if !self.state.status.accepts_connect() {
            return;
        }

        match ReconnectCode::parse(code) {
            Ok(code) => {
                if self.state.status == ConnectionStatus::AwaitingWebValidation {
                    self.abandon_token(effects);
                }
                effects.push(ConnectionEffect::CancelRetry);
                self.pending = Some(PendingRequest::Redeem(code));
                self.state.reconnect_attempts = 0;
                self.state.error_message = None;
                self.start_pending(effects);
            }
            Err(err) => {
                self.state.is_awaiting_web_validation = false;
                self.state.status = ConnectionStatus::Error;
                self.state.error_message = Some(err.to_string());
                *rejection = Some(CoreError::Validation(err));
            }
        }
    }

    fn start_pending(&mut self, effects: &mut Vec<ConnectionEffect>) {
        if !self.state.is_online {
            self.state.status = ConnectionStatus::Error;
            self.state.error_message =
                Some("You're offline. We'll try again when the connection is back.".to_string());
            return;
        }
        if let Some(pending) = &self.pending {
            effects.push(pending.effect());
            self.state.status = ConnectionStatus::Connecting;
        }
    }

    fn on_token_issued(&mut self, token: ConnectionToken, effects: &mut Vec<ConnectionEffect>) {
        let expecting = self.state.status == ConnectionStatus::Connecting
            && self.pending == Some(PendingRequest::Generate);

        if !expecting {
            // Arrived after a cancel or disconnect.
            effects.push(ConnectionEffect::ClearToken);
            return;
        }

        let raw = token.raw().to_string();
        self.pending = None;
        self.state.status = ConnectionStatus::AwaitingWebValidation;
        self.state.is_awaiting_web_validation = true;
        self.state.reconnect_attempts = 0;
        self.state.error_message = None;
        self.state.connection_code = Some(token.formatted(self.policy.token_group_size));
        self.state.token_expires_at = Some(token.expires_at());
        self.state.realtime_status = RealtimeStatus::Connecting;
        self.active_token = Some(token);
        self.realtime_retries = 0;

        effects.extend([
            ConnectionEffect::SubscribeRealtime { token: raw.clone() },
            ConnectionEffect::StartValidationTimeout,
            ConnectionEffect::LaunchWebHandoff { token: raw },
        ]);
    }

    fn on_request_failed(
        &mut self,
        message: String,
        retryable: bool,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        if self.state.status != ConnectionStatus::Connecting {
            return;
        }

        self.state.error_message = Some(message);

        if !retryable {
            self.pending = None;
            self.state.status = ConnectionStatus::Error;
            return;
        }

        if self.state.reconnect_attempts >= self.policy.max_reconnect_attempts {
            self.state.status = ConnectionStatus::NetworkError;
            return;
        }

        self.state.reconnect_attempts += 1;
        self.state.status = ConnectionStatus::Error;
        effects.push(ConnectionEffect::ScheduleRetry {
            attempt: self.state.reconnect_attempts,
            after: self.policy.retry_delay(self.state.reconnect_attempts),
        });
    }

    fn on_validation(
        &mut self,
        signal: ValidationSignal,
        now: DateTime<Utc>,
        effects: &mut Vec<ConnectionEffect>,
        rejection: &mut Option<CoreError>,
    ) {
        if self.state.status != ConnectionStatus::AwaitingWebValidation {
            return;
        }

        let token = match &self.active_token {
            Some(token) if token.matches(&signal.token) => token.clone(),
            _ => {
                *rejection = Some(CoreError::TokenSuperseded);
                return;
            }
        };

        if let Err(expired) = token.ensure_valid_at(now) {
            self.abandon_token(effects);
            self.state.status = ConnectionStatus::Error;
            self.state.error_message = Some(expired.to_string());
            *rejection = Some(expired);
            return;
        }

        if !signal.success {
            self.abandon_token(effects);
            self.state.status = ConnectionStatus::Error;
            self.state.error_message = Some(
                signal
                    .message
                    .unwrap_or_else(|| "The Wellness Hub rejected this code.".to_string()),
            );
            return;
        }

        effects.push(ConnectionEffect::CancelValidationTimeout);
        effects.push(ConnectionEffect::UnsubscribeRealtime);
        self.state.realtime_status = RealtimeStatus::Disconnected;
        self.link(signal.device_name, signal.session_id, now, effects);
    }

    /// Common tail of a confirmed validation or code redemption.
    fn link(
        &mut self,
        device_name: Option<String>,
        session_id: Option<String>,
        now: DateTime<Utc>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        let device_name = device_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.policy.fallback_device_name.clone());

        self.state.is_awaiting_web_validation = false;
        self.state.error_message = None;
        self.state.reconnect_attempts = 0;
        self.state.connection_code = None;
        self.state.device_name = Some(device_name.clone());
        self.state.session_id = session_id;
        self.state.last_sync = Some(now);

        effects.push(ConnectionEffect::PersistConnection {
            device_name,
            last_sync: now,
        });

        if self.policy.show_sync_intro {
            self.state.status = ConnectionStatus::SyncIntro;
        } else {
            self.begin_body_prep(effects);
        }
    }

    fn begin_body_prep(&mut self, effects: &mut Vec<ConnectionEffect>) {
        self.state.status = ConnectionStatus::Syncing;
        self.state.sync_progress = Some(SyncProgress::initial(Some(SyncPhase::BodyPrep)));
        self.state.sync_degraded = false;
        self.state.sync_error = None;
        effects.push(ConnectionEffect::StartBodyPrepSync);
    }

    fn on_phase_completed(
        &mut self,
        phase: SyncPhase,
        failed_uploads: u64,
        now: DateTime<Utc>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        let expected = match phase {
            SyncPhase::BodyPrep => ConnectionStatus::Syncing,
            SyncPhase::DigitalTwin => ConnectionStatus::Connected,
        };
        if self.state.status != expected {
            return;
        }

        if failed_uploads > 0 {
            self.state.sync_degraded = true;
            self.state.sync_error = Some(format!(
                "{} data points could not be uploaded during {}",
                failed_uploads, phase
            ));
        }

        self.state.last_sync = Some(now);
        if let Some(device_name) = self.state.device_name.clone() {
            effects.push(ConnectionEffect::PersistConnection {
                device_name,
                last_sync: now,
            });
        }

        if phase == SyncPhase::BodyPrep {
            self.state.status = ConnectionStatus::Connected;
            self.state.error_message = None;
            effects.push(ConnectionEffect::StartDigitalTwinSync);
        }
    }

    fn on_sync_failed(&mut self, phase: SyncPhase, message: String, effects: &mut Vec<ConnectionEffect>) {
        match (phase, self.state.status) {
            (SyncPhase::BodyPrep, ConnectionStatus::Syncing) => {
                self.state.status = ConnectionStatus::Connected;
                self.state.error_message = None;
                self.state.sync_degraded = true;
                self.state.sync_error = Some(message);
                effects.push(ConnectionEffect::StartDigitalTwinSync);
            }
            (SyncPhase::DigitalTwin, ConnectionStatus::Connected) => {
                self.state.sync_degraded = true;
                self.state.sync_error = Some(message);
            }
            _ => {}
        }
    }

    fn on_connectivity(&mut self, online: bool, effects: &mut Vec<ConnectionEffect>) {
        let was_online = self.state.is_online;
        self.state.is_online = online;

        if !online {
            if self.state.realtime_status != RealtimeStatus::Disconnected {
                self.state.realtime_status = RealtimeStatus::NetworkError;
            }
            return;
        }

        let retryable = matches!(
            self.state.status,
            ConnectionStatus::Error | ConnectionStatus::NetworkError
        );
        if !was_online && retryable && self.pending.is_some() {
            effects.push(ConnectionEffect::CancelRetry);
            self.state.reconnect_attempts = 0;
            self.state.error_message = None;
            self.start_pending(effects);
        }

        if !was_online && self.state.realtime_status == RealtimeStatus::NetworkError {
            self.realtime_retries = 0;
            self.resubscribe(effects);
        }
    }

    /// The token still waiting on the web side.
    fn awaited_token(&self) -> Option<String> {
        if self.state.status != ConnectionStatus::AwaitingWebValidation {
            return None;
        }
        self.active_token.as_ref().map(|t| t.raw().to_string())
    }

    /// The realtime listener gave up; poll once, then retry the channel.
    fn on_realtime_lost(&mut self, effects: &mut Vec<ConnectionEffect>) {
        if !self.state.is_online {
            return;
        }
        let Some(token) = self.awaited_token() else {
            return;
        };
        self.realtime_retries += 1;
        effects.extend([
            ConnectionEffect::PollValidation { token },
            ConnectionEffect::ScheduleRealtimeRetry {
                after: self.policy.retry_delay(self.realtime_retries),
            },
        ]);
    }

    fn resubscribe(&mut self, effects: &mut Vec<ConnectionEffect>) {
        let Some(token) = self.awaited_token() else {
            return;
        };
        self.state.realtime_status = RealtimeStatus::Connecting;
        effects.extend([
            ConnectionEffect::SubscribeRealtime {
                token: token.clone(),
            },
            ConnectionEffect::PollValidation { token },
        ]);
    }

    /// Drops the active token and everything waiting on it.
    fn abandon_token(&mut self, effects: &mut Vec<ConnectionEffect>) {
        effects.extend([
            ConnectionEffect::CancelValidationTimeout,
            ConnectionEffect::UnsubscribeRealtime,
            ConnectionEffect::ClearToken,
        ]);
        self.active_token = None;
        self.state.is_awaiting_web_validation = false;
        self.state.connection_code = None;
        self.state.token_expires_at = None;
        self.state.realtime_status = RealtimeStatus::Disconnected;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
