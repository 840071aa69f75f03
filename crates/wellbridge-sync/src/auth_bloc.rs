//! # Auth Bloc
//!
//! Runtime around [`AuthMachine`]. Hub calls, the verification poll and the
//! resend cooldown run as tasks that post their results back as events.
//! Permission effects go through the [`HealthHandle`], so the auth flow and
//! the health screen share one in-flight permission request.
//!
//! Results are tagged with a session epoch; anything that lands after a
//! sign-out is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wellbridge_core::auth::{
    AuthEffect, AuthEvent, AuthMachine, AuthPolicy, AuthSession, AuthState, ONBOARDING_PERMISSIONS,
};
use wellbridge_core::{HealthPermissionStatus, SyncPhase, UserProfile};

use crate::error::{BridgeError, BridgeResult};
use crate::health_bloc::HealthHandle;
use crate::ports::AuthApi;
use crate::profile_store::ProfileStore;

enum Inbox {
    Event {
        event: AuthEvent,
        reply: Option<oneshot::Sender<AuthState>>,
    },
    Result {
        epoch: u64,
        event: AuthEvent,
    },
    Shutdown,
}

/// Collaborators the bloc drives.
#[derive(Clone)]
pub struct AuthDeps {
    pub auth: Arc<dyn AuthApi>,
    pub profiles: ProfileStore,
    pub health: HealthHandle,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the auth bloc.
#[derive(Clone)]
pub struct AuthHandle {
    tx: mpsc::Sender<Inbox>,
    state: watch::Receiver<AuthState>,
}

impl AuthHandle {
    /// Sends an event; resolves with the state once its effects are queued.
    pub async fn dispatch(&self, event: AuthEvent) -> BridgeResult<AuthState> {
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

    pub async fn sign_in(&self, email: &str, password: &str) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::SignInRequested {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn sign_up(&self, name: &str, email: &str, password: &str) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::SignUpRequested {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn resend_verification(&self) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::ResendVerificationRequested).await
    }

    pub async fn submit_profile(&self, profile: UserProfile) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::ProfileSubmitted(profile)).await
    }

    pub async fn edit_profile(&self) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::EditProfileRequested).await
    }

    pub async fn confirm_profile(&self) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::ProfileConfirmed).await
    }

    pub async fn retry_permissions(&self) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::RetryPermissions).await
    }

    pub async fn sign_out(&self) -> BridgeResult<AuthState> {
        self.dispatch(AuthEvent::SignOutRequested).await
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }

    /// Resolves with the first published state matching `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&AuthState) -> bool) -> BridgeResult<AuthState> {
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
            .map_err(|_| BridgeError::ChannelError("auth bloc already stopped".into()))
    }
}

// =============================================================================
// Bloc
// =============================================================================

/// Owns the auth state machine.
pub struct AuthBloc {
    deps: AuthDeps,
    machine: AuthMachine,
    rx: mpsc::Receiver<Inbox>,
    inbox: mpsc::WeakSender<Inbox>,
    state_tx: watch::Sender<AuthState>,
    epoch: u64,
    verification_poll: Option<JoinHandle<()>>,
    resend_cooldown: Option<JoinHandle<()>>,
}

impl AuthBloc {
    pub fn new(policy: AuthPolicy, deps: AuthDeps) -> (Self, AuthHandle) {
        let (tx, rx) = mpsc::channel(32);
        let machine = AuthMachine::new(policy);
        let (state_tx, state_rx) = watch::channel(machine.state().clone());
        let bloc = AuthBloc {
            deps,
            machine,
            rx,
            inbox: tx.downgrade(),
            state_tx,
            epoch: 0,
            verification_poll: None,
            resend_cooldown: None,
        };
        (bloc, AuthHandle { tx, state: state_rx })
    }

    pub fn spawn(policy: AuthPolicy, deps: AuthDeps) -> (AuthHandle, JoinHandle<()>) {
        let (bloc, handle) = AuthBloc::new(policy, deps);
        (handle, tokio::spawn(bloc.run()))
    }

    pub async fn run(mut self) {
        info!("Auth bloc starting");
        self.restore_session().await;

        while let Some(message) = self.rx.recv().await {
            match message {
                Inbox::Event { event, reply } => {
                    let state = self.handle_event(event).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(state);
                    }
                }
                Inbox::Result { epoch, event } => {
                    if epoch != self.epoch {
                        debug!(epoch, current = self.epoch, "Dropping result from a closed session");
                        continue;
                    }
                    self.handle_event(event).await;
                }
                Inbox::Shutdown => break,
            }
        }

        abort(&mut self.verification_poll);
        abort(&mut self.resend_cooldown);
        info!("Auth bloc stopped");
    }

    async fn restore_session(&mut self) {
        match self.deps.auth.current_session().await {
            Ok(Some(session)) => {
                info!(user_id = %session.user_id, "Restoring signed-in session");
                let session = merge_local_profile(&self.deps.profiles, session).await;
                self.handle_event(AuthEvent::AuthSucceeded(session)).await;
            }
            Ok(None) => debug!("No session to restore"),
            Err(e) => warn!(error = %e, "Failed to restore session"),
        }
    }

    async fn handle_event(&mut self, event: AuthEvent) -> AuthState {
        let before = self.machine.state().status;
        let transition = self.machine.handle(event);
        if transition.state.status != before {
            info!(from = %before, to = %transition.state.status, "Auth status changed");
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

    /// Runs `work` in a task and posts the event it yields.
    fn spawn_result<F>(&self, work: F)
    where
        F: std::future::Future<Output = Option<AuthEvent>> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            if let Some(event) = work.await {
                if let Some(inbox) = inbox.upgrade() {
                    let _ = inbox.send(Inbox::Result { epoch, event }).await;
                }
            }
        });
    }

    fn every(&self, period: Duration, event: AuthEvent) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inbox) = inbox.upgrade() else { break };
                let event = event.clone();
                if inbox.send(Inbox::Result { epoch, event }).await.is_err() {
                    break;
                }
            }
        })
    }

    fn after(&self, delay: Duration, event: AuthEvent) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Inbox::Result { epoch, event }).await;
            }
        })
    }

    async fn execute(&mut self, effect: AuthEffect) {
        debug!(effect = effect_name(&effect), "Executing auth effect");
        match effect {
            AuthEffect::SignIn { email, password } => {
                let auth = Arc::clone(&self.deps.auth);
                let profiles = self.deps.profiles.clone();
                self.spawn_result(async move {
                    Some(match auth.sign_in(&email, &password).await {
                        Ok(session) => {
                            AuthEvent::AuthSucceeded(merge_local_profile(&profiles, session).await)
                        }
                        Err(e) => AuthEvent::AuthFailed {
                            message: sign_in_message(&e),
                        },
                    })
                });
            }
            AuthEffect::SignUp {
                name,
                email,
                password,
            } => {
                let auth = Arc::clone(&self.deps.auth);
                self.spawn_result(async move {
                    Some(match auth.sign_up(&name, &email, &password).await {
                        Ok(session) => AuthEvent::AuthSucceeded(session),
                        Err(e) => AuthEvent::AuthFailed {
                            message: sign_up_message(&e),
                        },
                    })
                });
            }
            AuthEffect::StartVerificationPolling { every } => {
                let task = self.every(every, AuthEvent::VerificationPollTick);
                replace(&mut self.verification_poll, task);
            }
            AuthEffect::StopVerificationPolling => abort(&mut self.verification_poll),
            AuthEffect::CheckEmailVerified => {
                let auth = Arc::clone(&self.deps.auth);
                self.spawn_result(async move {
                    match auth.is_email_verified().await {
                        Ok(verified) => Some(AuthEvent::EmailVerificationChecked { verified }),
                        Err(e) => {
                            debug!(error = %e, "Verification check failed");
                            None
                        }
                    }
                });
            }
            AuthEffect::SendVerificationEmail => {
                let auth = Arc::clone(&self.deps.auth);
                self.spawn_result(async move {
                    if let Err(e) = auth.send_verification_email().await {
                        warn!(error = %e, "Failed to send verification email");
                    }
                    None
                });
            }
            AuthEffect::StartResendCooldown { duration } => {
                let task = self.after(duration, AuthEvent::ResendCooldownElapsed);
                replace(&mut self.resend_cooldown, task);
            }
            AuthEffect::CancelResendCooldown => abort(&mut self.resend_cooldown),
            AuthEffect::PersistProfile(profile) => {
                if let Err(e) = self.deps.profiles.save(&profile).await {
                    warn!(error = %e, "Failed to save profile locally");
                }
                if let Err(e) = self.deps.profiles.set_profile_complete(true).await {
                    warn!(error = %e, "Failed to mark profile complete");
                }
                let auth = Arc::clone(&self.deps.auth);
                self.spawn_result(async move {
                    if let Err(e) = auth.save_profile(&profile).await {
                        warn!(error = %e, "Failed to upload profile");
                    }
                    None
                });
            }
            AuthEffect::MarkOnboardingComplete => {
                if let Err(e) = self.deps.profiles.set_onboarding_complete(true).await {
                    warn!(error = %e, "Failed to mark onboarding complete");
                }
            }
            AuthEffect::CheckHealthPermissions => {
                let health = self.deps.health.clone();
                self.spawn_result(async move {
                    Some(AuthEvent::PermissionsResolved(check_then_request(&health).await))
                });
            }
            AuthEffect::RequestHealthPermissions { identifiers } => {
                let health = self.deps.health.clone();
                self.spawn_result(async move {
                    let status = match health.request_permissions(identifiers).await {
                        Ok(authorization) => authorization.status,
                        Err(e) => status_for_error(&e),
                    };
                    Some(AuthEvent::PermissionsResolved(status))
                });
            }
            AuthEffect::BeginQuickSync => {
                let health = self.deps.health.clone();
                self.spawn_result(async move {
                    match health.start_sync(SyncPhase::BodyPrep).await {
                        Ok(_job) => info!("Quick sync started"),
                        Err(e) => warn!(error = %e, "Quick sync did not start"),
                    }
                    None
                });
            }
            AuthEffect::ClearSession => {
                self.epoch += 1;
                abort(&mut self.verification_poll);
                abort(&mut self.resend_cooldown);
                if let Err(e) = self.deps.profiles.clear().await {
                    warn!(error = %e, "Failed to clear local profile");
                }
                let auth = Arc::clone(&self.deps.auth);
                tokio::spawn(async move {
                    if let Err(e) = auth.sign_out().await {
                        warn!(error = %e, "Hub sign-out failed");
                    }
                });
            }
        }
    }
}

/// Fills gaps in a hub session from the local profile of the same user.
async fn merge_local_profile(profiles: &ProfileStore, mut session: AuthSession) -> AuthSession {
    let local = match profiles.load().await {
        Ok(Some(profile)) if profile.user_id == session.user_id => profile,
        Ok(_) => return session,
        Err(e) => {
            warn!(error = %e, "Failed to read local profile");
            return session;
        }
    };
    if session.profile.is_none() {
        session.profile = Some(local);
    }
    if !session.onboarding_complete {
        session.onboarding_complete = profiles.is_onboarding_complete().await.unwrap_or(false);
    }
    session
}

/// Returning users who never granted anything get the dialog.
async fn check_then_request(health: &HealthHandle) -> HealthPermissionStatus {
    let current = match health.refresh().await {
        Ok(state) => state.permission_status(),
        Err(e) => return status_for_error(&e),
    };
    match current {
        Some(
            status @ (HealthPermissionStatus::Granted
            | HealthPermissionStatus::PartiallyGranted
            | HealthPermissionStatus::Unavailable),
        ) => status,
        _ => {
            let identifiers = ONBOARDING_PERMISSIONS.iter().map(|s| s.to_string()).collect();
            match health.request_permissions(identifiers).await {
                Ok(authorization) => authorization.status,
                Err(e) => status_for_error(&e),
            }
        }
    }
}

fn status_for_error(err: &BridgeError) -> HealthPermissionStatus {
    match err {
        BridgeError::PermissionUnavailable(_) => HealthPermissionStatus::Unavailable,
        BridgeError::RequestInFlight => HealthPermissionStatus::PromptingUser,
        other => {
            warn!(error = %other, "Permission request failed");
            HealthPermissionStatus::Denied
        }
    }
}

fn sign_in_message(err: &BridgeError) -> String {
    match err {
        BridgeError::Server { status: 401, .. } | BridgeError::Server { status: 403, .. } => {
            "Incorrect email or password.".to_string()
        }
        other if other.is_retryable() => {
            "Couldn't reach the server. Check your connection and try again.".to_string()
        }
        other => other.to_string(),
    }
}

fn sign_up_message(err: &BridgeError) -> String {
    match err {
        BridgeError::Server { status: 409, .. } => {
            "An account with this email already exists.".to_string()
        }
        other if other.is_retryable() => {
            "Couldn't reach the server. Check your connection and try again.".to_string()
        }
        other => other.to_string(),
    }
}

/// Effect name for logs; credentials stay out of them.
fn effect_name(effect: &AuthEffect) -> &'static str {
    match effect {
        AuthEffect::SignIn { .. } => "sign_in",
        AuthEffect::SignUp { .. } => "sign_up",
        AuthEffect::StartVerificationPolling { .. } => "start_verification_polling",
        AuthEffect::StopVerificationPolling => "stop_verification_polling",
        AuthEffect::CheckEmailVerified => "check_email_verified",
        AuthEffect::SendVerificationEmail => "send_verification_email",
        AuthEffect::StartResendCooldown { .. } => "start_resend_cooldown",
        AuthEffect::CancelResendCooldown => "cancel_resend_cooldown",
        AuthEffect::PersistProfile(_) => "persist_profile",
        AuthEffect::MarkOnboardingComplete => "mark_onboarding_complete",
        AuthEffect::CheckHealthPermissions => "check_health_permissions",
        AuthEffect::RequestHealthPermissions { .. } => "request_health_permissions",
        AuthEffect::BeginQuickSync => "begin_quick_sync",
        AuthEffect::ClearSession => "clear_session",
    }
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

fn replace(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_map_to_statuses() {
        assert_eq!(
            status_for_error(&BridgeError::PermissionUnavailable("Health Connect".into())),
            HealthPermissionStatus::Unavailable
        );
        assert_eq!(
            status_for_error(&BridgeError::RequestInFlight),
            HealthPermissionStatus::PromptingUser
        );
        assert_eq!(
            status_for_error(&BridgeError::Platform("crashed".into())),
            HealthPermissionStatus::Denied
        );
    }

    #[test]
    fn test_sign_in_messages() {
        let unauthorized = BridgeError::Server {
            status: 401,
            message: "bad credentials".into(),
        };
        assert_eq!(sign_in_message(&unauthorized), "Incorrect email or password.");
        assert!(sign_in_message(&BridgeError::Network("reset".into())).starts_with("Couldn't reach"));
        let conflict = BridgeError::Server {
            status: 409,
            message: "exists".into(),
        };
        assert_eq!(
            sign_up_message(&conflict),
            "An account with this email already exists."
        );
    }
}
