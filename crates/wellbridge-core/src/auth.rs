//! # Auth State Machine
//!
//! Sequences sign-in, email verification, onboarding, profile confirmation and
//! the health-permission gate. Like the connection machine it is a pure
//! transition function returning effects.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Auth / Onboarding Flow                          │
//! │                                                                         │
//! │  Unauthenticated ──SignIn/SignUp──► Authenticating                     │
//! │                                        │                                │
//! │             ┌──────────────────────────┼─────────────────────┐         │
//! │             ▼ email not verified       ▼ profile incomplete  ▼ done    │
//! │  EmailVerificationPending ──verified──► Onboarding     PermissionsPending
//! │    (poll timer, resend cooldown)        │ ProfileSubmitted     │         │
//! │                                         ▼                      │         │
//! │                               ProfileConfirmation ─confirm─────┘         │
//! │                                                                │         │
//! │         granted / partiallyGranted ◄── PermissionsResolved ◄───┘         │
//! │                 │                        │            │                  │
//! │                 ▼                        ▼            ▼                  │
//! │               Ready              PermissionsDenied  PermissionsUnavailable
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Input is validated locally before any effect that reaches the network.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::permission::HealthPermissionStatus;
use crate::platform::PlatformCapabilities;
use crate::profile::UserProfile;
use crate::validation::{validate_email, validate_name, validate_password};

/// Identifiers requested right after onboarding.
pub const ONBOARDING_PERMISSIONS: [&str; 6] = [
    "weight",
    "height",
    "steps",
    "sleep_asleep",
    "heart_rate",
    "physical_activity",
];

// =============================================================================
// State
// =============================================================================

/// Where the user is in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticating,
    EmailVerificationPending,
    Onboarding,
    ProfileConfirmation,
    PermissionsPending,
    PermissionsDenied,
    PermissionsUnavailable,
    Ready,
    Error,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AuthStatus::Unauthenticated => "unauthenticated",
            AuthStatus::Authenticating => "authenticating",
            AuthStatus::EmailVerificationPending => "email_verification_pending",
            AuthStatus::Onboarding => "onboarding",
            AuthStatus::ProfileConfirmation => "profile_confirmation",
            AuthStatus::PermissionsPending => "permissions_pending",
            AuthStatus::PermissionsDenied => "permissions_denied",
            AuthStatus::PermissionsUnavailable => "permissions_unavailable",
            AuthStatus::Ready => "ready",
            AuthStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Published auth snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AuthState {
    pub status: AuthStatus,
    pub user_id: Option<String>,
    pub email: Option<String>,

    /// Draft while onboarding, confirmed profile afterwards.
    pub profile: Option<UserProfile>,

    /// Fields the platform still needs before onboarding can finish.
    pub missing_fields: Vec<String>,

    /// False while the resend cooldown runs.
    pub can_resend_verification: bool,

    pub permission_status: Option<HealthPermissionStatus>,

    pub error_message: Option<String>,
}

impl AuthState {
    /// Signed-out baseline.
    pub fn signed_out() -> Self {
        AuthState {
            status: AuthStatus::Unauthenticated,
            user_id: None,
            email: None,
            profile: None,
            missing_fields: Vec::new(),
            can_resend_verification: true,
            permission_status: None,
            error_message: None,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState::signed_out()
    }
}

// =============================================================================
// Events & Effects
// =============================================================================

/// What the hub knows about a signed-in account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub profile: Option<UserProfile>,
    pub onboarding_complete: bool,
}

/// Inputs to the auth machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignInRequested { email: String, password: String },
    SignUpRequested {
        name: String,
        email: String,
        password: String,
    },
    /// Sign-in, sign-up or a restored session succeeded.
    AuthSucceeded(AuthSession),
    AuthFailed { message: String },
    VerificationPollTick,
    EmailVerificationChecked { verified: bool },
    ResendVerificationRequested,
    ResendCooldownElapsed,
    ProfileSubmitted(UserProfile),
    EditProfileRequested,
    ProfileConfirmed,
    PermissionsResolved(HealthPermissionStatus),
    RetryPermissions,
    SignOutRequested,
}

/// Work the runtime performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEffect {
    SignIn { email: String, password: String },
    SignUp {
        name: String,
        email: String,
        password: String,
    },
    StartVerificationPolling { every: Duration },
    StopVerificationPolling,
    CheckEmailVerified,
    SendVerificationEmail,
    StartResendCooldown { duration: Duration },
    CancelResendCooldown,
    PersistProfile(UserProfile),
    MarkOnboardingComplete,
    CheckHealthPermissions,
    RequestHealthPermissions { identifiers: Vec<String> },
    BeginQuickSync,
    ClearSession,
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthTransition {
    pub state: AuthState,
    pub effects: Vec<AuthEffect>,
}

/// Tunables for the auth flow.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthPolicy {
    pub capabilities: PlatformCapabilities,
    pub verification_poll: Duration,
    pub resend_cooldown: Duration,
}

impl AuthPolicy {
    /// Defaults for a platform: 5 s poll, 60 s cooldown.
    pub fn for_capabilities(capabilities: PlatformCapabilities) -> Self {
        AuthPolicy {
            capabilities,
            verification_poll: Duration::from_secs(5),
            resend_cooldown: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// The auth state machine.
#[derive(Debug, Clone)]
pub struct AuthMachine {
    policy: AuthPolicy,
    state: AuthState,
}

impl AuthMachine {
    pub fn new(policy: AuthPolicy) -> Self {
        AuthMachine {
            policy,
            state: AuthState::signed_out(),
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Applies one event.
    pub fn handle(&mut self, event: AuthEvent) -> AuthTransition {
        let mut effects = Vec::new();

        match event {
            AuthEvent::SignInRequested { email, password } => {
                if self.accepts_credentials() {
                    match validate_email(&email).and_then(|_| {
                        if password.is_empty() {
                            Err(crate::ValidationError::required("password"))
                        } else {
                            Ok(())
                        }
                    }) {
                        Ok(()) => {
                            self.state.status = AuthStatus::Authenticating;
                            self.state.error_message = None;
                            effects.push(AuthEffect::SignIn {
                                email: email.trim().to_string(),
                                password,
                            });
                        }
                        Err(err) => self.fail(err.to_string()),
                    }
                }
            }
            AuthEvent::SignUpRequested {
                name,
                email,
                password,
            } => {
                if self.accepts_credentials() {
                    let checked = validate_name(&name).and_then(|name| {
                        validate_email(&email)?;
                        validate_password(&password)?;
                        Ok(name)
                    });
                    match checked {
                        Ok(name) => {
                            self.state.status = AuthStatus::Authenticating;
                            self.state.error_message = None;
                            effects.push(AuthEffect::SignUp {
                                name,
                                email: email.trim().to_string(),
                                password,
                            });
                        }
                        Err(err) => self.fail(err.to_string()),
                    }
                }
            }
            AuthEvent::AuthSucceeded(session) => self.on_session(session, &mut effects),
            AuthEvent::AuthFailed { message } => {
                if self.state.status == AuthStatus::Authenticating {
                    self.fail(message);
                }
            }
            AuthEvent::VerificationPollTick => {
                if self.state.status == AuthStatus::EmailVerificationPending {
                    effects.push(AuthEffect::CheckEmailVerified);
                }
            }
            AuthEvent::EmailVerificationChecked { verified } => {
                if self.state.status == AuthStatus::EmailVerificationPending && verified {
                    self.leave_verification(&mut effects);
                    self.enter_onboarding_or_permissions(false, &mut effects);
                }
            }
            AuthEvent::ResendVerificationRequested => {
                if self.state.status == AuthStatus::EmailVerificationPending
                    && self.state.can_resend_verification
                {
                    self.state.can_resend_verification = false;
                    effects.push(AuthEffect::SendVerificationEmail);
                    effects.push(AuthEffect::StartResendCooldown {
                        duration: self.policy.resend_cooldown,
                    });
                }
            }
            AuthEvent::ResendCooldownElapsed => {
                self.state.can_resend_verification = true;
            }
            AuthEvent::ProfileSubmitted(mut profile) => {
                if self.state.status == AuthStatus::Onboarding {
                    if let Some(user_id) = &self.state.user_id {
                        profile.user_id = user_id.clone();
                    }
                    self.state.missing_fields = profile
                        .missing_fields(&self.policy.capabilities)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    match profile.validate(&self.policy.capabilities) {
                        Ok(()) => {
                            self.state.status = AuthStatus::ProfileConfirmation;
                            self.state.error_message = None;
                        }
                        Err(err) => self.state.error_message = Some(err.to_string()),
                    }
                    self.state.profile = Some(profile);
                }
            }
            AuthEvent::EditProfileRequested => {
                if self.state.status == AuthStatus::ProfileConfirmation {
                    self.state.status = AuthStatus::Onboarding;
                }
            }
            AuthEvent::ProfileConfirmed => {
                if self.state.status == AuthStatus::ProfileConfirmation {
                    if let Some(profile) = self.state.profile.clone() {
                        effects.push(AuthEffect::PersistProfile(profile));
                        effects.push(AuthEffect::MarkOnboardingComplete);
                        self.request_permissions(&mut effects);
                    }
                }
            }
            AuthEvent::PermissionsResolved(status) => self.on_permissions(status, &mut effects),
            AuthEvent::RetryPermissions => {
                if matches!(
                    self.state.status,
                    AuthStatus::PermissionsDenied | AuthStatus::PermissionsUnavailable
                ) {
                    self.request_permissions(&mut effects);
                }
            }
            AuthEvent::SignOutRequested => {
                if self.state.status == AuthStatus::EmailVerificationPending {
                    self.leave_verification(&mut effects);
                }
                effects.push(AuthEffect::ClearSession);
                self.state = AuthState::signed_out();
            }
        }

        AuthTransition {
            state: self.state.clone(),
            effects,
        }
    }

    fn accepts_credentials(&self) -> bool {
        matches!(
            self.state.status,
            AuthStatus::Unauthenticated | AuthStatus::Error
        )
    }

    fn fail(&mut self, message: String) {
        self.state.status = AuthStatus::Error;
        self.state.error_message = Some(message);
    }

    fn on_session(&mut self, session: AuthSession, effects: &mut Vec<AuthEffect>) {
        if !matches!(
            self.state.status,
            AuthStatus::Unauthenticated | AuthStatus::Authenticating | AuthStatus::Error
        ) {
            return;
        }

        self.state.user_id = Some(session.user_id.clone());
        self.state.email = Some(session.email.clone());
        self.state.error_message = None;
        self.state.profile = Some(session.profile.unwrap_or_else(|| {
            UserProfile::new(session.user_id.clone(), String::new(), session.email.clone())
        }));

        if !session.email_verified {
            self.state.status = AuthStatus::EmailVerificationPending;
            effects.push(AuthEffect::StartVerificationPolling {
                every: self.policy.verification_poll,
            });
            return;
        }

        self.enter_onboarding_or_permissions(session.onboarding_complete, effects);
    }

    fn enter_onboarding_or_permissions(
        &mut self,
        onboarding_complete: bool,
        effects: &mut Vec<AuthEffect>,
    ) {
        let caps = self.policy.capabilities;
        let complete = self
            .state
            .profile
            .as_ref()
            .map(|p| p.is_complete(&caps))
            .unwrap_or(false);

        if onboarding_complete && complete {
            self.state.status = AuthStatus::PermissionsPending;
            self.state.missing_fields.clear();
            effects.push(AuthEffect::CheckHealthPermissions);
        } else {
            self.state.status = AuthStatus::Onboarding;
            self.state.missing_fields = self
                .state
                .profile
                .as_ref()
                .map(|p| {
                    p.missing_fields(&caps)
                        .into_iter()
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
        }
    }

    fn leave_verification(&mut self, effects: &mut Vec<AuthEffect>) {
        effects.push(AuthEffect::StopVerificationPolling);
        if !self.state.can_resend_verification {
            effects.push(AuthEffect::CancelResendCooldown);
            self.state.can_resend_verification = true;
        }
    }

    fn request_permissions(&mut self, effects: &mut Vec<AuthEffect>) {
        self.state.status = AuthStatus::PermissionsPending;
        self.state.permission_status = Some(HealthPermissionStatus::PromptingUser);
        self.state.error_message = None;
        effects.push(AuthEffect::RequestHealthPermissions {
            identifiers: ONBOARDING_PERMISSIONS.iter().map(|s| s.to_string()).collect(),
        });
    }

    fn on_permissions(&mut self, status: HealthPermissionStatus, effects: &mut Vec<AuthEffect>) {
        if !matches!(
            self.state.status,
            AuthStatus::PermissionsPending
                | AuthStatus::PermissionsDenied
                | AuthStatus::PermissionsUnavailable
                | AuthStatus::Ready
        ) {
            return;
        }

        let was_ready = self.state.status == AuthStatus::Ready;
        self.state.permission_status = Some(status);

        match status {
            HealthPermissionStatus::Granted | HealthPermissionStatus::PartiallyGranted => {
                self.state.status = AuthStatus::Ready;
                self.state.error_message = None;
                if !was_ready {
                    effects.push(AuthEffect::BeginQuickSync);
                }
            }
            HealthPermissionStatus::Denied => {
                self.state.status = AuthStatus::PermissionsDenied;
                self.state.error_message = Some(
                    "Health access was declined. You can grant it from settings at any time."
                        .to_string(),
                );
            }
            HealthPermissionStatus::Unavailable => {
                self.state.status = AuthStatus::PermissionsUnavailable;
                self.state.error_message = Some(format!(
                    "{} is not available on this device.",
                    self.policy.capabilities.health_service
                ));
            }
            HealthPermissionStatus::PromptingUser => {
                self.state.status = AuthStatus::PermissionsPending;
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ActivityLevel, Gender};

    fn session(verified: bool, onboarded: bool) -> AuthSession {
        AuthSession {
            user_id: "u-1".to_string(),
            email: "ada@example.com".to_string(),
            email_verified: verified,
            profile: onboarded.then(full_profile),
            onboarding_complete: onboarded,
        }
    }

    fn full_profile() -> UserProfile {
        UserProfile {
            age: Some(36),
            gender: Some(Gender::Female),
            height_cm: Some(168.0),
            weight_kg: Some(61.5),
            activity_level: Some(ActivityLevel::Active),
            ..UserProfile::new("u-1", "Ada", "ada@example.com")
        }
    }

    fn machine(caps: PlatformCapabilities) -> AuthMachine {
        AuthMachine::new(AuthPolicy::for_capabilities(caps))
    }

    #[test]
    fn test_invalid_credentials_make_no_request() {
        let mut auth = machine(PlatformCapabilities::android());
        let t = auth.handle(AuthEvent::SignUpRequested {
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            password: "short".to_string(),
        });
        assert!(t.effects.is_empty());
        assert_eq!(t.state.status, AuthStatus::Error);
        assert!(t.state.error_message.unwrap().contains("password"));
    }

    #[test]
    fn test_unverified_email_starts_polling() {
        let mut auth = machine(PlatformCapabilities::android());
        auth.handle(AuthEvent::SignInRequested {
            email: "ada@example.com".to_string(),
            password: "secret-pass".to_string(),
        });
        let t = auth.handle(AuthEvent::AuthSucceeded(session(false, false)));
        assert_eq!(t.state.status, AuthStatus::EmailVerificationPending);
        assert_eq!(
            t.effects,
            vec![AuthEffect::StartVerificationPolling {
                every: Duration::from_secs(5)
            }]
        );

        let t = auth.handle(AuthEvent::VerificationPollTick);
        assert_eq!(t.effects, vec![AuthEffect::CheckEmailVerified]);
    }

    #[test]
    fn test_resend_cooldown() {
        let mut auth = machine(PlatformCapabilities::ios());
        auth.handle(AuthEvent::AuthSucceeded(session(false, false)));

        let t = auth.handle(AuthEvent::ResendVerificationRequested);
        assert!(t.effects.contains(&AuthEffect::SendVerificationEmail));
        assert!(!t.state.can_resend_verification);

        let t = auth.handle(AuthEvent::ResendVerificationRequested);
        assert!(t.effects.is_empty());

        auth.handle(AuthEvent::ResendCooldownElapsed);
        let t = auth.handle(AuthEvent::ResendVerificationRequested);
        assert!(t.effects.contains(&AuthEffect::SendVerificationEmail));
    }

    #[test]
    fn test_verification_stops_timers() {
        let mut auth = machine(PlatformCapabilities::ios());
        auth.handle(AuthEvent::AuthSucceeded(session(false, false)));
        auth.handle(AuthEvent::ResendVerificationRequested);

        let t = auth.handle(AuthEvent::EmailVerificationChecked { verified: true });
        assert!(t.effects.contains(&AuthEffect::StopVerificationPolling));
        assert!(t.effects.contains(&AuthEffect::CancelResendCooldown));
        assert_eq!(t.state.status, AuthStatus::Onboarding);
    }

    #[test]
    fn test_android_onboarding_requires_health_fields() {
        let mut auth = machine(PlatformCapabilities::android());
        auth.handle(AuthEvent::AuthSucceeded(session(true, false)));

        let t = auth.handle(AuthEvent::ProfileSubmitted(UserProfile::new(
            "", "Ada", "ada@example.com",
        )));
        assert_eq!(t.state.status, AuthStatus::Onboarding);
        assert!(t.state.missing_fields.contains(&"weight".to_string()));

        let t = auth.handle(AuthEvent::ProfileSubmitted(full_profile()));
        assert_eq!(t.state.status, AuthStatus::ProfileConfirmation);
    }

    #[test]
    fn test_ios_onboarding_needs_name_and_email_only() {
        let mut auth = machine(PlatformCapabilities::ios());
        auth.handle(AuthEvent::AuthSucceeded(session(true, false)));
        let t = auth.handle(AuthEvent::ProfileSubmitted(UserProfile::new(
            "", "Ada", "ada@example.com",
        )));
        assert_eq!(t.state.status, AuthStatus::ProfileConfirmation);
        assert_eq!(t.state.profile.unwrap().user_id, "u-1");
    }

    #[test]
    fn test_confirmation_requests_permissions() {
        let mut auth = machine(PlatformCapabilities::android());
        auth.handle(AuthEvent::AuthSucceeded(session(true, false)));
        auth.handle(AuthEvent::ProfileSubmitted(full_profile()));
        let t = auth.handle(AuthEvent::ProfileConfirmed);

        assert_eq!(t.state.status, AuthStatus::PermissionsPending);
        assert!(matches!(t.effects[0], AuthEffect::PersistProfile(_)));
        assert!(t.effects.contains(&AuthEffect::MarkOnboardingComplete));
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, AuthEffect::RequestHealthPermissions { .. })));
    }

    #[test]
    fn test_permission_outcomes() {
        let mut auth = machine(PlatformCapabilities::android());
        auth.handle(AuthEvent::AuthSucceeded(session(true, true)));

        let t = auth.handle(AuthEvent::PermissionsResolved(HealthPermissionStatus::Denied));
        assert_eq!(t.state.status, AuthStatus::PermissionsDenied);

        let t = auth.handle(AuthEvent::RetryPermissions);
        assert_eq!(t.state.status, AuthStatus::PermissionsPending);

        let t = auth.handle(AuthEvent::PermissionsResolved(
            HealthPermissionStatus::PartiallyGranted,
        ));
        assert_eq!(t.state.status, AuthStatus::Ready);
        assert_eq!(t.effects, vec![AuthEffect::BeginQuickSync]);
    }

    #[test]
    fn test_unavailable_is_its_own_state() {
        let mut auth = machine(PlatformCapabilities::android());
        auth.handle(AuthEvent::AuthSucceeded(session(true, true)));
        let t = auth.handle(AuthEvent::PermissionsResolved(
            HealthPermissionStatus::Unavailable,
        ));
        assert_eq!(t.state.status, AuthStatus::PermissionsUnavailable);
        assert!(t.state.error_message.unwrap().contains("Health Connect"));
    }

    #[test]
    fn test_sign_out_clears_state() {
        let mut auth = machine(PlatformCapabilities::ios());
        auth.handle(AuthEvent::AuthSucceeded(session(false, false)));
        let t = auth.handle(AuthEvent::SignOutRequested);
        assert_eq!(t.state, AuthState::signed_out());
        assert!(t.effects.contains(&AuthEffect::StopVerificationPolling));
        assert!(t.effects.contains(&AuthEffect::ClearSession));
    }
}
