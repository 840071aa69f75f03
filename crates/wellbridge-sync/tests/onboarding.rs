//! Sign-up, email verification, profile onboarding and the permission gate.

mod common;

use std::collections::BTreeSet;

use common::{within, Fixture};
use wellbridge_core::auth::{AuthState, AuthStatus};
use wellbridge_core::permission::PHYSICAL_ACTIVITY_PERMISSIONS;
use wellbridge_core::profile::{ActivityLevel, Gender};
use wellbridge_core::{HealthPermission, HealthPermissionStatus, Platform, UserProfile};
use wellbridge_db::keys;
use wellbridge_sync::ports::{AuthApi, KeyValueStore};
use wellbridge_sync::simulated::PermissionScript;
use wellbridge_sync::{AuthHandle, BridgeConfig};

const EMAIL: &str = "ada@example.com";
const PASSWORD: &str = "correct-horse-42";

fn config() -> BridgeConfig {
    let mut config = common::config();
    config.auth.verification_poll_secs = 1;
    config.auth.resend_cooldown_secs = 1;
    config
}

fn status_is(status: AuthStatus) -> impl Fn(&AuthState) -> bool {
    move |s| s.status == status
}

fn completed(mut profile: UserProfile) -> UserProfile {
    profile.age = Some(36);
    profile.gender = Some(Gender::Female);
    profile.height_cm = Some(168.0);
    profile.weight_kg = Some(61.5);
    profile.activity_level = Some(ActivityLevel::Active);
    profile
}

/// Signs in a verified account and walks through the profile screens.
async fn onboard(auth: &AuthHandle) -> AuthState {
    auth.sign_in(EMAIL, PASSWORD).await.unwrap();
    let state = within(auth.wait_for(status_is(AuthStatus::Onboarding))).await.unwrap();

    let profile = UserProfile::new("", "Ada Lovelace", EMAIL);
    let state_after_submit = auth.submit_profile(completed(profile)).await.unwrap();
    assert_eq!(state_after_submit.status, AuthStatus::ProfileConfirmation);
    assert_eq!(
        state_after_submit.profile.as_ref().map(|p| p.user_id.clone()),
        state.user_id
    );

    auth.confirm_profile().await.unwrap()
}

#[tokio::test]
async fn test_sign_up_through_ready() {
    let fx = Fixture::new();
    let bridge = fx.start(config()).await;
    let auth = &bridge.auth;
    assert_eq!(auth.state().status, AuthStatus::Unauthenticated);

    let state = auth.sign_up("Ada Lovelace", EMAIL, PASSWORD).await.unwrap();
    assert_eq!(state.status, AuthStatus::Authenticating);

    let state = within(auth.wait_for(status_is(AuthStatus::EmailVerificationPending)))
        .await
        .unwrap();
    assert_eq!(state.email.as_deref(), Some(EMAIL));

    fx.hub.verify_email(EMAIL);
    let state = within(auth.wait_for(status_is(AuthStatus::Onboarding))).await.unwrap();
    assert!(state.missing_fields.contains(&"age".to_string()));

    // Android needs the health fields before the profile can be confirmed.
    let profile = state.profile.clone().unwrap();
    let state = auth.submit_profile(profile.clone()).await.unwrap();
    assert_eq!(state.status, AuthStatus::Onboarding);
    assert!(state.error_message.is_some());

    let state = auth.submit_profile(completed(profile)).await.unwrap();
    assert_eq!(state.status, AuthStatus::ProfileConfirmation);

    // Going back keeps the draft.
    let state = auth.edit_profile().await.unwrap();
    assert_eq!(state.status, AuthStatus::Onboarding);
    let draft = state.profile.clone().unwrap();
    assert_eq!(draft.age, Some(36));
    let state = auth.submit_profile(draft).await.unwrap();
    assert_eq!(state.status, AuthStatus::ProfileConfirmation);

    let state = auth.confirm_profile().await.unwrap();
    assert_eq!(state.status, AuthStatus::PermissionsPending);

    let state = within(auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    assert_eq!(state.permission_status, Some(HealthPermissionStatus::Granted));

    let requested = fx.platform.last_requested().unwrap();
    assert!(requested.is_superset(&BTreeSet::from(PHYSICAL_ACTIVITY_PERMISSIONS)));

    // The quick sync starts on its own.
    common::wait_health(&bridge.health, |s| s.last_body_prep.is_some()).await;

    assert_eq!(fx.store.get_bool(keys::ONBOARDING_COMPLETE).await.unwrap(), Some(true));
    assert_eq!(fx.store.get_bool(keys::PROFILE_COMPLETE).await.unwrap(), Some(true));
    assert_eq!(
        fx.store.get_string(keys::PROFILE_NAME).await.unwrap().as_deref(),
        Some("Ada Lovelace")
    );
    assert_eq!(fx.store.get_int(keys::PROFILE_AGE).await.unwrap(), Some(36));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_resend_is_rate_limited() {
    let fx = Fixture::new();
    let bridge = fx.start(config()).await;
    let auth = &bridge.auth;

    auth.sign_up("Ada Lovelace", EMAIL, PASSWORD).await.unwrap();
    let state = within(auth.wait_for(status_is(AuthStatus::EmailVerificationPending)))
        .await
        .unwrap();
    assert!(state.can_resend_verification);

    let state = auth.resend_verification().await.unwrap();
    assert!(!state.can_resend_verification);

    within(auth.wait_for(|s| s.can_resend_verification)).await.unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_invalid_input_is_rejected_locally() {
    let fx = Fixture::new();
    let bridge = fx.start(config()).await;

    let state = bridge.auth.sign_in("not-an-email", PASSWORD).await.unwrap();
    assert_eq!(state.status, AuthStatus::Error);
    assert!(state.error_message.is_some());

    let state = bridge.auth.sign_up("Ada", EMAIL, "short").await.unwrap();
    assert_eq!(state.status, AuthStatus::Error);
    assert!(state.error_message.unwrap().contains("password"));

    assert!(fx.hub.current_session().await.unwrap().is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_shows_friendly_message() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    let bridge = fx.start(config()).await;

    bridge.auth.sign_in(EMAIL, "not-my-password").await.unwrap();
    let state = within(bridge.auth.wait_for(status_is(AuthStatus::Error)))
        .await
        .unwrap();
    assert_eq!(state.error_message.as_deref(), Some("Incorrect email or password."));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_denied_permissions_can_be_retried() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    fx.platform.script(PermissionScript::Deny);
    let bridge = fx.start(config()).await;

    let state = onboard(&bridge.auth).await;
    assert_eq!(state.status, AuthStatus::PermissionsPending);

    let state = within(bridge.auth.wait_for(status_is(AuthStatus::PermissionsDenied)))
        .await
        .unwrap();
    assert_eq!(state.permission_status, Some(HealthPermissionStatus::Denied));
    assert!(state.error_message.is_some());
    assert!(bridge.health.state().running.is_empty());

    fx.platform.script(PermissionScript::GrantAll);
    let state = bridge.auth.retry_permissions().await.unwrap();
    assert_eq!(state.status, AuthStatus::PermissionsPending);

    within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    assert_eq!(fx.platform.request_count(), 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_returning_user_skips_onboarding() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);

    let bridge = fx.start(config()).await;
    onboard(&bridge.auth).await;
    within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    within(async {
        loop {
            let session = fx.hub.current_session().await.unwrap().unwrap();
            if session.onboarding_complete {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await;
    bridge.shutdown().await;

    // Same hub session, fresh app start.
    let bridge = fx.start(config()).await;
    let state = within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    assert_eq!(state.email.as_deref(), Some(EMAIL));
    assert_eq!(fx.platform.request_count(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_sign_out_forgets_profile_but_not_welcome() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    let bridge = fx.start(config()).await;

    onboard(&bridge.auth).await;
    within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    fx.store
        .set(keys::WELCOME_SEEN, wellbridge_db::PrefValue::from(true))
        .await
        .unwrap();

    let state = bridge.auth.sign_out().await.unwrap();
    assert_eq!(state.status, AuthStatus::Unauthenticated);
    assert!(state.user_id.is_none());

    assert!(fx.store.get(keys::PROFILE_USER_ID).await.unwrap().is_none());
    assert_eq!(fx.store.get_bool(keys::ONBOARDING_COMPLETE).await.unwrap(), None);
    assert_eq!(fx.store.get_bool(keys::WELCOME_SEEN).await.unwrap(), Some(true));

    bridge.shutdown().await;
}

fn ios_config() -> BridgeConfig {
    let mut config = config();
    config.device.platform = Platform::Ios;
    config
}

#[tokio::test]
async fn test_ios_partial_dialog_is_partially_granted() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    fx.platform.script(PermissionScript::Grant(BTreeSet::from([
        HealthPermission::Weight,
        HealthPermission::Height,
    ])));
    let bridge = fx.start(ios_config()).await;

    onboard(&bridge.auth).await;
    let state = within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    assert_eq!(
        state.permission_status,
        Some(HealthPermissionStatus::PartiallyGranted)
    );

    let authorization = bridge.health.state().authorization.unwrap();
    assert_eq!(authorization.status, HealthPermissionStatus::PartiallyGranted);
    assert_eq!(
        authorization.granted,
        BTreeSet::from([HealthPermission::Weight, HealthPermission::Height])
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_ios_hidden_read_grants_are_assumed_after_dialog() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    // HealthKit completes the dialog without revealing any read grant.
    fx.platform.script(PermissionScript::Grant(BTreeSet::new()));
    let bridge = fx.start(ios_config()).await;

    onboard(&bridge.auth).await;
    let state = within(bridge.auth.wait_for(status_is(AuthStatus::Ready))).await.unwrap();
    assert_eq!(state.permission_status, Some(HealthPermissionStatus::Granted));
    assert!(fx.platform.granted().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_ios_denied_dialog_assumes_nothing() {
    let fx = Fixture::new();
    fx.hub.add_account(EMAIL, PASSWORD, true);
    fx.platform.script(PermissionScript::Deny);
    let bridge = fx.start(ios_config()).await;

    onboard(&bridge.auth).await;
    let state = within(bridge.auth.wait_for(status_is(AuthStatus::PermissionsDenied)))
        .await
        .unwrap();
    assert_eq!(state.permission_status, Some(HealthPermissionStatus::Denied));

    bridge.shutdown().await;
}
