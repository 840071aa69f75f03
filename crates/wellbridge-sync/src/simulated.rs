//! # Simulated Collaborators
//!
//! In-process stand-ins for the hub, the native health SDK, storage, the
//! clock, the realtime channel and the browser. Used by the CLI's
//! `--simulate` mode and by tests. Everything is deterministic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use wellbridge_core::auth::AuthSession;
use wellbridge_core::connection::ValidationSignal;
use wellbridge_core::permission::ServiceAvailability;
use wellbridge_core::token::ReconnectCode;
use wellbridge_core::{HealthPermission, SyncPhase, UserProfile};
use wellbridge_db::PrefValue;

use crate::error::{BridgeError, BridgeResult};
use crate::permissions::PermissionReply;
use crate::ports::{
    AnalysisJob, AnalysisStatus, AuthApi, Clock, DeviceIdentity, HealthRecord, HubApi,
    IssuedToken, KeyValueStore, NativeHealthPlatform, RedeemedCode, TokenValidation,
    UrlLauncher,
};
use crate::realtime::{RealtimeChannel, RealtimeSubscription, RealtimeUpdate};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Debug, Clone)]
struct Account {
    password: String,
    session: AuthSession,
}

#[derive(Debug, Default)]
struct HubState {
    token_failures: VecDeque<BridgeError>,
    redeem_failures: VecDeque<BridgeError>,
    upload_failures: VecDeque<bool>,
    upload_delay: Option<Duration>,
    uploaded: u64,
    analysis_fails: bool,
    token_expiry: Option<DateTime<Utc>>,
    redeemed_device_name: Option<String>,
    validations: HashMap<String, TokenValidation>,
    accounts: HashMap<String, Account>,
    signed_in: Option<String>,
}

/// Scriptable hub.
#[derive(Debug, Default)]
pub struct SimulatedHub {
    state: Mutex<HubState>,
    token_calls: AtomicUsize,
    redeem_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    analysis_calls: AtomicUsize,
    validation_polls: AtomicUsize,
}

impl SimulatedHub {
    pub fn new() -> Self {
        SimulatedHub::default()
    }

    /// The next `generate_token` call fails with `error`.
    pub fn fail_next_token(&self, error: BridgeError) {
        lock(&self.state).token_failures.push_back(error);
    }

    /// The next `redeem_code` call fails with `error`.
    pub fn fail_next_redeem(&self, error: BridgeError) {
        lock(&self.state).redeem_failures.push_back(error);
    }

    /// The next `count` uploads fail; `retryable` picks a 503 over a 400.
    pub fn fail_uploads(&self, count: usize, retryable: bool) {
        let mut state = lock(&self.state);
        state.upload_failures.extend(std::iter::repeat(retryable).take(count));
    }

    /// Each upload takes this long.
    pub fn set_upload_delay(&self, delay: Duration) {
        lock(&self.state).upload_delay = Some(delay);
    }

    pub fn fail_analysis(&self) {
        lock(&self.state).analysis_fails = true;
    }

    /// Expiry the hub reports for new tokens.
    pub fn set_token_expiry(&self, expires_at: Option<DateTime<Utc>>) {
        lock(&self.state).token_expiry = expires_at;
    }

    pub fn set_redeemed_device_name(&self, name: impl Into<String>) {
        lock(&self.state).redeemed_device_name = Some(name.into());
    }

    /// What `validation_status` reports for `token` from now on.
    pub fn set_validation(&self, token: &str, validation: TokenValidation) {
        lock(&self.state)
            .validations
            .insert(token.to_string(), validation);
    }

    pub fn validation_polls(&self) -> usize {
        self.validation_polls.load(Ordering::SeqCst)
    }

    pub fn add_account(&self, email: &str, password: &str, verified: bool) {
        let session = AuthSession {
            user_id: format!("user-{}", lock(&self.state).accounts.len() + 1),
            email: email.to_string(),
            email_verified: verified,
            profile: None,
            onboarding_complete: false,
        };
        lock(&self.state).accounts.insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                session,
            },
        );
    }

    /// Marks the account's email verified, as if the link was clicked.
    pub fn verify_email(&self, email: &str) {
        if let Some(account) = lock(&self.state).accounts.get_mut(&email.to_lowercase()) {
            account.session.email_verified = true;
        }
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn redeem_calls(&self) -> usize {
        self.redeem_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn analysis_calls(&self) -> usize {
        self.analysis_calls.load(Ordering::SeqCst)
    }

    /// Every call that would have crossed the network.
    pub fn network_calls(&self) -> usize {
        self.token_calls()
            + self.redeem_calls()
            + self.upload_calls()
            + self.analysis_calls()
            + self.validation_polls()
    }

    /// Records accepted so far.
    pub fn uploaded(&self) -> u64 {
        lock(&self.state).uploaded
    }

    fn signed_in_account(&self) -> BridgeResult<Account> {
        let state = lock(&self.state);
        state
            .signed_in
            .as_ref()
            .and_then(|email| state.accounts.get(email))
            .cloned()
            .ok_or_else(|| BridgeError::Server {
                status: 401,
                message: "not signed in".into(),
            })
    }
}

#[async_trait]
impl HubApi for SimulatedHub {
    async fn generate_token(&self, device: &DeviceIdentity) -> BridgeResult<IssuedToken> {
        let call = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = lock(&self.state);
        if let Some(error) = state.token_failures.pop_front() {
            return Err(error);
        }
        debug!(device_id = %device.device_id, call, "Simulated token issued");
        Ok(IssuedToken {
            token: format!("TKN{:05}", call),
            expires_at: state.token_expiry.take(),
        })
    }

    async fn redeem_code(
        &self,
        code: &ReconnectCode,
        _device: &DeviceIdentity,
    ) -> BridgeResult<RedeemedCode> {
        self.redeem_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(error) = state.redeem_failures.pop_front() {
            return Err(error);
        }
        Ok(RedeemedCode {
            device_name: state.redeemed_device_name.clone(),
            session_id: Some(format!("sess-{}", code.user_id)),
        })
    }

    async fn validation_status(&self, token: &str) -> BridgeResult<TokenValidation> {
        self.validation_polls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state)
            .validations
            .get(token)
            .cloned()
            .unwrap_or(TokenValidation::Pending))
    }

    async fn upload_batch(&self, _phase: SyncPhase, records: &[HealthRecord]) -> BridgeResult<u64> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let mut state = lock(&self.state);
            (state.upload_failures.pop_front(), state.upload_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(true) => Err(BridgeError::Server {
                status: 503,
                message: "hub busy".into(),
            }),
            Some(false) => Err(BridgeError::Server {
                status: 400,
                message: "batch rejected".into(),
            }),
            None => {
                let accepted = records.len() as u64;
                lock(&self.state).uploaded += accepted;
                Ok(accepted)
            }
        }
    }

    async fn request_analysis(&self, phase: SyncPhase) -> BridgeResult<AnalysisJob> {
        let call = self.analysis_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AnalysisJob {
            job_id: format!("{}-{}", phase, call),
        })
    }

    async fn analysis_status(&self, job: &AnalysisJob) -> BridgeResult<AnalysisStatus> {
        if lock(&self.state).analysis_fails {
            return Ok(AnalysisStatus::Failed {
                message: Some("model unavailable".into()),
            });
        }
        Ok(AnalysisStatus::Complete {
            summary: Some(format!("analysis {} ready", job.job_id)),
        })
    }
}

#[async_trait]
impl AuthApi for SimulatedHub {
    async fn sign_in(&self, email: &str, password: &str) -> BridgeResult<AuthSession> {
        let key = email.to_lowercase();
        let mut state = lock(&self.state);
        let account = state
            .accounts
            .get(&key)
            .filter(|a| a.password == password)
            .cloned()
            .ok_or_else(|| BridgeError::Server {
                status: 401,
                message: "Invalid email or password".into(),
            })?;
        state.signed_in = Some(key);
        Ok(account.session)
    }

    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BridgeResult<AuthSession> {
        if lock(&self.state).accounts.contains_key(&email.to_lowercase()) {
            return Err(BridgeError::Server {
                status: 409,
                message: "An account with this email already exists".into(),
            });
        }
        self.add_account(email, password, false);
        let mut state = lock(&self.state);
        let key = email.to_lowercase();
        let account = state.accounts.get_mut(&key).ok_or_else(|| {
            BridgeError::Internal("account vanished after sign-up".into())
        })?;
        account.session.profile = Some(UserProfile::new(
            account.session.user_id.clone(),
            name,
            email,
        ));
        let session = account.session.clone();
        state.signed_in = Some(key);
        Ok(session)
    }

    async fn current_session(&self) -> BridgeResult<Option<AuthSession>> {
        Ok(self.signed_in_account().ok().map(|a| a.session))
    }

    async fn is_email_verified(&self) -> BridgeResult<bool> {
        Ok(self.signed_in_account()?.session.email_verified)
    }

    async fn send_verification_email(&self) -> BridgeResult<()> {
        let account = self.signed_in_account()?;
        info!(email = %account.session.email, "Simulated verification email sent");
        Ok(())
    }

    async fn save_profile(&self, profile: &UserProfile) -> BridgeResult<()> {
        let account = self.signed_in_account()?;
        let mut state = lock(&self.state);
        if let Some(stored) = state.accounts.get_mut(&account.session.email.to_lowercase()) {
            stored.session.profile = Some(profile.clone());
            stored.session.onboarding_complete = true;
        }
        Ok(())
    }

    async fn sign_out(&self) -> BridgeResult<()> {
        lock(&self.state).signed_in = None;
        Ok(())
    }
}

// =============================================================================
// Health Platform
// =============================================================================

/// How the simulated system dialog answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionScript {
    /// Grants everything requested.
    GrantAll,
    /// Grants the requested types that are also in this set.
    Grant(BTreeSet<HealthPermission>),
    /// Grants nothing.
    Deny,
    /// The dialog cannot be shown.
    LaunchFails,
    /// Waits for [`SimulatedHealthPlatform::resolve_pending`].
    Hold,
}

#[derive(Debug)]
struct PlatformState {
    availability: ServiceAvailability,
    granted: BTreeSet<HealthPermission>,
    script: PermissionScript,
    settings_grants: BTreeSet<HealthPermission>,
    pending: Option<(BTreeSet<HealthPermission>, PermissionReply)>,
    last_requested: Option<BTreeSet<HealthPermission>>,
    requests: usize,
    settings_opened: usize,
}

/// Scriptable Health Connect / HealthKit.
#[derive(Debug)]
pub struct SimulatedHealthPlatform {
    state: Mutex<PlatformState>,
}

impl Default for SimulatedHealthPlatform {
    fn default() -> Self {
        SimulatedHealthPlatform::new()
    }
}

impl SimulatedHealthPlatform {
    /// Available, nothing granted, dialog grants everything.
    pub fn new() -> Self {
        SimulatedHealthPlatform {
            state: Mutex::new(PlatformState {
                availability: ServiceAvailability::available(),
                granted: BTreeSet::new(),
                script: PermissionScript::GrantAll,
                settings_grants: BTreeSet::new(),
                pending: None,
                last_requested: None,
                requests: 0,
                settings_opened: 0,
            }),
        }
    }

    pub fn set_availability(&self, availability: ServiceAvailability) {
        lock(&self.state).availability = availability;
    }

    pub fn set_granted(&self, granted: impl IntoIterator<Item = HealthPermission>) {
        lock(&self.state).granted = granted.into_iter().collect();
    }

    pub fn granted(&self) -> BTreeSet<HealthPermission> {
        lock(&self.state).granted.clone()
    }

    pub fn script(&self, script: PermissionScript) {
        lock(&self.state).script = script;
    }

    /// Grants applied when the user "visits" settings.
    pub fn grant_in_settings(&self, grants: impl IntoIterator<Item = HealthPermission>) {
        lock(&self.state).settings_grants = grants.into_iter().collect();
    }

    /// Answers a held dialog. Returns false if none is pending.
    pub fn resolve_pending(&self, grant: bool) -> bool {
        let pending = lock(&self.state).pending.take();
        match pending {
            Some((requested, reply)) => {
                if grant {
                    lock(&self.state).granted.extend(requested);
                }
                reply.resolve(grant);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    pub fn last_requested(&self) -> Option<BTreeSet<HealthPermission>> {
        lock(&self.state).last_requested.clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.state).requests
    }

    pub fn settings_opened(&self) -> usize {
        lock(&self.state).settings_opened
    }

    /// Deterministic sample value per type.
    fn sample(kind: HealthPermission, day: i64) -> (f64, &'static str) {
        let wobble = (day % 7) as f64;
        match kind {
            HealthPermission::Steps => (6000.0 + 250.0 * wobble, "count"),
            HealthPermission::Weight => (70.0 + 0.1 * wobble, "kg"),
            HealthPermission::Height => (175.0, "cm"),
            HealthPermission::SleepAsleep => (420.0 + 5.0 * wobble, "min"),
            HealthPermission::HeartRate => (72.0 + wobble, "bpm"),
            HealthPermission::RestingHeartRate => (60.0 + wobble, "bpm"),
            HealthPermission::HeartRateVariability => (45.0 + wobble, "ms"),
            HealthPermission::BodyFat => (18.0 + 0.1 * wobble, "%"),
            HealthPermission::OxygenSaturation => (97.0, "%"),
            HealthPermission::ExerciseSession => (30.0 + wobble, "min"),
            HealthPermission::Distance => (4200.0 + 100.0 * wobble, "m"),
            HealthPermission::ActiveCaloriesBurned => (400.0 + 10.0 * wobble, "kcal"),
            HealthPermission::TotalCaloriesBurned => (2200.0 + 10.0 * wobble, "kcal"),
        }
    }
}

#[async_trait]
impl NativeHealthPlatform for SimulatedHealthPlatform {
    async fn availability(&self) -> BridgeResult<ServiceAvailability> {
        Ok(lock(&self.state).availability)
    }

    async fn granted_permissions(&self) -> BridgeResult<BTreeSet<HealthPermission>> {
        Ok(lock(&self.state).granted.clone())
    }

    fn launch_permission_request(
        &self,
        permissions: &BTreeSet<HealthPermission>,
        reply: PermissionReply,
    ) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        state.requests += 1;
        state.last_requested = Some(permissions.clone());

        match state.script.clone() {
            PermissionScript::GrantAll => {
                state.granted.extend(permissions.iter().copied());
                drop(state);
                reply.resolve(true);
            }
            PermissionScript::Grant(allowed) => {
                state
                    .granted
                    .extend(permissions.intersection(&allowed).copied());
                drop(state);
                reply.resolve(true);
            }
            PermissionScript::Deny => {
                drop(state);
                reply.resolve(false);
            }
            PermissionScript::LaunchFails => {
                return Err(BridgeError::Platform("permission activity not found".into()))
            }
            PermissionScript::Hold => {
                state.pending = Some((permissions.clone(), reply));
            }
        }
        Ok(())
    }

    async fn open_settings(&self) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        state.settings_opened += 1;
        let grants = state.settings_grants.clone();
        state.granted.extend(grants);
        Ok(())
    }

    async fn read_records(
        &self,
        permissions: &BTreeSet<HealthPermission>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BridgeResult<Vec<HealthRecord>> {
        let granted = lock(&self.state).granted.clone();
        let days = (to - from).num_days().max(0);
        let mut records = Vec::new();
        for kind in permissions.intersection(&granted) {
            for day in 0..days {
                let start = from + chrono::Duration::days(day);
                let (value, unit) = Self::sample(*kind, day);
                records.push(HealthRecord {
                    kind: *kind,
                    value,
                    unit: unit.to_string(),
                    start,
                    end: start + chrono::Duration::hours(1),
                    source: Some("simulated".into()),
                });
            }
        }
        Ok(records)
    }
}

// =============================================================================
// Storage & Clock
// =============================================================================

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, PrefValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<PrefValue>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    async fn set(&self, key: &str, value: PrefValue) -> BridgeResult<()> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// =============================================================================
// Realtime & Browser
// =============================================================================

/// Realtime channel driven by the test or the CLI.
#[derive(Debug, Default)]
pub struct SimulatedRealtime {
    subscribers: Mutex<Vec<(String, mpsc::Sender<RealtimeUpdate>)>>,
}

impl SimulatedRealtime {
    pub fn new() -> Self {
        SimulatedRealtime::default()
    }

    /// Tokens with a live subscriber.
    pub fn subscribed_tokens(&self) -> Vec<String> {
        lock(&self.subscribers)
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(token, _)| token.clone())
            .collect()
    }

    /// Delivers `signal` to every live subscriber. Returns how many got it.
    pub async fn push_validation(&self, signal: ValidationSignal) -> usize {
        let targets: Vec<_> = lock(&self.subscribers)
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(_, tx)| tx.clone())
            .collect();
        let mut delivered = 0;
        for tx in targets {
            if tx.send(RealtimeUpdate::Validation(signal.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Confirms `token` as the web side would.
    pub async fn validate(&self, token: &str, device_name: &str) -> usize {
        self.push_validation(ValidationSignal {
            token: token.to_string(),
            success: true,
            device_name: Some(device_name.to_string()),
            session_id: Some(format!("sess-{}", token)),
            message: None,
        })
        .await
    }
}

impl RealtimeChannel for SimulatedRealtime {
    fn subscribe(&self, token: &str, updates: mpsc::Sender<RealtimeUpdate>) -> RealtimeSubscription {
        let _ = updates.try_send(RealtimeUpdate::Status(
            wellbridge_core::connection::RealtimeStatus::Subscribed,
        ));
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.push((token.to_string(), updates));
        RealtimeSubscription::detached()
    }
}

/// Records opened URLs instead of launching a browser.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    opened: Mutex<Vec<Url>>,
    fail_primary: Mutex<Option<String>>,
    fail_all: std::sync::atomic::AtomicBool,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        RecordingLauncher::default()
    }

    /// URLs starting with `prefix` fail to open.
    pub fn fail_primary(&self, prefix: impl Into<String>) {
        *lock(&self.fail_primary) = Some(prefix.into());
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Url> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl UrlLauncher for RecordingLauncher {
    async fn open(&self, url: &Url) -> BridgeResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(BridgeError::Platform("no browser available".into()));
        }
        if let Some(prefix) = lock(&self.fail_primary).as_deref() {
            if url.as_str().starts_with(prefix) {
                return Err(BridgeError::Platform(format!("cannot resolve {}", url)));
            }
        }
        lock(&self.opened).push(url.clone());
        Ok(())
    }
}
