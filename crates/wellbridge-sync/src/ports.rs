//! # Collaborator Ports
//!
//! Traits for everything the runtime talks to but does not own: the hub, the
//! native health SDK, local storage, the browser and the clock. Production
//! adapters live next to this module (`hub_client`, `realtime`), simulated
//! ones in `simulated`.
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │ HubApi / AuthApi │     │NativeHealthPlat. │     │  KeyValueStore   │
//! │  HubClient       │     │  (Health Connect │     │  Preference-     │
//! │  SimulatedHub    │     │   / HealthKit)   │     │  Repository,     │
//! └──────────────────┘     └──────────────────┘     │  MemoryStore     │
//!                                                    └──────────────────┘
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use wellbridge_core::auth::AuthSession;
use wellbridge_core::connection::ValidationSignal;
use wellbridge_core::permission::ServiceAvailability;
use wellbridge_core::token::ReconnectCode;
use wellbridge_core::{HealthPermission, Platform, SyncPhase, UserProfile};
use wellbridge_db::{PrefValue, PreferenceRepository};

use crate::error::BridgeResult;
use crate::permissions::PermissionReply;

// =============================================================================
// Hub Types
// =============================================================================

/// Who is asking the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
}

/// A freshly issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    /// Hub-side expiry; the configured TTL applies when absent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of redeeming a `userId/token` code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemedCode {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// One normalized health sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub kind: HealthPermission,
    pub value: f64,
    pub unit: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Hub-side analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub job_id: String,
}

/// State of a hub-side analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Complete {
        #[serde(default)]
        summary: Option<String>,
    },
    Failed {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Hub-side view of a connection token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TokenValidation {
    Pending,
    #[serde(rename_all = "camelCase")]
    Validated {
        #[serde(default)]
        device_name: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Rejected {
        #[serde(default)]
        message: Option<String>,
    },
}

impl TokenValidation {
    /// The equivalent realtime signal, once the web side has answered.
    pub fn into_signal(self, token: &str) -> Option<ValidationSignal> {
        match self {
            TokenValidation::Pending => None,
            TokenValidation::Validated {
                device_name,
                session_id,
            } => Some(ValidationSignal {
                token: token.to_string(),
                success: true,
                device_name,
                session_id,
                message: None,
            }),
            TokenValidation::Rejected { message } => Some(ValidationSignal {
                token: token.to_string(),
                success: false,
                device_name: None,
                session_id: None,
                message,
            }),
        }
    }
}

// =============================================================================
// Hub Ports
// =============================================================================

/// Device-facing hub endpoints.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Issues a new connection token for this device.
    async fn generate_token(&self, device: &DeviceIdentity) -> BridgeResult<IssuedToken>;

    /// Links the device using a manually entered code.
    async fn redeem_code(
        &self,
        code: &ReconnectCode,
        device: &DeviceIdentity,
    ) -> BridgeResult<RedeemedCode>;

    /// Whether the web side has validated `token` yet.
    async fn validation_status(&self, token: &str) -> BridgeResult<TokenValidation>;

    /// Uploads one batch; returns how many records the hub accepted.
    async fn upload_batch(&self, phase: SyncPhase, records: &[HealthRecord]) -> BridgeResult<u64>;

    /// Starts the hub-side analysis for a finished upload.
    async fn request_analysis(&self, phase: SyncPhase) -> BridgeResult<AnalysisJob>;

    async fn analysis_status(&self, job: &AnalysisJob) -> BridgeResult<AnalysisStatus>;
}

/// Account endpoints used by the auth flow.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> BridgeResult<AuthSession>;

    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BridgeResult<AuthSession>;

    /// The session restored from a previous run, if any.
    async fn current_session(&self) -> BridgeResult<Option<AuthSession>>;

    async fn is_email_verified(&self) -> BridgeResult<bool>;

    async fn send_verification_email(&self) -> BridgeResult<()>;

    async fn save_profile(&self, profile: &UserProfile) -> BridgeResult<()>;

    async fn sign_out(&self) -> BridgeResult<()>;
}

// =============================================================================
// Native Health Platform
// =============================================================================

/// The native health SDK beneath the permission bridge.
///
/// The interactive request is callback based: the platform keeps `reply`
/// and resolves it when the system dialog closes. Returning an error means
/// the dialog could not be launched at all.
#[async_trait]
pub trait NativeHealthPlatform: Send + Sync {
    async fn availability(&self) -> BridgeResult<ServiceAvailability>;

    /// Currently granted permissions. No side effects.
    async fn granted_permissions(&self) -> BridgeResult<BTreeSet<HealthPermission>>;

    fn launch_permission_request(
        &self,
        permissions: &BTreeSet<HealthPermission>,
        reply: PermissionReply,
    ) -> BridgeResult<()>;

    /// Opens the platform health settings page.
    async fn open_settings(&self) -> BridgeResult<()>;

    async fn read_records(
        &self,
        permissions: &BTreeSet<HealthPermission>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BridgeResult<Vec<HealthRecord>>;
}

// =============================================================================
// Local Storage
// =============================================================================

/// Typed key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> BridgeResult<Option<PrefValue>>;

    async fn set(&self, key: &str, value: PrefValue) -> BridgeResult<()>;

    /// Idempotent.
    async fn remove(&self, key: &str) -> BridgeResult<()>;

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.get(key).await?.and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn get_int(&self, key: &str) -> BridgeResult<Option<i64>> {
        Ok(self.get(key).await?.and_then(|v| v.as_int()))
    }

    async fn get_double(&self, key: &str) -> BridgeResult<Option<f64>> {
        Ok(self.get(key).await?.and_then(|v| v.as_double()))
    }

    async fn get_bool(&self, key: &str) -> BridgeResult<Option<bool>> {
        Ok(self.get(key).await?.and_then(|v| v.as_bool()))
    }

    async fn remove_all(&self, keys: &[&str]) -> BridgeResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PreferenceRepository {
    async fn get(&self, key: &str) -> BridgeResult<Option<PrefValue>> {
        Ok(PreferenceRepository::get(self, key).await?)
    }

    async fn set(&self, key: &str, value: PrefValue) -> BridgeResult<()> {
        Ok(PreferenceRepository::set(self, key, value).await?)
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        Ok(PreferenceRepository::remove(self, key).await?)
    }

    async fn remove_all(&self, keys: &[&str]) -> BridgeResult<()> {
        Ok(PreferenceRepository::remove_all(self, keys).await?)
    }
}

// =============================================================================
// Browser & Clock
// =============================================================================

/// Opens URLs in an external browser.
#[async_trait]
pub trait UrlLauncher: Send + Sync {
    async fn open(&self, url: &Url) -> BridgeResult<()>;
}

/// Wall clock used for token expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
