//! # Bridge Configuration
//!
//! Configuration for the device identity, hub endpoints, handoff tuning and
//! sync batching.
//!
//! ## Load Order
//! ```text
//! defaults ──► bridge.toml (platform config dir) ──► WELLBRIDGE_* env vars
//! ```
//!
//! ## Example bridge.toml
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Ada's Pixel"
//! platform = "android"
//!
//! [hub]
//! api_url = "https://hub.wellbridge.app/api"
//! realtime_url = "wss://hub.wellbridge.app/realtime"
//! handoff_url = "https://hub.wellbridge.app/connect"
//! handoff_fallback_url = "https://wellbridge.app/connect"
//!
//! [connection]
//! token_ttl_minutes = 30
//! max_reconnect_attempts = 5
//!
//! [sync]
//! batch_size = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wellbridge_core::auth::AuthPolicy;
use wellbridge_core::connection::ConnectionPolicy;
use wellbridge_core::{Platform, PlatformCapabilities};

use crate::error::{BridgeError, BridgeResult};

// =============================================================================
// Device
// =============================================================================

/// Identity of this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device id sent with every handoff (UUID v4).
    #[serde(default = "generate_device_id")]
    pub id: String,

    /// Human-readable name offered to the hub.
    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default = "default_platform")]
    pub platform: Platform,
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    "Wellness Bridge device".to_string()
}

fn default_platform() -> Platform {
    Platform::Android
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: generate_device_id(),
            name: default_device_name(),
            platform: default_platform(),
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Wellness Hub endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSettings {
    /// REST API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Realtime validation channel (`ws://` or `wss://`).
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,

    /// Page opened in the browser to validate a token.
    #[serde(default = "default_handoff_url")]
    pub handoff_url: String,

    /// Used when the primary handoff page cannot be opened.
    #[serde(default = "default_handoff_fallback_url")]
    pub handoff_fallback_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://hub.wellbridge.app/api".to_string()
}
fn default_realtime_url() -> String {
    "wss://hub.wellbridge.app/realtime".to_string()
}
fn default_handoff_url() -> String {
    "https://hub.wellbridge.app/connect".to_string()
}
fn default_handoff_fallback_url() -> String {
    "https://wellbridge.app/connect".to_string()
}
fn default_request_timeout() -> u64 {
    15
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            api_url: default_api_url(),
            realtime_url: default_realtime_url(),
            handoff_url: default_handoff_url(),
            handoff_fallback_url: default_handoff_fallback_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl HubSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Handoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: i64,

    /// How long to wait for the web side before giving up.
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_true")]
    pub show_sync_intro: bool,

    #[serde(default = "default_token_group_size")]
    pub token_group_size: usize,
}

fn default_token_ttl() -> i64 {
    wellbridge_core::DEFAULT_TOKEN_TTL_MINUTES
}
fn default_validation_timeout() -> u64 {
    600
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_token_group_size() -> usize {
    wellbridge_core::DEFAULT_TOKEN_GROUP_SIZE
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            token_ttl_minutes: default_token_ttl(),
            validation_timeout_secs: default_validation_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            show_sync_intro: default_true(),
            token_group_size: default_token_group_size(),
        }
    }
}

impl ConnectionSettings {
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_ttl_minutes)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Policy for the pure connection machine.
    pub fn policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            max_reconnect_attempts: self.max_reconnect_attempts,
            initial_backoff: self.initial_backoff(),
            max_backoff: self.max_backoff(),
            show_sync_intro: self.show_sync_intro,
            token_group_size: self.token_group_size,
            ..ConnectionPolicy::default()
        }
    }
}

// =============================================================================
// Sync
// =============================================================================

/// Sync pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Window read by Body Prep.
    #[serde(default = "default_body_prep_window")]
    pub body_prep_window_days: i64,

    /// Window read by the Digital Twin backfill.
    #[serde(default = "default_digital_twin_days")]
    pub digital_twin_days: i64,

    /// Records per upload batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries per batch for retryable failures.
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,

    #[serde(default = "default_analysis_poll_interval")]
    pub analysis_poll_interval_secs: u64,

    /// Upper bound on waiting for the hub analysis.
    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout_secs: u64,
}

fn default_body_prep_window() -> i64 {
    7
}
fn default_digital_twin_days() -> i64 {
    wellbridge_core::DIGITAL_TWIN_DAYS
}
fn default_batch_size() -> usize {
    500
}
fn default_max_batch_retries() -> u32 {
    3
}
fn default_analysis_poll_interval() -> u64 {
    5
}
fn default_analysis_timeout() -> u64 {
    110
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            body_prep_window_days: default_body_prep_window(),
            digital_twin_days: default_digital_twin_days(),
            batch_size: default_batch_size(),
            max_batch_retries: default_max_batch_retries(),
            analysis_poll_interval_secs: default_analysis_poll_interval(),
            analysis_timeout_secs: default_analysis_timeout(),
        }
    }
}

impl SyncSettings {
    pub fn analysis_poll_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_poll_interval_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

// =============================================================================
// Permissions & Auth
// =============================================================================

/// Permission bridge tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// Settle time after opening settings before re-checking grants.
    #[serde(default = "default_settings_fallback_delay")]
    pub settings_fallback_delay_ms: u64,
}

fn default_settings_fallback_delay() -> u64 {
    3000
}

impl Default for PermissionSettings {
    fn default() -> Self {
        PermissionSettings {
            settings_fallback_delay_ms: default_settings_fallback_delay(),
        }
    }
}

impl PermissionSettings {
    pub fn settings_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.settings_fallback_delay_ms)
    }
}

/// Auth flow timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_verification_poll")]
    pub verification_poll_secs: u64,

    #[serde(default = "default_resend_cooldown")]
    pub resend_cooldown_secs: u64,
}

fn default_verification_poll() -> u64 {
    5
}
fn default_resend_cooldown() -> u64 {
    60
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            verification_poll_secs: default_verification_poll(),
            resend_cooldown_secs: default_resend_cooldown(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub permissions: PermissionSettings,

    #[serde(default)]
    pub auth: AuthSettings,
}

impl BridgeConfig {
    /// Creates a configuration with defaults and a fresh device id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file and environment.
    ///
    /// ## Loading Order
    /// 1. Defaults
    /// 2. `config_path`, or `bridge.toml` in the platform config dir
    /// 3. `WELLBRIDGE_*` environment variables
    pub fn load(config_path: Option<PathBuf>) -> BridgeResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading bridge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration, falling back to defaults on any error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(?e, "Failed to load bridge config, using defaults");
            Self::default()
        })
    }

    /// Writes the configuration as pretty TOML.
    pub fn save(&self, config_path: Option<PathBuf>) -> BridgeResult<PathBuf> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| BridgeError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| BridgeError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Bridge config saved");
        Ok(path)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(BridgeError::MissingDeviceId);
        }

        for (name, value) in [
            ("api_url", &self.hub.api_url),
            ("handoff_url", &self.hub.handoff_url),
            ("handoff_fallback_url", &self.hub.handoff_fallback_url),
        ] {
            check_scheme(name, value, &["http", "https"])?;
        }
        check_scheme("realtime_url", &self.hub.realtime_url, &["ws", "wss"])?;

        if self.sync.batch_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.connection.max_reconnect_attempts == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_reconnect_attempts must be greater than 0".into(),
            ));
        }

        if self.connection.token_ttl_minutes <= 0 {
            return Err(BridgeError::InvalidConfig(
                "token_ttl_minutes must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Applies `WELLBRIDGE_*` overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("WELLBRIDGE_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("WELLBRIDGE_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(platform) = std::env::var("WELLBRIDGE_PLATFORM") {
            match platform.parse() {
                Ok(parsed) => self.device.platform = parsed,
                Err(_) => warn!(platform = %platform, "Unknown platform in environment"),
            }
        }

        if let Ok(url) = std::env::var("WELLBRIDGE_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.hub.api_url = url;
        }

        if let Ok(url) = std::env::var("WELLBRIDGE_REALTIME_URL") {
            self.hub.realtime_url = url;
        }

        if let Ok(url) = std::env::var("WELLBRIDGE_HANDOFF_URL") {
            self.hub.handoff_url = url;
        }

        if let Ok(url) = std::env::var("WELLBRIDGE_HANDOFF_FALLBACK_URL") {
            self.hub.handoff_fallback_url = url;
        }

        if let Ok(size) = std::env::var("WELLBRIDGE_BATCH_SIZE") {
            if let Ok(n) = size.parse::<usize>() {
                self.sync.batch_size = n;
            }
        }

        if let Ok(show) = std::env::var("WELLBRIDGE_SHOW_SYNC_INTRO") {
            self.connection.show_sync_intro = show != "false" && show != "0";
        }
    }

    /// `bridge.toml` in the platform config directory.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "wellbridge", "bridge")
            .map(|dirs| dirs.config_dir().join("bridge.toml"))
    }

    /// `bridge.db` in the platform data directory.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "wellbridge", "bridge")
            .map(|dirs| dirs.data_dir().join("bridge.db"))
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::for_platform(self.device.platform)
    }

    /// Policy for the pure auth machine.
    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            verification_poll: Duration::from_secs(self.auth.verification_poll_secs),
            resend_cooldown: Duration::from_secs(self.auth.resend_cooldown_secs),
            ..AuthPolicy::for_capabilities(self.capabilities())
        }
    }
}

fn check_scheme(name: &str, value: &str, allowed: &[&str]) -> BridgeResult<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| BridgeError::InvalidUrl(format!("{}: {} ({})", name, value, e)))?;
    if !allowed.contains(&parsed.scheme()) {
        return Err(BridgeError::InvalidUrl(format!(
            "{} must use {}, got: {}",
            name,
            allowed.join(" or "),
            value
        )));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(Uuid::parse_str(&config.device.id).is_ok());
        assert_eq!(config.connection.token_ttl_minutes, 30);
        assert_eq!(config.connection.validation_timeout_secs, 600);
        assert_eq!(config.sync.digital_twin_days, 90);
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.permissions.settings_fallback_delay_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [device]
            id = "device-under-test"
            platform = "ios"

            [connection]
            max_reconnect_attempts = 2
            show_sync_intro = false
        "#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.device.id, "device-under-test");
        assert_eq!(config.device.platform, Platform::Ios);
        assert_eq!(config.connection.max_reconnect_attempts, 2);
        assert!(!config.connection.show_sync_intro);
        assert_eq!(config.connection.token_group_size, 4);
        assert_eq!(config.hub.api_url, default_api_url());
    }

    #[test]
    fn test_validation_rules() {
        let mut config = BridgeConfig::default();
        config.device.id = " ".into();
        assert!(matches!(config.validate(), Err(BridgeError::MissingDeviceId)));

        let mut config = BridgeConfig::default();
        config.hub.realtime_url = "https://hub.example.com/rt".into();
        assert!(matches!(config.validate(), Err(BridgeError::InvalidUrl(_))));

        let mut config = BridgeConfig::default();
        config.hub.api_url = "ftp://hub.example.com".into();
        assert!(matches!(config.validate(), Err(BridgeError::InvalidUrl(_))));

        let mut config = BridgeConfig::default();
        config.sync.batch_size = 0;
        assert!(matches!(config.validate(), Err(BridgeError::InvalidConfig(_))));

        let mut config = BridgeConfig::default();
        config.connection.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");

        let mut config = BridgeConfig::default();
        config.device.name = "Test phone".into();
        config.sync.batch_size = 50;
        config.save(Some(path.clone())).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.name, "Test phone");
        assert_eq!(loaded.sync.batch_size, 50);
        assert_eq!(loaded.device.id, config.device.id);
    }

    #[test]
    fn test_policies_follow_settings() {
        let mut config = BridgeConfig::default();
        config.connection.max_reconnect_attempts = 3;
        config.connection.initial_backoff_ms = 250;
        config.device.platform = Platform::Ios;

        let policy = config.connection.policy();
        assert_eq!(policy.max_reconnect_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));

        let auth = config.auth_policy();
        assert!(!auth.capabilities.requires_full_health_profile);
        assert_eq!(auth.resend_cooldown, Duration::from_secs(60));
    }
}
