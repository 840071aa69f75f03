//! # Platform Capabilities
//!
//! A single value object describing what the host platform can do. The state
//! machines consult it instead of branching on the operating system inline.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Platform Rules                                       │
//! │                                                                         │
//! │                 ANDROID                    iOS                          │
//! │                 ───────                    ───                          │
//! │  Service        Health Connect             HealthKit                    │
//! │  Provider app   may be missing             always present               │
//! │  Read status    reported per permission    write-only visibility        │
//! │  Onboarding     all health fields needed   name + email only            │
//! │  Fallback       open Health Connect        open Settings app            │
//! │                 settings                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Platform {
    Android,
    Ios,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Android => write!(f, "android"),
            Platform::Ios => write!(f, "ios"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" | "iphone" => Ok(Platform::Ios),
            other => Err(crate::ValidationError::invalid(
                "platform",
                format!("unknown platform '{}', expected android or ios", other),
            )),
        }
    }
}

/// Native health-data service behind the permission bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HealthService {
    HealthConnect,
    HealthKit,
}

impl std::fmt::Display for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthService::HealthConnect => write!(f, "Health Connect"),
            HealthService::HealthKit => write!(f, "HealthKit"),
        }
    }
}

/// Capabilities supplied once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Host operating system.
    pub platform: Platform,

    /// Health service used for permissions and reads.
    pub health_service: HealthService,

    /// Onboarding requires age/gender/height/weight/activity level.
    pub requires_full_health_profile: bool,

    /// The service can be missing and must be installed separately.
    pub service_may_be_missing: bool,

    /// The platform reports per-type read grants. HealthKit hides read
    /// authorization, so a completed dialog is treated as a grant there.
    pub reports_read_grants: bool,
}

impl PlatformCapabilities {
    /// Android with Health Connect.
    pub const fn android() -> Self {
        PlatformCapabilities {
            platform: Platform::Android,
            health_service: HealthService::HealthConnect,
            requires_full_health_profile: true,
            service_may_be_missing: true,
            reports_read_grants: true,
        }
    }

    /// iOS with HealthKit.
    pub const fn ios() -> Self {
        PlatformCapabilities {
            platform: Platform::Ios,
            health_service: HealthService::HealthKit,
            requires_full_health_profile: false,
            service_may_be_missing: false,
            reports_read_grants: false,
        }
    }

    /// Capabilities for the given platform.
    pub const fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Android => Self::android(),
            Platform::Ios => Self::ios(),
        }
    }
}
