//! # Health Permission Vocabulary
//!
//! The fixed set of permission identifiers understood by the bridge, their
//! platform-native names, and the rules that turn a granted set into an
//! authorization status.
//!
//! ## Identifier Expansion
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Logical → Concrete Permissions                       │
//! │                                                                         │
//! │  "weight"                 → { Weight }                                 │
//! │  "sleep_asleep"           → { SleepAsleep }                            │
//! │  "physical_activity"      → { Steps, ExerciseSession, Distance,        │
//! │                               ActiveCaloriesBurned,                     │
//! │                               TotalCaloriesBurned }                     │
//! │  "all_health_permissions" → every concrete permission                  │
//! │  "blood_type" (unknown)   → { }  (reported back, never fatal)          │
//! │                                                                         │
//! │  Platforms only accept itemized grants, so logical identifiers are     │
//! │  always expanded before a request reaches the native layer.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Rules
//! ```text
//! service unavailable                         → Unavailable
//! granted ⊇ CRITICAL (weight,height,steps,sleep) → Granted
//! granted ∩ CRITICAL ≠ ∅                      → PartiallyGranted
//! otherwise                                   → Denied
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Concrete Permissions
// =============================================================================

/// A concrete, itemized health-data read permission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HealthPermission {
    Steps,
    Weight,
    Height,
    SleepAsleep,
    HeartRate,
    RestingHeartRate,
    HeartRateVariability,
    BodyFat,
    OxygenSaturation,
    ExerciseSession,
    Distance,
    ActiveCaloriesBurned,
    TotalCaloriesBurned,
}

/// Minimal set required for a full `Granted` status.
pub const CRITICAL_PERMISSIONS: [HealthPermission; 4] = [
    HealthPermission::Weight,
    HealthPermission::Height,
    HealthPermission::Steps,
    HealthPermission::SleepAsleep,
];

/// Concrete permissions behind the logical `physical_activity` identifier.
pub const PHYSICAL_ACTIVITY_PERMISSIONS: [HealthPermission; 5] = [
    HealthPermission::Steps,
    HealthPermission::ExerciseSession,
    HealthPermission::Distance,
    HealthPermission::ActiveCaloriesBurned,
    HealthPermission::TotalCaloriesBurned,
];

/// Logical identifier expanding to the activity bundle.
pub const PHYSICAL_ACTIVITY: &str = "physical_activity";

/// Logical identifier expanding to every permission.
pub const ALL_HEALTH_PERMISSIONS: &str = "all_health_permissions";

impl HealthPermission {
    /// Every concrete permission, in declaration order.
    pub const ALL: [HealthPermission; 13] = [
        HealthPermission::Steps,
        HealthPermission::Weight,
        HealthPermission::Height,
        HealthPermission::SleepAsleep,
        HealthPermission::HeartRate,
        HealthPermission::RestingHeartRate,
        HealthPermission::HeartRateVariability,
        HealthPermission::BodyFat,
        HealthPermission::OxygenSaturation,
        HealthPermission::ExerciseSession,
        HealthPermission::Distance,
        HealthPermission::ActiveCaloriesBurned,
        HealthPermission::TotalCaloriesBurned,
    ];

    /// The vocabulary identifier for this permission.
    pub const fn identifier(&self) -> &'static str {
        match self {
            HealthPermission::Steps => "steps",
            HealthPermission::Weight => "weight",
            HealthPermission::Height => "height",
            HealthPermission::SleepAsleep => "sleep_asleep",
            HealthPermission::HeartRate => "heart_rate",
            HealthPermission::RestingHeartRate => "resting_heart_rate",
            HealthPermission::HeartRateVariability => "heart_rate_variability",
            HealthPermission::BodyFat => "body_fat",
            HealthPermission::OxygenSaturation => "blood_oxygen",
            HealthPermission::ExerciseSession => "exercise",
            HealthPermission::Distance => "distance",
            HealthPermission::ActiveCaloriesBurned => "active_calories",
            HealthPermission::TotalCaloriesBurned => "total_calories",
        }
    }

    /// Android Health Connect permission string.
    pub const fn health_connect_permission(&self) -> &'static str {
        match self {
            HealthPermission::Steps => "android.permission.health.READ_STEPS",
            HealthPermission::Weight => "android.permission.health.READ_WEIGHT",
            HealthPermission::Height => "android.permission.health.READ_HEIGHT",
            HealthPermission::SleepAsleep => "android.permission.health.READ_SLEEP",
            HealthPermission::HeartRate => "android.permission.health.READ_HEART_RATE",
            HealthPermission::RestingHeartRate => {
                "android.permission.health.READ_RESTING_HEART_RATE"
            }
            HealthPermission::HeartRateVariability => {
                "android.permission.health.READ_HEART_RATE_VARIABILITY"
            }
            HealthPermission::BodyFat => "android.permission.health.READ_BODY_FAT",
            HealthPermission::OxygenSaturation => {
                "android.permission.health.READ_OXYGEN_SATURATION"
            }
            HealthPermission::ExerciseSession => "android.permission.health.READ_EXERCISE",
            HealthPermission::Distance => "android.permission.health.READ_DISTANCE",
            HealthPermission::ActiveCaloriesBurned => {
                "android.permission.health.READ_ACTIVE_CALORIES_BURNED"
            }
            HealthPermission::TotalCaloriesBurned => {
                "android.permission.health.READ_TOTAL_CALORIES_BURNED"
            }
        }
    }

    /// iOS HealthKit type identifier.
    pub const fn healthkit_identifier(&self) -> &'static str {
        match self {
            HealthPermission::Steps => "HKQuantityTypeIdentifierStepCount",
            HealthPermission::Weight => "HKQuantityTypeIdentifierBodyMass",
            HealthPermission::Height => "HKQuantityTypeIdentifierHeight",
            HealthPermission::SleepAsleep => "HKCategoryTypeIdentifierSleepAnalysis",
            HealthPermission::HeartRate => "HKQuantityTypeIdentifierHeartRate",
            HealthPermission::RestingHeartRate => "HKQuantityTypeIdentifierRestingHeartRate",
            HealthPermission::HeartRateVariability => {
                "HKQuantityTypeIdentifierHeartRateVariabilitySDNN"
            }
            HealthPermission::BodyFat => "HKQuantityTypeIdentifierBodyFatPercentage",
            HealthPermission::OxygenSaturation => "HKQuantityTypeIdentifierOxygenSaturation",
            HealthPermission::ExerciseSession => "HKWorkoutTypeIdentifier",
            HealthPermission::Distance => "HKQuantityTypeIdentifierDistanceWalkingRunning",
            HealthPermission::ActiveCaloriesBurned => {
                "HKQuantityTypeIdentifierActiveEnergyBurned"
            }
            HealthPermission::TotalCaloriesBurned => "HKQuantityTypeIdentifierBasalEnergyBurned",
        }
    }

    /// Whether this permission is part of the critical set.
    pub fn is_critical(&self) -> bool {
        CRITICAL_PERMISSIONS.contains(self)
    }

    /// Looks up a single concrete identifier (no logical expansion).
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let normalized = identifier.trim().to_lowercase();
        HealthPermission::ALL
            .iter()
            .copied()
            .find(|p| p.identifier() == normalized)
    }
}

impl std::fmt::Display for HealthPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier())
    }
}

// =============================================================================
// Expansion
// =============================================================================

/// Expands one vocabulary identifier into concrete permissions.
///
/// Unknown identifiers expand to an empty set.
pub fn expand_identifier(identifier: &str) -> BTreeSet<HealthPermission> {
    let normalized = identifier.trim().to_lowercase();
    match normalized.as_str() {
        PHYSICAL_ACTIVITY => PHYSICAL_ACTIVITY_PERMISSIONS.into_iter().collect(),
        ALL_HEALTH_PERMISSIONS => HealthPermission::ALL.into_iter().collect(),
        other => HealthPermission::from_identifier(other)
            .into_iter()
            .collect(),
    }
}

/// Result of expanding a batch of identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedRequest {
    /// Concrete permissions to request.
    pub permissions: BTreeSet<HealthPermission>,

    /// Identifiers that were not recognized.
    pub unknown: Vec<String>,
}

impl ExpandedRequest {
    /// Expands every identifier; unknown ones are collected, not fatal.
    ///
    /// ## Example
    /// ```rust
    /// use wellbridge_core::permission::{ExpandedRequest, HealthPermission};
    ///
    /// let req = ExpandedRequest::from_identifiers(["weight", "blood_type"]);
    /// assert!(req.permissions.contains(&HealthPermission::Weight));
    /// assert_eq!(req.unknown, vec!["blood_type".to_string()]);
    /// ```
    pub fn from_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut request = ExpandedRequest::default();
        for identifier in identifiers {
            let identifier = identifier.as_ref();
            let expanded = expand_identifier(identifier);
            if expanded.is_empty() {
                request.unknown.push(identifier.to_string());
            } else {
                request.permissions.extend(expanded);
            }
        }
        request
    }

    /// True when nothing recognizable was requested.
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

// =============================================================================
// Service Availability
// =============================================================================

/// Whether the platform health service can grant permissions at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AvailabilityStatus {
    /// Service present and usable.
    Available,
    /// Provider app missing (Health Connect not installed).
    NotInstalled,
    /// Provider app present but too old.
    UpdateRequired,
    /// Device or OS version cannot run the service.
    NotSupported,
}

/// Result of an availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ServiceAvailability {
    pub status: AvailabilityStatus,
    pub installed: bool,
    pub supported: bool,
}

impl ServiceAvailability {
    /// Service present and usable.
    pub const fn available() -> Self {
        ServiceAvailability {
            status: AvailabilityStatus::Available,
            installed: true,
            supported: true,
        }
    }

    /// Provider not installed on a supported device.
    pub const fn not_installed() -> Self {
        ServiceAvailability {
            status: AvailabilityStatus::NotInstalled,
            installed: false,
            supported: true,
        }
    }

    /// Device cannot run the service.
    pub const fn not_supported() -> Self {
        ServiceAvailability {
            status: AvailabilityStatus::NotSupported,
            installed: false,
            supported: false,
        }
    }

    /// True when permissions can be requested.
    pub fn is_available(&self) -> bool {
        self.status == AvailabilityStatus::Available
    }
}

// =============================================================================
// Authorization Status
// =============================================================================

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum HealthPermissionStatus {
    Granted,
    PartiallyGranted,
    Denied,
    Unavailable,
    PromptingUser,
}

impl HealthPermissionStatus {
    /// Whether sync may run with this status.
    pub fn allows_sync(&self) -> bool {
        matches!(
            self,
            HealthPermissionStatus::Granted | HealthPermissionStatus::PartiallyGranted
        )
    }
}

/// Authorization record, replaced wholesale on every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct HealthAuthorization {
    pub status: HealthPermissionStatus,
    pub granted: BTreeSet<HealthPermission>,
}

impl HealthAuthorization {
    /// Derives the status from a granted set.
    pub fn evaluate(granted: BTreeSet<HealthPermission>, availability: ServiceAvailability) -> Self {
        if !availability.is_available() {
            return Self::unavailable();
        }

        let critical_granted = CRITICAL_PERMISSIONS
            .iter()
            .filter(|p| granted.contains(p))
            .count();

        let status = if critical_granted == CRITICAL_PERMISSIONS.len() {
            HealthPermissionStatus::Granted
        } else if critical_granted > 0 {
            HealthPermissionStatus::PartiallyGranted
        } else {
            HealthPermissionStatus::Denied
        };

        HealthAuthorization { status, granted }
    }

    /// The service cannot grant anything.
    pub fn unavailable() -> Self {
        HealthAuthorization {
            status: HealthPermissionStatus::Unavailable,
            granted: BTreeSet::new(),
        }
    }

    /// A system dialog is on screen.
    pub fn prompting() -> Self {
        HealthAuthorization {
            status: HealthPermissionStatus::PromptingUser,
            granted: BTreeSet::new(),
        }
    }

    /// Critical permissions still missing.
    pub fn missing_critical(&self) -> Vec<HealthPermission> {
        CRITICAL_PERMISSIONS
            .iter()
            .copied()
            .filter(|p| !self.granted.contains(p))
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[HealthPermission]) -> BTreeSet<HealthPermission> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_physical_activity_expands_to_itemized_types() {
        let expanded = expand_identifier("physical_activity");
        for required in [
            HealthPermission::Steps,
            HealthPermission::ExerciseSession,
            HealthPermission::Distance,
            HealthPermission::ActiveCaloriesBurned,
        ] {
            assert!(expanded.contains(&required), "missing {required}");
        }
    }

    #[test]
    fn test_all_permissions_expand_to_everything() {
        assert_eq!(
            expand_identifier("all_health_permissions").len(),
            HealthPermission::ALL.len()
        );
    }

    #[test]
    fn test_unknown_identifiers_do_not_abort_batch() {
        let request = ExpandedRequest::from_identifiers(["steps", "blood_type", " Weight "]);
        assert_eq!(
            request.permissions,
            set(&[HealthPermission::Steps, HealthPermission::Weight])
        );
        assert_eq!(request.unknown, vec!["blood_type".to_string()]);

        let only_unknown = ExpandedRequest::from_identifiers(["nope"]);
        assert!(only_unknown.is_empty());
    }

    #[test]
    fn test_identifier_round_trip() {
        for permission in HealthPermission::ALL {
            assert_eq!(
                HealthPermission::from_identifier(permission.identifier()),
                Some(permission)
            );
        }
    }

    #[test]
    fn test_status_granted_requires_critical_superset() {
        let mut granted: BTreeSet<_> = CRITICAL_PERMISSIONS.into_iter().collect();
        granted.insert(HealthPermission::HeartRate);
        let auth = HealthAuthorization::evaluate(granted, ServiceAvailability::available());
        assert_eq!(auth.status, HealthPermissionStatus::Granted);
        assert!(auth.missing_critical().is_empty());
    }

    #[test]
    fn test_status_partial_when_some_critical_granted() {
        let auth = HealthAuthorization::evaluate(
            set(&[HealthPermission::Weight, HealthPermission::Height]),
            ServiceAvailability::available(),
        );
        assert_eq!(auth.status, HealthPermissionStatus::PartiallyGranted);
        assert_eq!(
            auth.missing_critical(),
            vec![HealthPermission::Steps, HealthPermission::SleepAsleep]
        );
    }

    #[test]
    fn test_status_denied_without_critical() {
        let auth = HealthAuthorization::evaluate(
            set(&[HealthPermission::HeartRate]),
            ServiceAvailability::available(),
        );
        assert_eq!(auth.status, HealthPermissionStatus::Denied);
        assert!(!auth.status.allows_sync());
    }

    #[test]
    fn test_unavailable_is_distinct_from_denied() {
        let auth = HealthAuthorization::evaluate(
            set(&[HealthPermission::Weight]),
            ServiceAvailability::not_installed(),
        );
        assert_eq!(auth.status, HealthPermissionStatus::Unavailable);
        assert!(auth.granted.is_empty());
    }

    #[test]
    fn test_native_identifiers_are_distinct() {
        let android: BTreeSet<_> = HealthPermission::ALL
            .iter()
            .map(|p| p.health_connect_permission())
            .collect();
        assert_eq!(android.len(), HealthPermission::ALL.len());
    }
}
