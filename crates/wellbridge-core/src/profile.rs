//! # User Profile
//!
//! The profile referenced by the auth flow and the sync orchestrator. It is
//! owned by the profile store in `wellbridge-sync`; this module only holds the
//! shape and the completeness rules.
//!
//! ## Completeness
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Profile Completeness                             │
//! │                                                                         │
//! │  every platform:  name ✓  email ✓                                      │
//! │                                                                         │
//! │  platforms with requires_full_health_profile (Android):                │
//! │                   age ✓  gender ✓  height ✓  weight ✓  activity ✓      │
//! │                                                                         │
//! │  phone is always optional                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::ValidationError;
use crate::platform::PlatformCapabilities;
use crate::validation::{
    validate_age, validate_email, validate_height_cm, validate_name, validate_phone,
    validate_weight_kg, ValidationResult,
};

// =============================================================================
// Enumerations
// =============================================================================

/// Gender as collected during onboarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Gender {
    Female,
    Male,
    NonBinary,
    PreferNotToSay,
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gender::Female => write!(f, "female"),
            Gender::Male => write!(f, "male"),
            Gender::NonBinary => write!(f, "non_binary"),
            Gender::PreferNotToSay => write!(f, "prefer_not_to_say"),
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "female" => Ok(Gender::Female),
            "male" => Ok(Gender::Male),
            "non_binary" | "nonbinary" => Ok(Gender::NonBinary),
            "prefer_not_to_say" => Ok(Gender::PreferNotToSay),
            other => Err(ValidationError::invalid(
                "gender",
                format!("unknown value '{}'", other),
            )),
        }
    }
}

/// Self-reported activity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ActivityLevel {
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityLevel::Sedentary => write!(f, "sedentary"),
            ActivityLevel::Light => write!(f, "light"),
            ActivityLevel::Moderate => write!(f, "moderate"),
            ActivityLevel::Active => write!(f, "active"),
            ActivityLevel::VeryActive => write!(f, "very_active"),
        }
    }
}

impl std::str::FromStr for ActivityLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "sedentary" => Ok(ActivityLevel::Sedentary),
            "light" | "lightly_active" => Ok(ActivityLevel::Light),
            "moderate" | "moderately_active" => Ok(ActivityLevel::Moderate),
            "active" => Ok(ActivityLevel::Active),
            "very_active" => Ok(ActivityLevel::VeryActive),
            other => Err(ValidationError::invalid(
                "activity level",
                format!("unknown value '{}'", other),
            )),
        }
    }
}

// =============================================================================
// User Profile
// =============================================================================

/// A user's profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct UserProfile {
    /// Hub user identifier. Empty until the hub has assigned one.
    pub user_id: String,

    pub name: String,
    pub email: String,

    pub phone: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,

    /// Height in centimetres.
    pub height_cm: Option<f64>,

    /// Weight in kilograms.
    pub weight_kg: Option<f64>,

    pub activity_level: Option<ActivityLevel>,
}

impl UserProfile {
    /// A profile with only the account fields filled in.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        UserProfile {
            user_id: user_id.into(),
            name: name.into(),
            email: email.into(),
            ..Default::default()
        }
    }

    /// Fields still missing for the given platform, in form order.
    pub fn missing_fields(&self, caps: &PlatformCapabilities) -> Vec<&'static str> {
        let mut missing = Vec::new();

        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.email.trim().is_empty() {
            missing.push("email");
        }

        if caps.requires_full_health_profile {
            if self.age.is_none() {
                missing.push("age");
            }
            if self.gender.is_none() {
                missing.push("gender");
            }
            if self.height_cm.is_none() {
                missing.push("height");
            }
            if self.weight_kg.is_none() {
                missing.push("weight");
            }
            if self.activity_level.is_none() {
                missing.push("activity level");
            }
        }

        missing
    }

    /// Complete iff nothing is missing for this platform.
    pub fn is_complete(&self, caps: &PlatformCapabilities) -> bool {
        self.missing_fields(caps).is_empty()
    }

    /// Checks every populated field and the platform completeness rule.
    ///
    /// The first failure is returned.
    pub fn validate(&self, caps: &PlatformCapabilities) -> ValidationResult<()> {
        if let Some(field) = self.missing_fields(caps).first() {
            return Err(ValidationError::required(*field));
        }

        validate_name(&self.name)?;
        validate_email(&self.email)?;

        if let Some(phone) = self.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            validate_phone(phone)?;
        }
        if let Some(age) = self.age {
            validate_age(age)?;
        }
        if let Some(height) = self.height_cm {
            validate_height_cm(height)?;
        }
        if let Some(weight) = self.weight_kg {
            validate_weight_kg(weight)?;
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
