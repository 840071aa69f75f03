//! # Preference Keys
//!
//! Every persisted value lives under a `wellbridge.<area>.<name>` key. Only
//! the owning component writes a given area.
//!
//! | Area         | Owner            |
//! |--------------|------------------|
//! | `profile`    | profile store    |
//! | `onboarding` | auth bloc        |
//! | `welcome`    | auth bloc        |
//! | `connection` | token manager / connection bloc |

/// Prefix shared by all keys.
pub const NAMESPACE: &str = "wellbridge.";

// -----------------------------------------------------------------------------
// Profile
// -----------------------------------------------------------------------------

pub const PROFILE_PREFIX: &str = "wellbridge.profile.";
pub const PROFILE_USER_ID: &str = "wellbridge.profile.user_id";
pub const PROFILE_NAME: &str = "wellbridge.profile.name";
pub const PROFILE_EMAIL: &str = "wellbridge.profile.email";
pub const PROFILE_PHONE: &str = "wellbridge.profile.phone";
pub const PROFILE_AGE: &str = "wellbridge.profile.age";
pub const PROFILE_GENDER: &str = "wellbridge.profile.gender";
pub const PROFILE_HEIGHT_CM: &str = "wellbridge.profile.height_cm";
pub const PROFILE_WEIGHT_KG: &str = "wellbridge.profile.weight_kg";
pub const PROFILE_ACTIVITY_LEVEL: &str = "wellbridge.profile.activity_level";
pub const PROFILE_COMPLETE: &str = "wellbridge.profile.complete";

// -----------------------------------------------------------------------------
// Flags
// -----------------------------------------------------------------------------

pub const ONBOARDING_COMPLETE: &str = "wellbridge.onboarding.complete";
pub const WELCOME_SEEN: &str = "wellbridge.welcome.seen";

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

pub const CONNECTION_PREFIX: &str = "wellbridge.connection.";
pub const CONNECTION_TOKEN: &str = "wellbridge.connection.token";
pub const CONNECTION_TOKEN_ISSUED_AT: &str = "wellbridge.connection.token_issued_at";
pub const CONNECTION_TOKEN_EXPIRES_AT: &str = "wellbridge.connection.token_expires_at";
pub const CONNECTION_DEVICE_NAME: &str = "wellbridge.connection.device_name";
pub const CONNECTION_LAST_SYNC: &str = "wellbridge.connection.last_sync";

/// Token keys, cleared together.
pub const TOKEN_KEYS: [&str; 3] = [
    CONNECTION_TOKEN,
    CONNECTION_TOKEN_ISSUED_AT,
    CONNECTION_TOKEN_EXPIRES_AT,
];

/// Linked-device keys, cleared on disconnect.
pub const DEVICE_KEYS: [&str; 2] = [CONNECTION_DEVICE_NAME, CONNECTION_LAST_SYNC];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        for key in TOKEN_KEYS.iter().chain(DEVICE_KEYS.iter()) {
            assert!(key.starts_with(CONNECTION_PREFIX));
        }
        for key in [PROFILE_NAME, ONBOARDING_COMPLETE, WELCOME_SEEN] {
            assert!(key.starts_with(NAMESPACE));
        }
    }
}
