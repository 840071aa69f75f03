//! # Validation Module
//!
//! Input checks run before any network call is attempted.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Form widgets (UI collaborator)                               │
//! │  └── Immediate feedback while typing                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: State machines (this crate)                                  │
//! │  └── THIS MODULE: rejects bad input, zero hub requests issued          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Wellness Hub                                                 │
//! │  └── Server-side checks surface as BridgeError::Server                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use wellbridge_core::validation::{validate_email, validate_password};
//!
//! validate_email("ada@example.com").unwrap();
//! validate_password("correct horse").unwrap();
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Minimum password length accepted at sign-up.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Maximum length for free-text names.
pub const MAX_NAME_LEN: usize = 100;

// =============================================================================
// Account Validators
// =============================================================================

/// Validates an email address.
///
/// ## Rules
/// - Must not be empty
/// - Exactly one `@` with a non-empty local part
/// - Domain contains a dot that is neither first nor last
/// - No whitespace
///
/// ## Example
/// ```rust
/// use wellbridge_core::validation::validate_email;
///
/// assert!(validate_email("ada@example.com").is_ok());
/// assert!(validate_email("ada@example").is_err());
/// assert!(validate_email("").is_err());
/// ```
pub fn validate_email(email: &str) -> ValidationResult<()> {
    let email = email.trim();

    if email.is_empty() {
        return Err(ValidationError::required("email"));
    }

    if email.len() > 254 {
        return Err(ValidationError::TooLong {
            field: "email".to_string(),
            max: 254,
        });
    }

    if email.chars().any(char::is_whitespace) {
        return Err(ValidationError::invalid("email", "must not contain spaces"));
    }

    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return Err(ValidationError::invalid("email", "missing '@'")),
    };

    if local.is_empty() || domain.contains('@') {
        return Err(ValidationError::invalid("email", "malformed address"));
    }

    match domain.rfind('.') {
        Some(dot) if dot > 0 && dot < domain.len() - 1 && !domain.starts_with('.') => Ok(()),
        _ => Err(ValidationError::invalid("email", "domain is incomplete")),
    }
}

/// Validates a sign-up password.
///
/// ## Rules
/// - Must not be empty
/// - At least [`MIN_PASSWORD_LEN`] characters
pub fn validate_password(password: &str) -> ValidationResult<()> {
    if password.is_empty() {
        return Err(ValidationError::required("password"));
    }

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::TooShort {
            field: "password".to_string(),
            min: MIN_PASSWORD_LEN,
        });
    }

    Ok(())
}

/// Validates a display name.
///
/// Returns the trimmed name.
pub fn validate_name(name: &str) -> ValidationResult<String> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::required("name"));
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(name.to_string())
}

/// Validates an optional phone number.
///
/// ## Rules
/// - Digits, spaces, `-`, `(`, `)` and a leading `+`
/// - Between 7 and 15 digits
///
/// ## Example
/// ```rust
/// use wellbridge_core::validation::validate_phone;
///
/// assert!(validate_phone("+1 (555) 010-2030").is_ok());
/// assert!(validate_phone("call me").is_err());
/// ```
pub fn validate_phone(phone: &str) -> ValidationResult<()> {
    let phone = phone.trim();

    if phone.is_empty() {
        return Err(ValidationError::required("phone"));
    }

    let body = phone.strip_prefix('+').unwrap_or(phone);
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')'))
    {
        return Err(ValidationError::invalid(
            "phone",
            "must contain only digits, spaces, dashes and parentheses",
        ));
    }

    let digits = body.chars().filter(char::is_ascii_digit).count();
    if !(7..=15).contains(&digits) {
        return Err(ValidationError::invalid("phone", "must have 7 to 15 digits"));
    }

    Ok(())
}

// =============================================================================
// Health Profile Validators
// =============================================================================

fn check_range(field: &str, value: i64, min: i64, max: i64) -> ValidationResult<()> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
        });
    }
    Ok(())
}

/// Age in whole years, 13 to 120.
pub fn validate_age(age: u32) -> ValidationResult<()> {
    check_range("age", i64::from(age), 13, 120)
}

/// Height in centimetres, 50 to 272.
pub fn validate_height_cm(height_cm: f64) -> ValidationResult<()> {
    if !height_cm.is_finite() {
        return Err(ValidationError::invalid("height", "must be a number"));
    }
    check_range("height", height_cm.round() as i64, 50, 272)
}

/// Weight in kilograms, 20 to 635.
pub fn validate_weight_kg(weight_kg: f64) -> ValidationResult<()> {
    if !weight_kg.is_finite() {
        return Err(ValidationError::invalid("weight", "must be a number"));
    }
    check_range("weight", weight_kg.round() as i64, 20, 635)
}

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a UUID string (device and session ids).
///
/// ## Example
/// ```rust
/// use wellbridge_core::validation::validate_uuid;
///
/// assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("not-a-uuid").is_err());
/// ```
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::required("id"));
    }

    uuid::Uuid::parse_str(id.trim())
        .map_err(|_| ValidationError::invalid("id", "must be a valid UUID"))?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email(" grace.hopper@navy.mil ").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("ada").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ada@example").is_err());
        assert!(validate_email("ada@.com").is_err());
        assert!(validate_email("ada@example.").is_err());
        assert!(validate_email("a da@example.com").is_err());
        assert!(validate_email("a@b@example.com").is_err());
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("12345678").is_ok());
        assert!(matches!(
            validate_password("short"),
            Err(ValidationError::TooShort { min: 8, .. })
        ));
        assert!(matches!(
            validate_password(""),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("  Ada  ").unwrap(), "Ada");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_phone() {
        assert!(validate_phone("+44 20 7946 0958").is_ok());
        assert!(validate_phone("555-0102").is_ok());
        assert!(validate_phone("12345").is_err());
        assert!(validate_phone("+1 555 CALL NOW").is_err());
    }

    #[test]
    fn test_health_ranges() {
        assert!(validate_age(34).is_ok());
        assert!(validate_age(12).is_err());
        assert!(validate_height_cm(172.5).is_ok());
        assert!(validate_height_cm(f64::NAN).is_err());
        assert!(validate_height_cm(20.0).is_err());
        assert!(validate_weight_kg(68.0).is_ok());
        assert!(validate_weight_kg(5.0).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("123").is_err());
    }
}
