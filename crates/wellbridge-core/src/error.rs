//! # Error Types
//!
//! Domain-specific error types for wellbridge-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  wellbridge-core errors (this file)                                    │
//! │  ├── CoreError        - Domain rule violations (expired token, ...)    │
//! │  └── ValidationError  - Malformed user input                           │
//! │                                                                         │
//! │  wellbridge-db errors (separate crate)                                 │
//! │  └── DbError          - Persistence failures                           │
//! │                                                                         │
//! │  wellbridge-sync errors (separate crate)                               │
//! │  └── BridgeError      - Network/server/platform failures               │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → BridgeError → state.error_message │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (field, expiry, permission)
//! 3. Errors are enum variants, never String
//! 4. Each error variant maps to a user-facing message

use chrono::{DateTime, Utc};
use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// None of these are retried automatically: every one of them needs a new,
/// explicit user action (regenerate, grant, correct input).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The connection token passed its expiry before the handoff finished.
    ///
    /// ## When This Occurs
    /// - The web side validates after the 30 minute TTL
    /// - A persisted token is restored after the app slept past expiry
    #[error("Connection code expired at {expired_at}. Generate a new code to continue.")]
    TokenExpired { expired_at: DateTime<Utc> },

    /// A validation signal referred to a token that is no longer active.
    ///
    /// ## When This Occurs
    /// - The user regenerated the code and the web validated the old one
    #[error("Connection code is no longer active")]
    TokenSuperseded,

    /// The user declined the platform permission dialog.
    #[error("Health permissions were declined: {0}")]
    PermissionDenied(String),

    /// The platform health service cannot grant permissions at all.
    #[error("Health service unavailable: {0}")]
    PermissionUnavailable(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when user input doesn't meet requirements.
/// They are raised before any network call is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too short.
    #[error("{field} must be at least {min} characters")]
    TooShort { field: String, min: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., reconnect code without separator, bad email).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Shorthand for a `Required` error.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }

    /// Shorthand for an `InvalidFormat` error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
