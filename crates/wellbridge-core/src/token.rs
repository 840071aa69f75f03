//! # Connection Tokens
//!
//! The short-lived code that links this device to a Wellness Hub account.
//!
//! ## Token Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Connection Token Lifecycle                         │
//! │                                                                         │
//! │  "Generate Connection Code"                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Hub issues raw value ──► issued_at = now, expires_at = now + 30 min   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Persisted locally, shown as "AB3D-9KQ2-XY7P" (grouped)                │
//! │       │                                                                 │
//! │       ├── Regenerate  → superseded (old value never accepted again)    │
//! │       ├── Disconnect  → cleared                                        │
//! │       └── now ≥ expiry → invalid for handoff even if the value matches │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Text Formats
//! - Raw: opaque alphanumeric string from the hub.
//! - Display: raw grouped with `-` every N characters for manual entry.
//! - Reconnect code: `userId/token`, typed in by hand on a second device.
//!
//! Separators and whitespace are stripped before any comparison or use.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::validation::ValidationResult;

/// Separator inserted between display groups.
pub const DISPLAY_SEPARATOR: char = '-';

/// Separator between the user id and token in a reconnect code.
pub const RECONNECT_SEPARATOR: char = '/';

// =============================================================================
// Connection Token
// =============================================================================

/// A device connection token issued by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionToken {
    /// Opaque value issued by the hub, separators already stripped.
    raw: String,

    /// When the token was issued.
    issued_at: DateTime<Utc>,

    /// When the token stops being accepted.
    expires_at: DateTime<Utc>,
}

impl ConnectionToken {
    /// Creates a token with a fixed time-to-live from issuance.
    pub fn issue(raw: &str, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self::with_expiry(raw, issued_at, issued_at + ttl)
    }

    /// Creates a token with an explicit expiry (as reported by the hub or
    /// restored from storage).
    pub fn with_expiry(raw: &str, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        ConnectionToken {
            raw: strip_formatting(raw),
            issued_at,
            expires_at,
        }
    }

    /// The raw value, without display separators.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// When the token was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the token expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// A token is valid iff `now < expiry`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Returns `TokenExpired` when the token can no longer complete a handoff.
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.is_valid_at(now) {
            Ok(())
        } else {
            Err(CoreError::TokenExpired {
                expired_at: self.expires_at,
            })
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        if self.is_valid_at(now) {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }

    /// Compares against a value typed or echoed back in any display format.
    pub fn matches(&self, candidate: &str) -> bool {
        !self.raw.is_empty() && strip_formatting(candidate) == self.raw
    }

    /// The human-readable grouped form.
    pub fn formatted(&self, group_size: usize) -> String {
        format_token(&self.raw, group_size)
    }

    /// First characters of the value, safe for logs.
    pub fn log_prefix(&self) -> &str {
        let end = self
            .raw
            .char_indices()
            .nth(4)
            .map(|(i, _)| i)
            .unwrap_or(self.raw.len());
        &self.raw[..end]
    }
}

// =============================================================================
// Display Formatting
// =============================================================================

/// Removes display separators and whitespace.
///
/// ## Example
/// ```rust
/// use wellbridge_core::token::strip_formatting;
///
/// assert_eq!(strip_formatting(" AB3D-9KQ2 -XY7P "), "AB3D9KQ2XY7P");
/// ```
pub fn strip_formatting(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != DISPLAY_SEPARATOR && !c.is_whitespace())
        .collect()
}

/// Groups a token into chunks of `group_size` characters joined by `-`.
///
/// A `group_size` of zero returns the stripped value unchanged.
///
/// ## Example
/// ```rust
/// use wellbridge_core::token::format_token;
///
/// assert_eq!(format_token("AB3D9KQ2XY7P", 4), "AB3D-9KQ2-XY7P");
/// assert_eq!(format_token("AB3D9", 4), "AB3D-9");
/// ```
pub fn format_token(raw: &str, group_size: usize) -> String {
    let stripped = strip_formatting(raw);
    if group_size == 0 {
        return stripped;
    }

    let chars: Vec<char> = stripped.chars().collect();
    chars
        .chunks(group_size)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(&DISPLAY_SEPARATOR.to_string())
}

// =============================================================================
// Reconnect Code
// =============================================================================

/// A manually entered `userId/token` code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectCode {
    pub user_id: String,
    pub token: String,
}

impl ReconnectCode {
    /// Parses a reconnect code.
    ///
    /// ## Rules
    /// - Must not be empty
    /// - Must contain a `/` separating user id and token
    /// - Neither side may be empty after trimming
    ///
    /// ## Example
    /// ```rust
    /// use wellbridge_core::token::ReconnectCode;
    ///
    /// let code = ReconnectCode::parse("user-42/AB3D-9KQ2").unwrap();
    /// assert_eq!(code.user_id, "user-42");
    /// assert_eq!(code.token, "AB3D9KQ2");
    ///
    /// assert!(ReconnectCode::parse("abc123").is_err());
    /// ```
    pub fn parse(input: &str) -> ValidationResult<Self> {
        let input = input.trim();

        if input.is_empty() {
            return Err(ValidationError::required("connection code"));
        }

        let (user_id, token) = input.split_once(RECONNECT_SEPARATOR).ok_or_else(|| {
            ValidationError::invalid(
                "connection code",
                "expected the form userId/code as shown on the Wellness Hub",
            )
        })?;

        let user_id = user_id.trim();
        let token = strip_formatting(token);

        if user_id.is_empty() || user_id.chars().any(char::is_whitespace) {
            return Err(ValidationError::invalid(
                "connection code",
                "user id part is missing or contains spaces",
            ));
        }

        if token.is_empty() || token.contains(RECONNECT_SEPARATOR) {
            return Err(ValidationError::invalid(
                "connection code",
                "code part is missing or malformed",
            ));
        }

        Ok(ReconnectCode {
            user_id: user_id.to_string(),
            token,
        })
    }
}

impl std::fmt::Display for ReconnectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.user_id, RECONNECT_SEPARATOR, self.token)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
