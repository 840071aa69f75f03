//! # Bridge Error Types
//!
//! Error types for the runtime: hub traffic, realtime channel, platform
//! permissions, storage and configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Bridge Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Hub / Network  │  │   User Input    │  │     Platform            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Network        │  │  Validation     │  │  PermissionDenied       │ │
//! │  │  Server{status} │  │  TokenExpired   │  │  PermissionUnavailable  │ │
//! │  │  Timeout        │  │                 │  │  RequestInFlight        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Storage      │  │      Runtime            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Database       │  │  ChannelError           │ │
//! │  │  InvalidUrl     │  │  Serialization  │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retry Policy
//! Only [`BridgeError::is_retryable`] errors are retried automatically.
//! Validation, permission and expiry errors always need a new user action.

use thiserror::Error;
use wellbridge_core::{CoreError, ValidationError};
use wellbridge_db::DbError;

/// Result type alias for runtime operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Runtime error type.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // Hub / Network Errors
    // =========================================================================
    /// Connectivity problem talking to the hub.
    ///
    /// ## When This Occurs
    /// - DNS or TCP failure
    /// - TLS handshake failure
    /// - Connection dropped mid-request
    #[error("Network error: {0}")]
    Network(String),

    /// The hub answered with a non-success status.
    #[error("Hub rejected the request ({status}): {message}")]
    Server { status: u16, message: String },

    /// Operation timed out.
    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    /// The realtime channel failed.
    #[error("Realtime channel error: {0}")]
    WebSocketError(String),

    /// A hub or realtime payload could not be understood.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // =========================================================================
    // User Input Errors
    // =========================================================================
    /// Malformed user input, rejected before any network call.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The connection token is past its expiry.
    #[error("Connection code expired. Generate a new code to continue.")]
    TokenExpired,

    // =========================================================================
    // Platform Errors
    // =========================================================================
    /// The user declined the system dialog.
    #[error("Health permission denied: {0}")]
    PermissionDenied(String),

    /// The platform health service cannot grant anything.
    #[error("Health service unavailable: {0}")]
    PermissionUnavailable(String),

    /// A permission request is already waiting on the user.
    #[error("A permission request is already in progress")]
    RequestInFlight,

    /// The native platform layer failed.
    #[error("Platform error: {0}")]
    Platform(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured. Run `wellbridge config init` first.")]
    MissingDeviceId,

    /// Invalid URL in configuration.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Local database failure.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Internal channel closed or full.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The component is shutting down.
    #[error("Bridge is shutting down")]
    ShuttingDown,

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Returns true if retrying the same request might succeed.
    ///
    /// ## Example
    /// ```rust
    /// use wellbridge_sync::BridgeError;
    ///
    /// assert!(BridgeError::Network("reset".into()).is_retryable());
    /// assert!(BridgeError::Server { status: 503, message: "busy".into() }.is_retryable());
    /// assert!(!BridgeError::Server { status: 400, message: "bad".into() }.is_retryable());
    /// assert!(!BridgeError::TokenExpired.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Network(_) | BridgeError::Timeout(_) | BridgeError::WebSocketError(_) => {
                true
            }
            BridgeError::Server { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Returns true for configuration problems.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidConfig(_)
                | BridgeError::MissingDeviceId
                | BridgeError::InvalidUrl(_)
                | BridgeError::ConfigLoadFailed(_)
                | BridgeError::ConfigSaveFailed(_)
        )
    }

    /// Returns true for errors that need the user to act.
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self,
            BridgeError::Validation(_)
                | BridgeError::TokenExpired
                | BridgeError::PermissionDenied(_)
                | BridgeError::PermissionUnavailable(_)
        )
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<CoreError> for BridgeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TokenExpired { .. } | CoreError::TokenSuperseded => BridgeError::TokenExpired,
            CoreError::PermissionDenied(msg) => BridgeError::PermissionDenied(msg),
            CoreError::PermissionUnavailable(msg) => BridgeError::PermissionUnavailable(msg),
            CoreError::Validation(err) => BridgeError::Validation(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        BridgeError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                BridgeError::WebSocketError("connection closed".into())
            }
            WsError::Io(e) => BridgeError::Network(e.to_string()),
            WsError::Tls(e) => BridgeError::Network(format!("TLS: {}", e)),
            WsError::Http(response) => BridgeError::Server {
                status: response.status().as_u16(),
                message: "realtime handshake rejected".into(),
            },
            other => BridgeError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BridgeError::Network(format!("request timed out: {}", err));
        }
        if let Some(status) = err.status() {
            return BridgeError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return BridgeError::InvalidMessage(err.to_string());
        }
        BridgeError::Network(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for BridgeError {
    fn from(err: toml::ser::Error) -> Self {
        BridgeError::ConfigSaveFailed(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelError("receiver dropped".into())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_retry_policy() {
        for status in [408, 429, 500, 502, 503] {
            assert!(BridgeError::Server {
                status,
                message: String::new()
            }
            .is_retryable());
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!BridgeError::Server {
                status,
                message: String::new()
            }
            .is_retryable());
        }
    }

    #[test]
    fn test_user_errors_never_retry() {
        let errors = [
            BridgeError::Validation(ValidationError::required("connection code")),
            BridgeError::TokenExpired,
            BridgeError::PermissionDenied("steps".into()),
            BridgeError::PermissionUnavailable("Health Connect".into()),
        ];
        for err in errors {
            assert!(!err.is_retryable());
            assert!(err.needs_user_action());
        }
    }

    #[test]
    fn test_core_error_conversion() {
        let err: BridgeError = CoreError::PermissionUnavailable("HealthKit".into()).into();
        assert!(matches!(err, BridgeError::PermissionUnavailable(_)));

        let err: BridgeError = CoreError::TokenSuperseded.into();
        assert!(matches!(err, BridgeError::TokenExpired));
    }

    #[test]
    fn test_config_error_classification() {
        assert!(BridgeError::MissingDeviceId.is_config_error());
        assert!(BridgeError::InvalidUrl("x".into()).is_config_error());
        assert!(!BridgeError::Network("x".into()).is_config_error());
    }

    #[test]
    fn test_display_messages() {
        let err = BridgeError::Server {
            status: 409,
            message: "code already used".into(),
        };
        assert_eq!(
            err.to_string(),
            "Hub rejected the request (409): code already used"
        );
        assert_eq!(
            BridgeError::RequestInFlight.to_string(),
            "A permission request is already in progress"
        );
    }
}
