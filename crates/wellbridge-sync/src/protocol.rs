//! # Realtime Protocol Messages
//!
//! Messages on the realtime validation channel.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Realtime Validation Channel                         │
//! │                                                                         │
//! │  SUBSCRIBE                                                             │
//! │  ─────────                                                             │
//! │  DEVICE ───► Subscribe { token, device_id }                            │
//! │  HUB    ◄─── Subscribed { channel }                                    │
//! │                                                                         │
//! │  VALIDATION (user confirmed the code in the browser)                   │
//! │  ──────────                                                            │
//! │  HUB    ───► TokenValidated { token, success, device_name, session_id }│
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  Both   ◄──► Ping { timestamp } / Pong { timestamp }                   │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  HUB    ───► Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "TokenValidated", "payload": { "token": "AB3D9KQ2", "success": true } }
//! ```

use serde::{Deserialize, Serialize};

use wellbridge_core::connection::ValidationSignal;

use crate::error::{BridgeError, BridgeResult};

/// All realtime channel messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RealtimeMessage {
    /// Device asks for validation events of one token.
    Subscribe(SubscribePayload),

    /// Hub accepted the subscription.
    Subscribed {
        #[serde(default)]
        channel: Option<String>,
    },

    /// The web side finished validating a token.
    TokenValidated(ValidationPayload),

    Ping { timestamp: String },

    Pong { timestamp: String },

    Error { code: String, message: String },
}

/// Subscription request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub token: String,
    pub device_id: String,
}

/// Validation outcome pushed by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPayload {
    pub token: String,
    pub success: bool,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<ValidationPayload> for ValidationSignal {
    fn from(payload: ValidationPayload) -> Self {
        ValidationSignal {
            token: payload.token,
            success: payload.success,
            device_name: payload.device_name,
            session_id: payload.session_id,
            message: payload.message,
        }
    }
}

impl RealtimeMessage {
    /// Message type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            RealtimeMessage::Subscribe(_) => "Subscribe",
            RealtimeMessage::Subscribed { .. } => "Subscribed",
            RealtimeMessage::TokenValidated(_) => "TokenValidated",
            RealtimeMessage::Ping { .. } => "Ping",
            RealtimeMessage::Pong { .. } => "Pong",
            RealtimeMessage::Error { .. } => "Error",
        }
    }

    pub fn subscribe(token: &str, device_id: &str) -> Self {
        RealtimeMessage::Subscribe(SubscribePayload {
            token: token.to_string(),
            device_id: device_id.to_string(),
        })
    }

    pub fn ping() -> Self {
        RealtimeMessage::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn pong(timestamp: &str) -> Self {
        RealtimeMessage::Pong {
            timestamp: timestamp.to_string(),
        }
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> BridgeResult<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = RealtimeMessage::subscribe("AB3D9KQ2", "dev-1").to_json().unwrap();
        assert!(json.contains(r#""type":"Subscribe""#));
        assert!(json.contains(r#""deviceId":"dev-1""#));
    }

    #[test]
    fn test_parse_validation() {
        let text = r#"{"type":"TokenValidated","payload":{"token":"AB3D-9KQ2","success":true,"deviceName":"Ada's Pixel"}}"#;
        let message = RealtimeMessage::from_json(text).unwrap();
        assert_eq!(message.type_name(), "TokenValidated");

        let RealtimeMessage::TokenValidated(payload) = message else {
            panic!("expected TokenValidated");
        };
        let signal = ValidationSignal::from(payload);
        assert!(signal.success);
        assert_eq!(signal.device_name.as_deref(), Some("Ada's Pixel"));
        assert!(signal.session_id.is_none());
    }

    #[test]
    fn test_parse_garbage_is_invalid_message() {
        assert!(matches!(
            RealtimeMessage::from_json("{\"type\":\"Nope\"}"),
            Err(BridgeError::InvalidMessage(_))
        ));
    }
}
