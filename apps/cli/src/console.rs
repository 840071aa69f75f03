//! Terminal collaborators: a browser launcher that prints the handoff link
//! and an emitter that logs every published state.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use wellbridge_core::auth::AuthState;
use wellbridge_core::connection::ConnectionState;
use wellbridge_core::progress::SyncSummary;
use wellbridge_sync::ports::UrlLauncher;
use wellbridge_sync::{BridgeEventEmitter, BridgeResult, HealthState};

/// Prints the handoff URL instead of opening a browser.
#[derive(Debug, Default)]
pub struct PrintLauncher;

#[async_trait]
impl UrlLauncher for PrintLauncher {
    async fn open(&self, url: &Url) -> BridgeResult<()> {
        println!("Open this link on any device to link this one:");
        println!("  {}", url);
        Ok(())
    }
}

/// Logs state changes at debug level.
pub struct LogEmitter;

impl BridgeEventEmitter for LogEmitter {
    fn emit_connection(&self, state: &ConnectionState) {
        debug!(
            status = %state.status,
            realtime = %state.realtime_status,
            attempts = state.reconnect_attempts,
            "Connection state"
        );
    }

    fn emit_health(&self, state: &HealthState) {
        debug!(running = ?state.running, error = ?state.error_message, "Health state");
    }

    fn emit_auth(&self, state: &AuthState) {
        debug!(status = %state.status, "Auth state");
    }
}

/// The serialized name of a unit enum value (`granted`, `partiallyGranted`).
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "unknown".to_string(),
    }
}

pub fn print_summary(summary: &SyncSummary) {
    println!(
        "{}: {} of {} data points uploaded ({} failed), finished {}",
        summary.phase,
        summary.successful_uploads,
        summary.total_data_points,
        summary.failed_uploads,
        summary.completed_at.format("%Y-%m-%d %H:%M UTC"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use wellbridge_core::connection::ConnectionStatus;
    use wellbridge_core::HealthPermissionStatus;

    #[test]
    fn test_label_uses_serialized_name() {
        assert_eq!(label(&HealthPermissionStatus::PartiallyGranted), "partiallyGranted");
        assert_eq!(label(&ConnectionStatus::AwaitingWebValidation), "awaitingWebValidation");
    }

    #[tokio::test]
    async fn test_print_launcher_never_fails() {
        let url = Url::parse("https://hub.example.com/connect?token=ABCD").unwrap();
        assert!(PrintLauncher.open(&url).await.is_ok());
    }
}
