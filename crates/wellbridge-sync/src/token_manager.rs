//! # Token Manager
//!
//! Owns the device connection token: requests it from the hub, persists it
//! under the `connection.token*` keys and answers expiry questions.
//!
//! ```text
//! generate() ──► HubApi::generate_token ──► persist 3 keys ──► keep in memory
//!                        │ error
//!                        ▼
//!              previous token untouched, error returned
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use wellbridge_core::token::format_token;
use wellbridge_core::ConnectionToken;
use wellbridge_db::keys;
use wellbridge_db::PrefValue;

use crate::error::{BridgeError, BridgeResult};
use crate::ports::{Clock, DeviceIdentity, HubApi, KeyValueStore};

/// Issues, persists and expires connection tokens.
pub struct TokenManager {
    hub: Arc<dyn HubApi>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    device: DeviceIdentity,
    ttl: chrono::Duration,
    group_size: usize,
    current: RwLock<Option<ConnectionToken>>,
}

impl TokenManager {
    pub fn new(
        hub: Arc<dyn HubApi>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        device: DeviceIdentity,
        ttl: chrono::Duration,
        group_size: usize,
    ) -> Self {
        TokenManager {
            hub,
            store,
            clock,
            device,
            ttl,
            group_size,
            current: RwLock::new(None),
        }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Requests a fresh token and persists it before returning.
    ///
    /// On failure nothing is written and the previous token stays usable
    /// until its own expiry.
    pub async fn generate(&self) -> BridgeResult<ConnectionToken> {
        let issued = self.hub.generate_token(&self.device).await?;
        let now = self.clock.now();

        let raw = wellbridge_core::token::strip_formatting(&issued.token);
        if raw.is_empty() {
            return Err(BridgeError::InvalidMessage("hub issued an empty token".into()));
        }

        let token = match issued.expires_at {
            Some(expires_at) if expires_at > now => ConnectionToken::with_expiry(&raw, now, expires_at),
            Some(_) => {
                return Err(BridgeError::InvalidMessage(
                    "hub issued an already expired token".into(),
                ))
            }
            None => ConnectionToken::issue(&raw, now, self.ttl),
        };

        self.persist(&token).await?;
        info!(
            token_prefix = %token.log_prefix(),
            expires_at = %token.expires_at(),
            "Connection token issued"
        );
        *self.current.write().await = Some(token.clone());
        Ok(token)
    }

    /// The current token if it has not expired.
    pub async fn current_token(&self) -> Option<ConnectionToken> {
        let now = self.clock.now();
        self.current
            .read()
            .await
            .as_ref()
            .filter(|t| t.is_valid_at(now))
            .cloned()
    }

    /// Display form of the current token.
    pub async fn formatted_token(&self) -> Option<String> {
        self.current_token()
            .await
            .map(|t| format_token(t.raw(), self.group_size))
    }

    pub async fn expiry(&self) -> Option<DateTime<Utc>> {
        self.current_token().await.map(|t| t.expires_at())
    }

    /// Time left on the current token.
    pub async fn remaining(&self) -> Option<chrono::Duration> {
        let now = self.clock.now();
        self.current_token().await.map(|t| t.remaining_at(now))
    }

    /// Removes the token from memory and storage. Idempotent.
    pub async fn clear(&self) -> BridgeResult<()> {
        self.store.remove_all(&keys::TOKEN_KEYS).await?;
        if let Some(previous) = self.current.write().await.take() {
            debug!(token_prefix = %previous.log_prefix(), "Connection token cleared");
        }
        Ok(())
    }

    /// Clears only if `token` is still the current one.
    pub async fn discard(&self, token: &ConnectionToken) -> BridgeResult<()> {
        let is_current = self
            .current
            .read()
            .await
            .as_ref()
            .map(|current| current.raw() == token.raw())
            .unwrap_or(false);
        if is_current {
            self.clear().await?;
        }
        Ok(())
    }

    /// Loads a persisted token, clearing it when expired or unreadable.
    pub async fn restore(&self) -> BridgeResult<Option<ConnectionToken>> {
        let raw = self.store.get_string(keys::CONNECTION_TOKEN).await?;
        let issued_at = self.read_timestamp(keys::CONNECTION_TOKEN_ISSUED_AT).await?;
        let expires_at = self.read_timestamp(keys::CONNECTION_TOKEN_EXPIRES_AT).await?;

        let (raw, issued_at, expires_at) = match (raw, issued_at, expires_at) {
            (Some(raw), Some(issued_at), Some(expires_at)) => (raw, issued_at, expires_at),
            (None, None, None) => return Ok(None),
            _ => {
                warn!("Incomplete persisted token, clearing");
                self.clear().await?;
                return Ok(None);
            }
        };

        let token = ConnectionToken::with_expiry(&raw, issued_at, expires_at);
        if !token.is_valid_at(self.clock.now()) {
            info!(token_prefix = %token.log_prefix(), "Persisted token expired, clearing");
            self.clear().await?;
            return Ok(None);
        }

        debug!(token_prefix = %token.log_prefix(), "Restored connection token");
        *self.current.write().await = Some(token.clone());
        Ok(Some(token))
    }

    async fn persist(&self, token: &ConnectionToken) -> BridgeResult<()> {
        self.store
            .set(keys::CONNECTION_TOKEN, PrefValue::from(token.raw()))
            .await?;
        self.store
            .set(
                keys::CONNECTION_TOKEN_ISSUED_AT,
                PrefValue::from(token.issued_at().to_rfc3339()),
            )
            .await?;
        self.store
            .set(
                keys::CONNECTION_TOKEN_EXPIRES_AT,
                PrefValue::from(token.expires_at().to_rfc3339()),
            )
            .await
    }

    async fn read_timestamp(&self, key: &str) -> BridgeResult<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_string(key)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{ManualClock, MemoryStore, SimulatedHub};
    use chrono::TimeZone;
    use wellbridge_core::Platform;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            device_name: "Pixel".into(),
            platform: Platform::Android,
        }
    }

    fn manager(hub: Arc<SimulatedHub>, store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> TokenManager {
        TokenManager::new(hub, store, clock, device(), chrono::Duration::minutes(30), 4)
    }

    #[tokio::test]
    async fn test_generate_persists_before_returning() {
        let hub = Arc::new(SimulatedHub::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tokens = manager(hub, store.clone(), clock);

        let token = tokens.generate().await.unwrap();

        assert_eq!(
            store.get_string(keys::CONNECTION_TOKEN).await.unwrap().as_deref(),
            Some(token.raw())
        );
        assert!(store
            .get_string(keys::CONNECTION_TOKEN_EXPIRES_AT)
            .await
            .unwrap()
            .is_some());
        assert_eq!(tokens.formatted_token().await.unwrap(), "TKN0-0001");
    }

    #[tokio::test]
    async fn test_failed_generate_keeps_previous_token() {
        let hub = Arc::new(SimulatedHub::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tokens = manager(hub.clone(), store.clone(), clock);

        let first = tokens.generate().await.unwrap();
        hub.fail_next_token(BridgeError::Network("offline".into()));

        assert!(tokens.generate().await.is_err());
        assert_eq!(tokens.current_token().await, Some(first.clone()));
        assert_eq!(
            store.get_string(keys::CONNECTION_TOKEN).await.unwrap().as_deref(),
            Some(first.raw())
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_not_current() {
        let hub = Arc::new(SimulatedHub::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tokens = manager(hub, store, clock.clone());

        tokens.generate().await.unwrap();
        clock.advance(chrono::Duration::minutes(30));

        assert!(tokens.current_token().await.is_none());
        assert!(tokens.expiry().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let hub = Arc::new(SimulatedHub::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tokens = manager(hub, store.clone(), clock);

        tokens.generate().await.unwrap();
        tokens.clear().await.unwrap();
        tokens.clear().await.unwrap();

        assert!(tokens.current_token().await.is_none());
        assert!(store.get(keys::CONNECTION_TOKEN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_drops_expired_token() {
        let hub = Arc::new(SimulatedHub::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));

        manager(hub.clone(), store.clone(), clock.clone())
            .generate()
            .await
            .unwrap();

        let fresh = manager(hub.clone(), store.clone(), clock.clone());
        assert!(fresh.restore().await.unwrap().is_some());

        clock.advance(chrono::Duration::hours(1));
        let later = manager(hub, store.clone(), clock);
        assert!(later.restore().await.unwrap().is_none());
        assert!(store.get(keys::CONNECTION_TOKEN).await.unwrap().is_none());
    }
}
