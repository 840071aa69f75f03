//! # Preference Repository
//!
//! Typed key-value storage for primitive values.
//!
//! ## Storage Format
//! ```text
//! ┌──────────────────────────────────────┬──────────────┬────────────┐
//! │ key                                  │ value (TEXT) │ value_type │
//! ├──────────────────────────────────────┼──────────────┼────────────┤
//! │ wellbridge.profile.name              │ Ada          │ string     │
//! │ wellbridge.profile.age               │ 36           │ int        │
//! │ wellbridge.profile.weight_kg         │ 61.5         │ double     │
//! │ wellbridge.onboarding.complete       │ true         │ bool       │
//! └──────────────────────────────────────┴──────────────┴────────────┘
//! ```
//!
//! Typed getters return `None` when the stored type differs from the one
//! asked for, the same as a missing key.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

// =============================================================================
// Preference Value
// =============================================================================

/// A primitive preference value.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl PrefValue {
    /// Type tag written next to the value.
    pub fn type_tag(&self) -> &'static str {
        match self {
            PrefValue::Str(_) => "string",
            PrefValue::Int(_) => "int",
            PrefValue::Double(_) => "double",
            PrefValue::Bool(_) => "bool",
        }
    }

    /// Text form stored in the `value` column.
    pub fn encode(&self) -> String {
        match self {
            PrefValue::Str(s) => s.clone(),
            PrefValue::Int(i) => i.to_string(),
            PrefValue::Double(d) => d.to_string(),
            PrefValue::Bool(b) => b.to_string(),
        }
    }

    /// Rebuilds a value from its stored text and tag.
    pub fn decode(key: &str, value: &str, type_tag: &str) -> DbResult<Self> {
        let bad = |reason: String| DbError::corrupt(key, reason);
        match type_tag {
            "string" => Ok(PrefValue::Str(value.to_string())),
            "int" => value
                .parse()
                .map(PrefValue::Int)
                .map_err(|e| bad(format!("not an int: {}", e))),
            "double" => value
                .parse()
                .map(PrefValue::Double)
                .map_err(|e| bad(format!("not a double: {}", e))),
            "bool" => value
                .parse()
                .map(PrefValue::Bool)
                .map_err(|e| bad(format!("not a bool: {}", e))),
            other => Err(bad(format!("unknown type tag '{}'", other))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrefValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PrefValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            PrefValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for PrefValue {
    fn from(value: &str) -> Self {
        PrefValue::Str(value.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(value: String) -> Self {
        PrefValue::Str(value)
    }
}

impl From<i64> for PrefValue {
    fn from(value: i64) -> Self {
        PrefValue::Int(value)
    }
}

impl From<f64> for PrefValue {
    fn from(value: f64) -> Self {
        PrefValue::Double(value)
    }
}

impl From<bool> for PrefValue {
    fn from(value: bool) -> Self {
        PrefValue::Bool(value)
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the `preferences` table.
#[derive(Debug, Clone)]
pub struct PreferenceRepository {
    pool: SqlitePool,
}

impl PreferenceRepository {
    /// Creates a new PreferenceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PreferenceRepository { pool }
    }

    /// Reads a value, whatever its type.
    pub async fn get(&self, key: &str) -> DbResult<Option<PrefValue>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, value_type FROM preferences WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(value, tag)| PrefValue::decode(key, &value, &tag))
            .transpose()
    }

    pub async fn get_string(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.get(key).await?.and_then(|v| match v {
            PrefValue::Str(s) => Some(s),
            _ => None,
        }))
    }

    pub async fn get_int(&self, key: &str) -> DbResult<Option<i64>> {
        Ok(self.get(key).await?.and_then(|v| v.as_int()))
    }

    pub async fn get_double(&self, key: &str) -> DbResult<Option<f64>> {
        Ok(self.get(key).await?.and_then(|v| v.as_double()))
    }

    pub async fn get_bool(&self, key: &str) -> DbResult<Option<bool>> {
        Ok(self.get(key).await?.and_then(|v| v.as_bool()))
    }

    /// Writes a value, replacing any previous value and type.
    pub async fn set(&self, key: &str, value: impl Into<PrefValue>) -> DbResult<()> {
        let value = value.into();
        debug!(key = %key, value_type = value.type_tag(), "Writing preference");

        sqlx::query(
            r#"
            INSERT INTO preferences (key, value, value_type, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.encode())
        .bind(value.type_tag())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a key. Removing a missing key is not an error.
    pub async fn remove(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM preferences WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes several keys in one transaction.
    pub async fn remove_all(&self, keys: &[&str]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("DELETE FROM preferences WHERE key = ?1")
                .bind(*key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> DbResult<Vec<String>> {
        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM preferences WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys.into_iter().map(|(k,)| k).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::{Database, DbConfig};

    async fn repo() -> PreferenceRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.preferences()
    }

    #[test]
    fn test_decode_rejects_bad_text() {
        assert!(PrefValue::decode("k", "12x", "int").is_err());
        assert!(PrefValue::decode("k", "yes", "bool").is_err());
        assert!(PrefValue::decode("k", "1", "blob").is_err());
        assert_eq!(
            PrefValue::decode("k", "61.5", "double").unwrap(),
            PrefValue::Double(61.5)
        );
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let prefs = repo().await;

        prefs.set(keys::PROFILE_NAME, "Ada").await.unwrap();
        prefs.set(keys::PROFILE_AGE, 36i64).await.unwrap();
        prefs.set(keys::PROFILE_WEIGHT_KG, 61.5).await.unwrap();
        prefs.set(keys::ONBOARDING_COMPLETE, true).await.unwrap();

        assert_eq!(
            prefs.get_string(keys::PROFILE_NAME).await.unwrap().as_deref(),
            Some("Ada")
        );
        assert_eq!(prefs.get_int(keys::PROFILE_AGE).await.unwrap(), Some(36));
        assert_eq!(
            prefs.get_double(keys::PROFILE_WEIGHT_KG).await.unwrap(),
            Some(61.5)
        );
        assert_eq!(
            prefs.get_bool(keys::ONBOARDING_COMPLETE).await.unwrap(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_wrong_type_reads_as_missing() {
        let prefs = repo().await;
        prefs.set(keys::PROFILE_AGE, "thirty").await.unwrap();
        assert_eq!(prefs.get_int(keys::PROFILE_AGE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_changes_type() {
        let prefs = repo().await;
        prefs.set(keys::WELCOME_SEEN, "maybe").await.unwrap();
        prefs.set(keys::WELCOME_SEEN, true).await.unwrap();
        assert_eq!(prefs.get_bool(keys::WELCOME_SEEN).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let prefs = repo().await;
        prefs.set(keys::CONNECTION_TOKEN, "AB3D9KQ2").await.unwrap();
        prefs.remove(keys::CONNECTION_TOKEN).await.unwrap();
        prefs.remove(keys::CONNECTION_TOKEN).await.unwrap();
        assert_eq!(prefs.get(keys::CONNECTION_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_listing_and_bulk_remove() {
        let prefs = repo().await;
        prefs.set(keys::CONNECTION_TOKEN, "AB3D9KQ2").await.unwrap();
        prefs.set(keys::CONNECTION_DEVICE_NAME, "Pixel").await.unwrap();
        prefs.set(keys::PROFILE_NAME, "Ada").await.unwrap();

        let listed = prefs.keys_with_prefix(keys::CONNECTION_PREFIX).await.unwrap();
        assert_eq!(
            listed,
            vec![
                keys::CONNECTION_DEVICE_NAME.to_string(),
                keys::CONNECTION_TOKEN.to_string()
            ]
        );

        prefs.remove_all(&keys::TOKEN_KEYS).await.unwrap();
        assert_eq!(prefs.get(keys::CONNECTION_TOKEN).await.unwrap(), None);
        assert!(prefs.get(keys::PROFILE_NAME).await.unwrap().is_some());
    }
}
