//! Local profile and onboarding flags, stored field by field under
//! `wellbridge.profile.*` so partial writes stay readable.

use std::sync::Arc;

use tracing::{debug, warn};

use wellbridge_core::UserProfile;
use wellbridge_db::{keys, PrefValue};

use crate::error::BridgeResult;
use crate::ports::KeyValueStore;

/// Profile persistence on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<dyn KeyValueStore>,
}

impl ProfileStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        ProfileStore { store }
    }

    /// The saved profile, or `None` when nothing was ever saved.
    ///
    /// Unparseable enum values are dropped so the profile shows up as
    /// incomplete instead of failing the load.
    pub async fn load(&self) -> BridgeResult<Option<UserProfile>> {
        let Some(user_id) = self.store.get_string(keys::PROFILE_USER_ID).await? else {
            return Ok(None);
        };
        let name = self.store.get_string(keys::PROFILE_NAME).await?.unwrap_or_default();
        let email = self.store.get_string(keys::PROFILE_EMAIL).await?.unwrap_or_default();

        let mut profile = UserProfile::new(user_id, name, email);
        profile.phone = self.store.get_string(keys::PROFILE_PHONE).await?;
        profile.age = self
            .store
            .get_int(keys::PROFILE_AGE)
            .await?
            .and_then(|age| u32::try_from(age).ok());
        profile.gender = self
            .store
            .get_string(keys::PROFILE_GENDER)
            .await?
            .and_then(|g| match g.parse() {
                Ok(gender) => Some(gender),
                Err(_) => {
                    warn!(value = %g, "Ignoring stored gender");
                    None
                }
            });
        profile.height_cm = self.store.get_double(keys::PROFILE_HEIGHT_CM).await?;
        profile.weight_kg = self.store.get_double(keys::PROFILE_WEIGHT_KG).await?;
        profile.activity_level = self
            .store
            .get_string(keys::PROFILE_ACTIVITY_LEVEL)
            .await?
            .and_then(|a| match a.parse() {
                Ok(level) => Some(level),
                Err(_) => {
                    warn!(value = %a, "Ignoring stored activity level");
                    None
                }
            });

        Ok(Some(profile))
    }

    /// Writes every field; absent optional fields are removed.
    pub async fn save(&self, profile: &UserProfile) -> BridgeResult<()> {
        self.store
            .set(keys::PROFILE_USER_ID, PrefValue::from(profile.user_id.as_str()))
            .await?;
        self.store
            .set(keys::PROFILE_NAME, PrefValue::from(profile.name.as_str()))
            .await?;
        self.store
            .set(keys::PROFILE_EMAIL, PrefValue::from(profile.email.as_str()))
            .await?;

        self.put(keys::PROFILE_PHONE, profile.phone.as_deref().map(PrefValue::from))
            .await?;
        self.put(keys::PROFILE_AGE, profile.age.map(|a| PrefValue::from(i64::from(a))))
            .await?;
        self.put(
            keys::PROFILE_GENDER,
            profile.gender.map(|g| PrefValue::from(g.to_string())),
        )
        .await?;
        self.put(keys::PROFILE_HEIGHT_CM, profile.height_cm.map(PrefValue::from))
            .await?;
        self.put(keys::PROFILE_WEIGHT_KG, profile.weight_kg.map(PrefValue::from))
            .await?;
        self.put(
            keys::PROFILE_ACTIVITY_LEVEL,
            profile.activity_level.map(|a| PrefValue::from(a.to_string())),
        )
        .await?;

        debug!(user_id = %profile.user_id, "Profile saved");
        Ok(())
    }

    async fn put(&self, key: &str, value: Option<PrefValue>) -> BridgeResult<()> {
        match value {
            Some(value) => self.store.set(key, value).await,
            None => self.store.remove(key).await,
        }
    }

    pub async fn is_profile_complete(&self) -> BridgeResult<bool> {
        Ok(self.store.get_bool(keys::PROFILE_COMPLETE).await?.unwrap_or(false))
    }

    pub async fn set_profile_complete(&self, complete: bool) -> BridgeResult<()> {
        self.store.set(keys::PROFILE_COMPLETE, PrefValue::from(complete)).await
    }

    pub async fn is_onboarding_complete(&self) -> BridgeResult<bool> {
        Ok(self
            .store
            .get_bool(keys::ONBOARDING_COMPLETE)
            .await?
            .unwrap_or(false))
    }

    pub async fn set_onboarding_complete(&self, complete: bool) -> BridgeResult<()> {
        self.store
            .set(keys::ONBOARDING_COMPLETE, PrefValue::from(complete))
            .await
    }

    pub async fn has_seen_welcome(&self) -> BridgeResult<bool> {
        Ok(self.store.get_bool(keys::WELCOME_SEEN).await?.unwrap_or(false))
    }

    pub async fn mark_welcome_seen(&self) -> BridgeResult<()> {
        self.store.set(keys::WELCOME_SEEN, PrefValue::from(true)).await
    }

    /// Forgets the profile and onboarding flags. The welcome flag survives
    /// sign-out.
    pub async fn clear(&self) -> BridgeResult<()> {
        self.store
            .remove_all(&[
                keys::PROFILE_USER_ID,
                keys::PROFILE_NAME,
                keys::PROFILE_EMAIL,
                keys::PROFILE_PHONE,
                keys::PROFILE_AGE,
                keys::PROFILE_GENDER,
                keys::PROFILE_HEIGHT_CM,
                keys::PROFILE_WEIGHT_KG,
                keys::PROFILE_ACTIVITY_LEVEL,
                keys::PROFILE_COMPLETE,
                keys::ONBOARDING_COMPLETE,
            ])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::MemoryStore;
    use wellbridge_core::profile::{ActivityLevel, Gender};

    fn store() -> (Arc<MemoryStore>, ProfileStore) {
        let memory = Arc::new(MemoryStore::new());
        let profiles = ProfileStore::new(memory.clone());
        (memory, profiles)
    }

    #[tokio::test]
    async fn test_profile_survives_save_and_load() {
        let (_, profiles) = store();
        assert!(profiles.load().await.unwrap().is_none());

        let mut profile = UserProfile::new("user-7", "Ada", "ada@example.com");
        profile.age = Some(36);
        profile.gender = Some(Gender::Female);
        profile.height_cm = Some(168.0);
        profile.weight_kg = Some(61.5);
        profile.activity_level = Some(ActivityLevel::Active);
        profiles.save(&profile).await.unwrap();

        assert_eq!(profiles.load().await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn test_cleared_fields_are_removed() {
        let (memory, profiles) = store();
        let mut profile = UserProfile::new("user-7", "Ada", "ada@example.com");
        profile.phone = Some("+15550100".into());
        profiles.save(&profile).await.unwrap();

        profile.phone = None;
        profiles.save(&profile).await.unwrap();
        assert!(memory.get(keys::PROFILE_PHONE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_keeps_welcome_flag() {
        let (_, profiles) = store();
        profiles
            .save(&UserProfile::new("user-7", "Ada", "ada@example.com"))
            .await
            .unwrap();
        profiles.set_onboarding_complete(true).await.unwrap();
        profiles.mark_welcome_seen().await.unwrap();

        profiles.clear().await.unwrap();

        assert!(profiles.load().await.unwrap().is_none());
        assert!(!profiles.is_onboarding_complete().await.unwrap());
        assert!(profiles.has_seen_welcome().await.unwrap());
    }
}
