//! # Health Permission Bridge
//!
//! Uniform permission facade over Health Connect and HealthKit.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     request_permissions(identifiers)                    │
//! │                                                                         │
//! │  expand identifiers ("physical_activity" → steps, exercise, ...)       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  take in-flight latch ──busy──► Err(RequestInFlight)                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  launch system dialog with a PermissionReply slot                      │
//! │        │ ok                            │ launch failed                  │
//! │        ▼                               ▼                                │
//! │  dialog resolves reply          open settings, sleep settle delay,     │
//! │                                 re-check grants, resolve reply         │
//! │        │                               │                                │
//! │        └──────────────┬────────────────┘                                │
//! │                       ▼                                                 │
//! │  await reply (resolved exactly once) ──► release latch ──► Ok(bool)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use wellbridge_core::permission::{ExpandedRequest, ServiceAvailability};
use wellbridge_core::{HealthAuthorization, HealthPermission, PlatformCapabilities};

use crate::error::{BridgeError, BridgeResult};
use crate::ports::NativeHealthPlatform;

// =============================================================================
// Permission Reply
// =============================================================================

/// Single-slot completion handed to the native layer.
///
/// Cloneable so that both the dialog callback and the settings fallback can
/// hold it; only the first `resolve` delivers.
#[derive(Debug, Clone)]
pub struct PermissionReply {
    slot: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
}

impl PermissionReply {
    fn channel() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let reply = PermissionReply {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (reply, rx)
    }

    /// Delivers the dialog outcome. Returns false if already resolved.
    pub fn resolve(&self, granted: bool) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(granted);
                true
            }
            None => {
                debug!("Permission reply already resolved");
                false
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Clears the in-flight latch when the request ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Permission facade used by the health bloc.
pub struct HealthPermissionBridge {
    platform: Arc<dyn NativeHealthPlatform>,
    capabilities: PlatformCapabilities,
    settings_fallback_delay: Duration,
    in_flight: AtomicBool,
    /// Grants inferred from completed dialogs where reads are not reported.
    assumed: RwLock<BTreeSet<HealthPermission>>,
}

impl HealthPermissionBridge {
    pub fn new(
        platform: Arc<dyn NativeHealthPlatform>,
        capabilities: PlatformCapabilities,
        settings_fallback_delay: Duration,
    ) -> Self {
        HealthPermissionBridge {
            platform,
            capabilities,
            settings_fallback_delay,
            in_flight: AtomicBool::new(false),
            assumed: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    /// Whether the health service is present and usable.
    pub async fn check_availability(&self) -> BridgeResult<ServiceAvailability> {
        self.platform.availability().await
    }

    /// True while a system dialog is waiting on the user.
    pub fn is_request_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The effective granted set.
    pub async fn granted(&self) -> BridgeResult<BTreeSet<HealthPermission>> {
        let mut granted = self.platform.granted_permissions().await?;
        if !self.capabilities.reports_read_grants {
            granted.extend(self.assumed.read().await.iter().copied());
        }
        Ok(granted)
    }

    /// Grant state per requested type. No side effects.
    pub async fn check_permissions(
        &self,
        types: &BTreeSet<HealthPermission>,
    ) -> BridgeResult<BTreeMap<HealthPermission, bool>> {
        let granted = self.granted().await?;
        Ok(types.iter().map(|p| (*p, granted.contains(p))).collect())
    }

    /// Like [`check_permissions`](Self::check_permissions) for vocabulary
    /// identifiers.
    pub async fn check_identifiers<I, S>(
        &self,
        identifiers: I,
    ) -> BridgeResult<BTreeMap<HealthPermission, bool>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let request = ExpandedRequest::from_identifiers(identifiers);
        warn_unknown(&request.unknown);
        self.check_permissions(&request.permissions).await
    }

    /// Authorization derived from availability and the granted set.
    pub async fn authorization(&self) -> BridgeResult<HealthAuthorization> {
        if self.is_request_in_flight() {
            return Ok(HealthAuthorization::prompting());
        }
        let availability = self.check_availability().await?;
        if !availability.is_available() {
            return Ok(HealthAuthorization::unavailable());
        }
        let granted = self.granted().await?;
        Ok(HealthAuthorization::evaluate(granted, availability))
    }

    pub async fn open_settings(&self) -> BridgeResult<()> {
        info!(service = %self.capabilities.health_service, "Opening health settings");
        self.platform.open_settings().await
    }

    /// Asks the user for the expanded set of `identifiers`.
    ///
    /// Returns true when every requested permission ended up granted. Fails
    /// with `RequestInFlight` while another request is pending and with
    /// `PermissionUnavailable` when the service cannot grant anything.
    pub async fn request_permissions<I, S>(&self, identifiers: I) -> BridgeResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let request = ExpandedRequest::from_identifiers(identifiers);
        warn_unknown(&request.unknown);
        if request.is_empty() {
            debug!("Nothing recognizable to request");
            return Ok(true);
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Permission request rejected: another request is pending");
            return Err(BridgeError::RequestInFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let availability = self.check_availability().await?;
        if !availability.is_available() {
            return Err(BridgeError::PermissionUnavailable(format!(
                "{} ({:?})",
                self.capabilities.health_service, availability.status
            )));
        }

        let permissions = request.permissions;
        info!(
            count = permissions.len(),
            service = %self.capabilities.health_service,
            "Requesting health permissions"
        );

        let (reply, outcome) = PermissionReply::channel();
        if let Err(e) = self
            .platform
            .launch_permission_request(&permissions, reply.clone())
        {
            warn!(?e, "Permission dialog failed to launch, falling back to settings");
            self.settings_fallback(&permissions, reply).await;
        }

        let completed = match outcome.await {
            Ok(completed) => {
                debug!(completed, "Permission dialog resolved");
                completed
            }
            Err(_) => {
                debug!("Permission reply dropped without a result");
                false
            }
        };

        if completed && !self.capabilities.reports_read_grants {
            let assumed = self.assumable(&permissions).await?;
            self.assumed.write().await.extend(assumed);
        }

        let granted = self.granted().await?;
        let all_granted = permissions.is_subset(&granted);
        info!(
            all_granted,
            granted = permissions.intersection(&granted).count(),
            requested = permissions.len(),
            "Permission request finished"
        );
        Ok(all_granted)
    }

    /// Grants a completed dialog lets us assume when reads are not reported.
    ///
    /// If the platform reports any of `requested` as granted, it is reporting
    /// this dialog's outcome and nothing beyond that set is assumed. Only a
    /// dialog whose grants are entirely hidden is taken as granting everything.
    async fn assumable(
        &self,
        requested: &BTreeSet<HealthPermission>,
    ) -> BridgeResult<BTreeSet<HealthPermission>> {
        let visible: BTreeSet<HealthPermission> = self
            .platform
            .granted_permissions()
            .await?
            .intersection(requested)
            .copied()
            .collect();
        if visible.is_empty() {
            Ok(requested.clone())
        } else {
            debug!(
                visible = visible.len(),
                requested = requested.len(),
                "Platform reported dialog grants, assuming nothing further"
            );
            Ok(visible)
        }
    }

    /// Opens settings and resolves `reply` after the settle delay.
    async fn settings_fallback(&self, permissions: &BTreeSet<HealthPermission>, reply: PermissionReply) {
        if let Err(e) = self.platform.open_settings().await {
            warn!(?e, "Opening health settings failed");
        }

        let platform = Arc::clone(&self.platform);
        let delay = self.settings_fallback_delay;
        let permissions = permissions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let granted = match platform.granted_permissions().await {
                Ok(granted) => permissions.is_subset(&granted),
                Err(e) => {
                    warn!(?e, "Re-checking grants after settings failed");
                    false
                }
            };
            reply.resolve(granted);
        });
    }
}

fn warn_unknown(unknown: &[String]) {
    for identifier in unknown {
        warn!(identifier = %identifier, "Ignoring unknown health permission identifier");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_resolves_once() {
        let (reply, mut rx) = PermissionReply::channel();
        let other = reply.clone();

        assert!(!reply.is_resolved());
        assert!(reply.resolve(true));
        assert!(!other.resolve(false));
        assert!(other.is_resolved());
        assert_eq!(rx.try_recv().ok(), Some(true));
    }

    #[test]
    fn test_guard_releases_latch() {
        let latch = AtomicBool::new(true);
        {
            let _guard = InFlightGuard(&latch);
        }
        assert!(!latch.load(Ordering::Acquire));
    }
}
