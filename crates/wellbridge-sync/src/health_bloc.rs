//! # Health Bloc
//!
//! Serialized command queue over the permission bridge and the sync
//! orchestrator. Long-running work (system dialogs, sync phases) runs in
//! spawned tasks that report back through the same queue, so the bloc keeps
//! answering while they are suspended.
//!
//! ```text
//!  HealthHandle ──cmd──► ┌──────────────┐ ──spawn──► permission task ─┐
//!                        │  HealthBloc  │ ──spawn──► phase task ──────┤
//!  watch<HealthState> ◄──│  (one cmd at │                             │
//!                        │   a time)    │ ◄── PermissionsFinished ────┘
//!                        └──────────────┘ ◄── PhaseFinished
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wellbridge_core::permission::ServiceAvailability;
use wellbridge_core::progress::SyncSummary;
use wellbridge_core::{
    HealthAuthorization, HealthPermission, HealthPermissionStatus, PlatformCapabilities,
    SyncPhase, SyncProgress,
};

use crate::error::{BridgeError, BridgeResult};
use crate::health_sync::{HealthSyncOrchestrator, PhaseOutcome, SyncJob};
use crate::permissions::HealthPermissionBridge;
use crate::progress::SyncProgressTracker;

// =============================================================================
// State
// =============================================================================

/// Published health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub capabilities: PlatformCapabilities,
    pub availability: Option<ServiceAvailability>,
    /// None until the first check.
    pub authorization: Option<HealthAuthorization>,
    pub running: Vec<SyncPhase>,
    pub last_body_prep: Option<SyncSummary>,
    pub last_digital_twin: Option<SyncSummary>,
    pub error_message: Option<String>,
}

impl HealthState {
    fn new(capabilities: PlatformCapabilities) -> Self {
        HealthState {
            capabilities,
            availability: None,
            authorization: None,
            running: Vec::new(),
            last_body_prep: None,
            last_digital_twin: None,
            error_message: None,
        }
    }

    pub fn permission_status(&self) -> Option<HealthPermissionStatus> {
        self.authorization.as_ref().map(|a| a.status)
    }

    pub fn is_syncing(&self, phase: SyncPhase) -> bool {
        self.running.contains(&phase)
    }

    pub fn last_summary(&self, phase: SyncPhase) -> Option<&SyncSummary> {
        match phase {
            SyncPhase::BodyPrep => self.last_body_prep.as_ref(),
            SyncPhase::DigitalTwin => self.last_digital_twin.as_ref(),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

enum HealthCommand {
    Refresh {
        reply: oneshot::Sender<BridgeResult<HealthState>>,
    },
    RequestPermissions {
        identifiers: Vec<String>,
        reply: oneshot::Sender<BridgeResult<HealthAuthorization>>,
    },
    PermissionsFinished {
        result: BridgeResult<bool>,
        reply: oneshot::Sender<BridgeResult<HealthAuthorization>>,
    },
    OpenSettings {
        reply: oneshot::Sender<BridgeResult<()>>,
    },
    StartSync {
        phase: SyncPhase,
        reply: oneshot::Sender<SyncJob>,
    },
    PhaseFinished {
        phase: SyncPhase,
        outcome: PhaseOutcome,
    },
    WatchProgress {
        phase: SyncPhase,
        reply: oneshot::Sender<Option<watch::Receiver<SyncProgress>>>,
    },
    CancelSync {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the health bloc.
#[derive(Clone)]
pub struct HealthHandle {
    tx: mpsc::Sender<HealthCommand>,
    state: watch::Receiver<HealthState>,
    bridge: Arc<HealthPermissionBridge>,
}

impl HealthHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HealthCommand) -> BridgeResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;
        rx.await.map_err(|_| BridgeError::ShuttingDown)
    }

    /// Re-reads availability and grants.
    pub async fn refresh(&self) -> BridgeResult<HealthState> {
        self.call(|reply| HealthCommand::Refresh { reply }).await?
    }

    /// Grant state per type. No side effects.
    pub async fn check_permissions(
        &self,
        types: &BTreeSet<HealthPermission>,
    ) -> BridgeResult<BTreeMap<HealthPermission, bool>> {
        self.bridge.check_permissions(types).await
    }

    pub async fn check_identifiers(
        &self,
        identifiers: &[String],
    ) -> BridgeResult<BTreeMap<HealthPermission, bool>> {
        self.bridge.check_identifiers(identifiers).await
    }

    /// Runs the interactive request; resolves once the user has answered.
    pub async fn request_permissions(
        &self,
        identifiers: Vec<String>,
    ) -> BridgeResult<HealthAuthorization> {
        self.call(|reply| HealthCommand::RequestPermissions { identifiers, reply })
            .await?
    }

    pub async fn open_settings(&self) -> BridgeResult<()> {
        self.call(|reply| HealthCommand::OpenSettings { reply }).await?
    }

    /// Starts `phase`, or joins it if already running.
    pub async fn start_sync(&self, phase: SyncPhase) -> BridgeResult<SyncJob> {
        self.call(|reply| HealthCommand::StartSync { phase, reply }).await
    }

    /// Progress of the running or most recent run of `phase`.
    pub async fn watch_progress(
        &self,
        phase: SyncPhase,
    ) -> BridgeResult<Option<watch::Receiver<SyncProgress>>> {
        self.call(|reply| HealthCommand::WatchProgress { phase, reply })
            .await
    }

    /// Aborts every running phase.
    pub async fn cancel_sync(&self) -> BridgeResult<()> {
        self.call(|reply| HealthCommand::CancelSync { reply }).await
    }

    pub fn state(&self) -> HealthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.clone()
    }

    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.tx
            .send(HealthCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelError("health bloc already stopped".into()))
    }
}

// =============================================================================
// Bloc
// =============================================================================

struct RunningPhase {
    job: SyncJob,
    task: JoinHandle<()>,
}

/// Owns permission and sync state.
pub struct HealthBloc {
    bridge: Arc<HealthPermissionBridge>,
    orchestrator: Arc<HealthSyncOrchestrator>,
    rx: mpsc::Receiver<HealthCommand>,
    inbox: mpsc::WeakSender<HealthCommand>,
    state_tx: watch::Sender<HealthState>,
    permission_active: bool,
    runs: HashMap<SyncPhase, RunningPhase>,
    last_progress: HashMap<SyncPhase, watch::Receiver<SyncProgress>>,
}

impl HealthBloc {
    pub fn new(
        bridge: Arc<HealthPermissionBridge>,
        orchestrator: Arc<HealthSyncOrchestrator>,
    ) -> (Self, HealthHandle) {
        let (tx, rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(HealthState::new(bridge.capabilities()));

        let bloc = HealthBloc {
            bridge: Arc::clone(&bridge),
            orchestrator,
            rx,
            inbox: tx.downgrade(),
            state_tx,
            permission_active: false,
            runs: HashMap::new(),
            last_progress: HashMap::new(),
        };
        let handle = HealthHandle {
            tx,
            state: state_rx,
            bridge,
        };
        (bloc, handle)
    }

    /// Creates the bloc and runs it on the current runtime.
    pub fn spawn(
        bridge: Arc<HealthPermissionBridge>,
        orchestrator: Arc<HealthSyncOrchestrator>,
    ) -> (HealthHandle, JoinHandle<()>) {
        let (bloc, handle) = HealthBloc::new(bridge, orchestrator);
        (handle, tokio::spawn(bloc.run()))
    }

    pub async fn run(mut self) {
        info!("Health bloc starting");
        self.load_history().await;
        if let Err(e) = self.refresh_authorization().await {
            warn!(error = %e, "Initial permission check failed");
        }

        while let Some(command) = self.rx.recv().await {
            match command {
                HealthCommand::Refresh { reply } => {
                    let result = self
                        .refresh_authorization()
                        .await
                        .map(|_| self.state_tx.borrow().clone());
                    let _ = reply.send(result);
                }
                HealthCommand::RequestPermissions { identifiers, reply } => {
                    self.start_permission_request(identifiers, reply)
                }
                HealthCommand::PermissionsFinished { result, reply } => {
                    let outcome = self.finish_permission_request(result).await;
                    let _ = reply.send(outcome);
                }
                HealthCommand::OpenSettings { reply } => {
                    let _ = reply.send(self.bridge.open_settings().await);
                }
                HealthCommand::StartSync { phase, reply } => {
                    let _ = reply.send(self.start_phase(phase));
                }
                HealthCommand::PhaseFinished { phase, outcome } => {
                    self.finish_phase(phase, outcome)
                }
                HealthCommand::WatchProgress { phase, reply } => {
                    let progress = self
                        .runs
                        .get(&phase)
                        .map(|run| run.job.progress())
                        .or_else(|| self.last_progress.get(&phase).cloned());
                    let _ = reply.send(progress);
                }
                HealthCommand::CancelSync { reply } => {
                    self.cancel_all();
                    let _ = reply.send(());
                }
                HealthCommand::Shutdown => break,
            }
        }

        self.cancel_all();
        info!("Health bloc stopped");
    }

    fn publish(&self, f: impl FnOnce(&mut HealthState)) {
        self.state_tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    async fn load_history(&self) {
        let Some(history) = self.orchestrator.history() else {
            return;
        };
        for phase in [SyncPhase::BodyPrep, SyncPhase::DigitalTwin] {
            match history.latest(phase).await {
                Ok(Some(record)) => self.publish(|s| match phase {
                    SyncPhase::BodyPrep => s.last_body_prep = Some(record.summary),
                    SyncPhase::DigitalTwin => s.last_digital_twin = Some(record.summary),
                }),
                Ok(None) => {}
                Err(e) => warn!(phase = %phase, error = %e, "Failed to load sync history"),
            }
        }
    }

    async fn refresh_authorization(&self) -> BridgeResult<HealthAuthorization> {
        let result = async {
            let availability = self.bridge.check_availability().await?;
            let authorization = self.bridge.authorization().await?;
            Ok::<_, BridgeError>((availability, authorization))
        }
        .await;

        match result {
            Ok((availability, authorization)) => {
                debug!(status = ?authorization.status, "Health authorization refreshed");
                let published = authorization.clone();
                self.publish(|s| {
                    s.availability = Some(availability);
                    s.authorization = Some(published);
                });
                Ok(authorization)
            }
            Err(e) => {
                let message = e.to_string();
                self.publish(|s| s.error_message = Some(message));
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Permissions
    // -------------------------------------------------------------------------

    fn start_permission_request(
        &mut self,
        identifiers: Vec<String>,
        reply: oneshot::Sender<BridgeResult<HealthAuthorization>>,
    ) {
        if self.permission_active {
            let _ = reply.send(Err(BridgeError::RequestInFlight));
            return;
        }
        self.permission_active = true;
        self.publish(|s| {
            s.authorization = Some(HealthAuthorization::prompting());
            s.error_message = None;
        });

        let bridge = Arc::clone(&self.bridge);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = bridge.request_permissions(&identifiers).await;
            match inbox.upgrade() {
                Some(inbox) => {
                    let _ = inbox
                        .send(HealthCommand::PermissionsFinished { result, reply })
                        .await;
                }
                None => debug!("Health bloc gone before permission result"),
            }
        });
    }

    async fn finish_permission_request(
        &mut self,
        result: BridgeResult<bool>,
    ) -> BridgeResult<HealthAuthorization> {
        self.permission_active = false;
        match result {
            Ok(all_granted) => {
                debug!(all_granted, "Permission request completed");
                self.refresh_authorization().await
            }
            Err(BridgeError::PermissionUnavailable(message)) => {
                self.publish(|s| {
                    s.authorization = Some(HealthAuthorization::unavailable());
                    s.error_message = Some(format!("Health service unavailable: {}", message));
                });
                Err(BridgeError::PermissionUnavailable(message))
            }
            Err(e) => {
                warn!(error = %e, "Permission request failed");
                let _ = self.refresh_authorization().await;
                let message = e.to_string();
                self.publish(|s| s.error_message = Some(message));
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------------------

    fn start_phase(&mut self, phase: SyncPhase) -> SyncJob {
        if let Some(run) = self.runs.get(&phase) {
            debug!(phase = %phase, "Phase already running, joining");
            return run.job.clone();
        }

        let tracker = SyncProgressTracker::new(phase);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let job = SyncJob::new(phase, tracker.subscribe(), outcome_rx);

        let orchestrator = Arc::clone(&self.orchestrator);
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            let outcome = match orchestrator.run_phase(phase, &tracker).await {
                Ok(summary) => PhaseOutcome::Completed(summary),
                Err(e) => {
                    warn!(phase = %phase, error = %e, "Sync phase failed");
                    PhaseOutcome::Failed(e.to_string())
                }
            };
            let _ = outcome_tx.send(Some(outcome.clone()));
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(HealthCommand::PhaseFinished { phase, outcome }).await;
            }
        });

        self.last_progress.insert(phase, job.progress());
        self.runs.insert(
            phase,
            RunningPhase {
                job: job.clone(),
                task,
            },
        );
        self.publish(|s| {
            if !s.running.contains(&phase) {
                s.running.push(phase);
            }
            s.error_message = None;
        });
        info!(phase = %phase, "Sync phase started");
        job
    }

    fn finish_phase(&mut self, phase: SyncPhase, outcome: PhaseOutcome) {
        self.runs.remove(&phase);
        self.publish(|s| {
            s.running.retain(|p| *p != phase);
            match outcome {
                PhaseOutcome::Completed(summary) => match phase {
                    SyncPhase::BodyPrep => s.last_body_prep = Some(summary),
                    SyncPhase::DigitalTwin => s.last_digital_twin = Some(summary),
                },
                PhaseOutcome::Failed(message) => s.error_message = Some(message),
                PhaseOutcome::Cancelled => {}
            }
        });
    }

    fn cancel_all(&mut self) {
        for (phase, run) in self.runs.drain() {
            info!(phase = %phase, "Cancelling sync phase");
            run.task.abort();
        }
        self.publish(|s| s.running.clear());
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::simulated::{ManualClock, PermissionScript, SimulatedHealthPlatform, SimulatedHub};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn spawn_bloc(platform: Arc<SimulatedHealthPlatform>, hub: Arc<SimulatedHub>) -> HealthHandle {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()));
        let bridge = Arc::new(HealthPermissionBridge::new(
            platform.clone(),
            PlatformCapabilities::android(),
            Duration::from_millis(50),
        ));
        let orchestrator = Arc::new(HealthSyncOrchestrator::new(
            hub,
            Arc::clone(&bridge),
            platform,
            SyncSettings {
                body_prep_window_days: 2,
                digital_twin_days: 10,
                ..SyncSettings::default()
            },
            clock,
        ));
        HealthBloc::spawn(bridge, orchestrator).0
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_updates_authorization() {
        let platform = Arc::new(SimulatedHealthPlatform::new());
        let health = spawn_bloc(platform, Arc::new(SimulatedHub::new()));

        let authorization = health
            .request_permissions(vec!["weight".into(), "height".into(), "steps".into(), "sleep_asleep".into()])
            .await
            .unwrap();

        assert_eq!(authorization.status, HealthPermissionStatus::Granted);
        assert_eq!(health.state().permission_status(), Some(HealthPermissionStatus::Granted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_while_pending_is_rejected() {
        let platform = Arc::new(SimulatedHealthPlatform::new());
        platform.script(PermissionScript::Hold);
        let health = spawn_bloc(platform.clone(), Arc::new(SimulatedHub::new()));

        let first = {
            let health = health.clone();
            tokio::spawn(async move { health.request_permissions(vec!["steps".into()]).await })
        };
        while !platform.has_pending() {
            tokio::task::yield_now().await;
        }

        let second = health.request_permissions(vec!["weight".into()]).await;
        assert!(matches!(second, Err(BridgeError::RequestInFlight)));
        assert_eq!(
            health.state().permission_status(),
            Some(HealthPermissionStatus::PromptingUser)
        );

        assert!(platform.resolve_pending(true));
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, HealthPermissionStatus::PartiallyGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sync_twice_joins_running_phase() {
        let platform = Arc::new(SimulatedHealthPlatform::new());
        platform.set_granted([HealthPermission::Steps]);
        let hub = Arc::new(SimulatedHub::new());
        hub.set_upload_delay(Duration::from_secs(1));
        let health = spawn_bloc(platform, hub.clone());

        let first = health.start_sync(SyncPhase::BodyPrep).await.unwrap();
        let second = health.start_sync(SyncPhase::BodyPrep).await.unwrap();
        assert!(health.state().is_syncing(SyncPhase::BodyPrep));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a, b);
        assert!(matches!(a, PhaseOutcome::Completed(_)));
        assert_eq!(hub.upload_calls(), 1);
    }
}
