//! # Health Sync Orchestrator
//!
//! Runs one sync phase end to end: read from the platform, normalize, upload
//! in batches, then wait for the hub's analysis.
//!
//! ## Phase Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          run_phase(phase)                               │
//! │                                                                         │
//! │  authorization ──not granted──► Err(PermissionDenied/Unavailable)      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  FETCHING     read_records(granted, now - window, now)        0% → 25% │
//! │       ▼                                                                 │
//! │  PROCESSING   drop invalid samples, sort, dedupe             25% → 40% │
//! │       ▼                                                                 │
//! │  UPLOADING    batches of `batch_size`, retried per batch     40% → 85% │
//! │               terminal batch failures are counted, not fatal            │
//! │       ▼                                                                 │
//! │  ANALYZING    request + poll under `analysis_timeout`        85% → 100%│
//! │       ▼                                                                 │
//! │  complete ──► SyncSummary ──► sync_runs                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Body Prep reads `body_prep_window_days`; Digital Twin reads
//! `digital_twin_days`. Observers attach through the tracker and may detach
//! at any time; only aborting the task stops a run.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use wellbridge_core::progress::SyncSummary;
use wellbridge_core::{HealthPermissionStatus, SyncPhase, SyncProgress, SyncStage};
use wellbridge_db::SyncRunRepository;

use crate::config::SyncSettings;
use crate::error::{BridgeError, BridgeResult};
use crate::permissions::HealthPermissionBridge;
use crate::ports::{AnalysisStatus, Clock, HealthRecord, HubApi, NativeHealthPlatform};
use crate::progress::SyncProgressTracker;

// =============================================================================
// Phase Results
// =============================================================================

/// How a phase ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed(SyncSummary),
    Failed(String),
    /// Aborted by disconnect or shutdown.
    Cancelled,
}

/// Observer view of a running phase.
///
/// Dropping a job detaches the observer; the phase keeps running.
#[derive(Debug, Clone)]
pub struct SyncJob {
    phase: SyncPhase,
    progress: watch::Receiver<SyncProgress>,
    outcome: watch::Receiver<Option<PhaseOutcome>>,
}

impl SyncJob {
    pub fn new(
        phase: SyncPhase,
        progress: watch::Receiver<SyncProgress>,
        outcome: watch::Receiver<Option<PhaseOutcome>>,
    ) -> Self {
        SyncJob {
            phase,
            progress,
            outcome,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// A progress receiver positioned at the latest snapshot.
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Resolves when the phase ends.
    pub async fn wait(mut self) -> PhaseOutcome {
        loop {
            if let Some(outcome) = self.outcome.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                return self
                    .outcome
                    .borrow()
                    .clone()
                    .unwrap_or(PhaseOutcome::Cancelled);
            }
        }
    }
}

/// Human label used in activity messages.
pub fn phase_label(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::BodyPrep => "Body Prep",
        SyncPhase::DigitalTwin => "Digital Twin",
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs sync phases against the hub.
pub struct HealthSyncOrchestrator {
    hub: Arc<dyn HubApi>,
    permissions: Arc<HealthPermissionBridge>,
    platform: Arc<dyn NativeHealthPlatform>,
    history: Option<SyncRunRepository>,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
}

impl HealthSyncOrchestrator {
    pub fn new(
        hub: Arc<dyn HubApi>,
        permissions: Arc<HealthPermissionBridge>,
        platform: Arc<dyn NativeHealthPlatform>,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        HealthSyncOrchestrator {
            hub,
            permissions,
            platform,
            history: None,
            settings,
            clock,
        }
    }

    /// Records finished phases in `sync_runs`.
    pub fn with_history(mut self, history: SyncRunRepository) -> Self {
        self.history = Some(history);
        self
    }

    pub fn history(&self) -> Option<&SyncRunRepository> {
        self.history.as_ref()
    }

    fn window_days(&self, phase: SyncPhase) -> i64 {
        match phase {
            SyncPhase::BodyPrep => self.settings.body_prep_window_days,
            SyncPhase::DigitalTwin => self.settings.digital_twin_days,
        }
    }

    /// Runs `phase` to completion, reporting through `tracker`.
    pub async fn run_phase(
        &self,
        phase: SyncPhase,
        tracker: &SyncProgressTracker,
    ) -> BridgeResult<SyncSummary> {
        let label = phase_label(phase);
        let authorization = self.permissions.authorization().await?;
        match authorization.status {
            status if status.allows_sync() => {}
            HealthPermissionStatus::Unavailable => {
                return Err(BridgeError::PermissionUnavailable(
                    self.permissions.capabilities().health_service.to_string(),
                ))
            }
            status => {
                return Err(BridgeError::PermissionDenied(format!(
                    "health access is {:?}",
                    status
                )))
            }
        }

        let started = self.clock.now();
        let days = self.window_days(phase);
        info!(phase = %phase, days, granted = authorization.granted.len(), "Sync phase starting");

        // Fetching
        tracker.enter_stage(
            SyncStage::Fetching,
            format!("{}: reading the last {} days of health data", label, days),
        );
        let from = started - chrono::Duration::days(days);
        let raw = self
            .platform
            .read_records(&authorization.granted, from, started)
            .await?;
        debug!(phase = %phase, records = raw.len(), "Records read");

        // Processing
        tracker.enter_stage(SyncStage::Processing, format!("{}: preparing data", label));
        let records = normalize_records(raw);
        let total = records.len() as u64;
        tracker.record_processed(total);
        tracker.set_total(total);

        // Uploading
        tracker.enter_stage(SyncStage::Uploading, format!("{}: uploading", label));
        let batch_size = self.settings.batch_size.max(1);
        let batch_count = records.len().div_ceil(batch_size);
        for (index, batch) in records.chunks(batch_size).enumerate() {
            let attempted = batch.len() as u64;
            match self.upload_with_retry(phase, batch).await {
                Ok(accepted) => tracker.record_batch(attempted, accepted.min(attempted)),
                Err(e) => {
                    warn!(phase = %phase, batch = index + 1, error = %e, "Batch upload failed");
                    tracker.record_batch(attempted, 0);
                }
            }
            tracker.set_activity(format!(
                "{}: uploaded batch {} of {}",
                label,
                index + 1,
                batch_count
            ));
        }

        // Analyzing
        tracker.enter_stage(SyncStage::Analyzing, format!("{}: analyzing", label));
        if tracker.snapshot().successful_uploads > 0 {
            match tokio::time::timeout(self.settings.analysis_timeout(), self.await_analysis(phase))
                .await
            {
                Ok(Ok(summary)) => info!(phase = %phase, ?summary, "Hub analysis complete"),
                Ok(Err(e)) => warn!(phase = %phase, error = %e, "Hub analysis failed"),
                Err(_) => warn!(
                    phase = %phase,
                    timeout_secs = self.settings.analysis_timeout_secs,
                    "Hub analysis did not finish in time"
                ),
            }
        }

        tracker.complete(format!("{} complete", label));
        let progress = tracker.snapshot();
        let summary = SyncSummary::from_progress(phase, &progress, started, self.clock.now());

        if let Some(history) = &self.history {
            if let Err(e) = history.record(&summary).await {
                warn!(phase = %phase, error = %e, "Failed to record sync run");
            }
        }

        info!(
            phase = %phase,
            total = summary.total_data_points,
            successful = summary.successful_uploads,
            failed = summary.failed_uploads,
            "Sync phase finished"
        );
        Ok(summary)
    }

    async fn upload_with_retry(&self, phase: SyncPhase, batch: &[HealthRecord]) -> BridgeResult<u64> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempt = 0u32;

        loop {
            match self.hub.upload_batch(phase, batch).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if e.is_retryable() && attempt < self.settings.max_batch_retries => {
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(10));
                    debug!(attempt, ?delay, error = %e, "Retrying batch upload");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_analysis(&self, phase: SyncPhase) -> BridgeResult<Option<String>> {
        let job = self.hub.request_analysis(phase).await?;
        debug!(job_id = %job.job_id, "Analysis requested");
        loop {
            match self.hub.analysis_status(&job).await? {
                AnalysisStatus::Pending => {
                    tokio::time::sleep(self.settings.analysis_poll_interval()).await
                }
                AnalysisStatus::Complete { summary } => return Ok(summary),
                AnalysisStatus::Failed { message } => {
                    return Err(BridgeError::Internal(
                        message.unwrap_or_else(|| "analysis failed".to_string()),
                    ))
                }
            }
        }
    }
}

/// Drops unusable samples, orders by type then time, removes duplicates.
pub fn normalize_records(records: Vec<HealthRecord>) -> Vec<HealthRecord> {
    let mut records: Vec<HealthRecord> = records
        .into_iter()
        .filter(|r| r.value.is_finite() && r.value >= 0.0 && r.end >= r.start)
        .collect();
    records.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then(a.start.cmp(&b.start))
            .then(a.end.cmp(&b.end))
            .then(a.value.total_cmp(&b.value))
    });
    records.dedup_by(|a, b| a.kind == b.kind && a.start == b.start && a.end == b.end && a.value == b.value);
    records
}

// =============================================================================
// Unit Tests
// =============================================================================
