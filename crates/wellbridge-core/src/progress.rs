//! # Sync Progress
//!
//! The mutable progress record of one sync run. The orchestrator is the only
//! writer; observers receive snapshots.
//!
//! ## Stage Boundaries
//! ```text
//! 0.00 ────── 0.25 ──────── 0.40 ─────────────────── 0.85 ──────── 1.00
//!  │ Fetching  │ Processing  │ Uploading (per batch)  │ Analyzing   │ done
//! ```
//!
//! Percentages jump at stage boundaries and once per uploaded batch. Every
//! mutator keeps the percentage monotonically non-decreasing, and a completed
//! record ignores further updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Stage & Phase
// =============================================================================

/// Pipeline stage within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum SyncStage {
    Fetching,
    Processing,
    Uploading,
    Analyzing,
}

impl SyncStage {
    /// Percentage reached when the stage starts.
    pub const fn floor(&self) -> f64 {
        match self {
            SyncStage::Fetching => 0.0,
            SyncStage::Processing => 0.25,
            SyncStage::Uploading => 0.40,
            SyncStage::Analyzing => 0.85,
        }
    }

    /// Percentage the stage may grow to before the next one starts.
    pub const fn ceiling(&self) -> f64 {
        match self {
            SyncStage::Fetching => 0.25,
            SyncStage::Processing => 0.40,
            SyncStage::Uploading => 0.85,
            SyncStage::Analyzing => 1.0,
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStage::Fetching => write!(f, "fetching"),
            SyncStage::Processing => write!(f, "processing"),
            SyncStage::Uploading => write!(f, "uploading"),
            SyncStage::Analyzing => write!(f, "analyzing"),
        }
    }
}

/// Named sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum SyncPhase {
    /// Recent window, quick readiness score.
    BodyPrep,
    /// Long historical backfill.
    DigitalTwin,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::BodyPrep => write!(f, "body_prep"),
            SyncPhase::DigitalTwin => write!(f, "digital_twin"),
        }
    }
}

impl std::str::FromStr for SyncPhase {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "body_prep" | "bodyPrep" => Ok(SyncPhase::BodyPrep),
            "digital_twin" | "digitalTwin" => Ok(SyncPhase::DigitalTwin),
            other => Err(crate::ValidationError::invalid(
                "sync phase",
                format!("unknown phase '{}'", other),
            )),
        }
    }
}

// =============================================================================
// Sync Progress
// =============================================================================

/// Progress of a single sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncProgress {
    pub stage: SyncStage,

    /// Data points read from the platform and normalized.
    pub processed_data_points: u64,

    /// Data points the hub acknowledged.
    pub successful_uploads: u64,

    /// Data points sent in batches, successful or not.
    pub attempted_uploads: u64,

    pub total_data_points: u64,

    /// 0.0 to 1.0.
    pub percentage: f64,

    pub current_activity: String,

    /// Terminal for this run.
    pub is_complete: bool,

    pub phase: Option<SyncPhase>,
}

impl SyncProgress {
    /// A fresh record at the start of a run.
    pub fn initial(phase: Option<SyncPhase>) -> Self {
        SyncProgress {
            stage: SyncStage::Fetching,
            processed_data_points: 0,
            successful_uploads: 0,
            attempted_uploads: 0,
            total_data_points: 0,
            percentage: 0.0,
            current_activity: "Preparing sync".to_string(),
            is_complete: false,
            phase,
        }
    }

    /// Moves to `stage` and jumps to its floor percentage.
    ///
    /// Stages never move backwards.
    pub fn enter_stage(&mut self, stage: SyncStage, activity: impl Into<String>) {
        if self.is_complete || stage < self.stage {
            return;
        }
        self.stage = stage;
        self.current_activity = activity.into();
        self.raise_percentage(stage.floor());
    }

    /// Sets the total number of data points for the run.
    pub fn set_total(&mut self, total: u64) {
        if self.is_complete {
            return;
        }
        self.total_data_points = total;
    }

    /// Records normalized data points.
    pub fn record_processed(&mut self, count: u64) {
        if self.is_complete {
            return;
        }
        self.processed_data_points = self.processed_data_points.saturating_add(count);
    }

    /// Records one finished batch and moves the percentage through the
    /// uploading band.
    pub fn record_batch(&mut self, attempted: u64, successful: u64) {
        if self.is_complete {
            return;
        }
        self.attempted_uploads = self.attempted_uploads.saturating_add(attempted);
        self.successful_uploads = self
            .successful_uploads
            .saturating_add(successful.min(attempted));

        if self.total_data_points > 0 {
            let done = self.attempted_uploads.min(self.total_data_points) as f64
                / self.total_data_points as f64;
            let band = SyncStage::Uploading.ceiling() - SyncStage::Uploading.floor();
            self.raise_percentage(SyncStage::Uploading.floor() + band * done);
        }
    }

    /// Raises the percentage, clamped to `[0, 1]`; lower values are ignored.
    pub fn raise_percentage(&mut self, value: f64) {
        if self.is_complete || !value.is_finite() {
            return;
        }
        let clamped = value.clamp(0.0, 1.0);
        if clamped > self.percentage {
            self.percentage = clamped;
        }
    }

    /// Updates the activity message.
    pub fn set_activity(&mut self, activity: impl Into<String>) {
        if self.is_complete {
            return;
        }
        self.current_activity = activity.into();
    }

    /// Marks the run finished.
    pub fn complete(&mut self, activity: impl Into<String>) {
        if self.is_complete {
            return;
        }
        self.current_activity = activity.into();
        self.percentage = 1.0;
        self.is_complete = true;
    }

    /// Attempted minus successful uploads.
    pub fn failed_uploads(&self) -> u64 {
        self.attempted_uploads.saturating_sub(self.successful_uploads)
    }

    /// True when some batch never made it to the hub.
    pub fn has_failures(&self) -> bool {
        self.failed_uploads() > 0
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        SyncProgress::initial(None)
    }
}

// =============================================================================
// Run Summary
// =============================================================================

/// What is retained of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncSummary {
    pub phase: SyncPhase,
    pub total_data_points: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    #[ts(type = "string")]
    pub started_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub completed_at: DateTime<Utc>,
}

impl SyncSummary {
    /// Summarizes a completed progress record.
    pub fn from_progress(
        phase: SyncPhase,
        progress: &SyncProgress,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        SyncSummary {
            phase,
            total_data_points: progress.total_data_points,
            successful_uploads: progress.successful_uploads,
            failed_uploads: progress.failed_uploads(),
            started_at,
            completed_at,
        }
    }

    /// True when every attempted point was accepted.
    pub fn is_clean(&self) -> bool {
        self.failed_uploads == 0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
