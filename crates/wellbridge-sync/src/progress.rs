//! # Sync Progress Tracker
//!
//! Observable wrapper around [`SyncProgress`]. The orchestrator is the only
//! writer; any number of observers can subscribe and drop their receivers
//! without affecting the run.

use tokio::sync::watch;

use wellbridge_core::{SyncPhase, SyncProgress, SyncStage};

/// Single-writer, many-reader progress record for one run.
#[derive(Debug)]
pub struct SyncProgressTracker {
    tx: watch::Sender<SyncProgress>,
}

impl SyncProgressTracker {
    pub fn new(phase: SyncPhase) -> Self {
        let (tx, _rx) = watch::channel(SyncProgress::initial(Some(phase)));
        SyncProgressTracker { tx }
    }

    /// A receiver that starts at the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }

    pub fn enter_stage(&self, stage: SyncStage, activity: impl Into<String>) {
        let activity = activity.into();
        self.update(|p| p.enter_stage(stage, activity));
    }

    pub fn set_total(&self, total: u64) {
        self.update(|p| p.set_total(total));
    }

    pub fn record_processed(&self, count: u64) {
        self.update(|p| p.record_processed(count));
    }

    pub fn record_batch(&self, attempted: u64, successful: u64) {
        self.update(|p| p.record_batch(attempted, successful));
    }

    pub fn set_activity(&self, activity: impl Into<String>) {
        let activity = activity.into();
        self.update(|p| p.set_activity(activity));
    }

    pub fn complete(&self, activity: impl Into<String>) {
        let activity = activity.into();
        self.update(|p| p.complete(activity));
    }

    /// Applies `f`, notifying observers only if the record changed.
    fn update(&self, f: impl FnOnce(&mut SyncProgress)) {
        self.tx.send_if_modified(|progress| {
            let before = progress.clone();
            f(progress);
            *progress != before
        });
    }
}
