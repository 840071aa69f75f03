//! # Repository Module
//!
//! Repositories over the bridge database.
//!
//! ```text
//! Runtime component
//!      │  db.preferences().get_string(keys::PROFILE_NAME)
//!      ▼
//! PreferenceRepository ──► preferences table
//! SyncRunRepository    ──► sync_runs table
//! ```
//!
//! ## Available Repositories
//!
//! - [`preferences::PreferenceRepository`] - Typed key-value preferences
//! - [`sync_runs::SyncRunRepository`] - Finished sync phases

pub mod preferences;
pub mod sync_runs;
