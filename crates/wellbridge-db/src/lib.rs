//! # wellbridge-db: Local Persistence for the Wellness Bridge
//!
//! SQLite storage for everything the bridge keeps between launches.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bridge Data Flow                                 │
//! │                                                                         │
//! │  TokenManager / ProfileStore / HealthSyncOrchestrator                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  wellbridge-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│ preferences   │    │ 001_prefs    │  │   │
//! │  │   │  SqlitePool   │    │ sync_runs     │    │ 002_runs     │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  <data dir>/bridge.db                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wellbridge_db::{keys, Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("bridge.db")).await?;
//! db.preferences().set(keys::WELCOME_SEEN, true).await?;
//! ```

pub mod error;
pub mod keys;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::preferences::{PrefValue, PreferenceRepository};
pub use repository::sync_runs::{SyncRunRecord, SyncRunRepository};
