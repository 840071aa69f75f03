//! # wellbridge-sync: Device Runtime for the Wellness Bridge
//!
//! This crate runs the device side of the bridge: the token handoff with the
//! Wellness Hub, the health permission gate and the two-phase health sync.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Bridge Runtime                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 Bridge (BridgeBuilder::start)                     │  │
//! │  │   Spawns the blocs, forwards their state to BridgeEventEmitter    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ConnectionBloc │  │   AuthBloc     │  │     HealthBloc         │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Token handoff, │  │ Sign-in,       │  │ Permission requests,   │    │
//! │  │ realtime       │  │ onboarding,    │  │ Body Prep and Digital  │    │
//! │  │ validation,    │  │ permission     │  │ Twin sync runs         │    │
//! │  │ retry/backoff  │  │ gate           │  │                        │    │
//! │  └───────┬────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │          │                                           │                  │
//! │  ┌───────┴────────┐  ┌────────────────┐  ┌───────────┴────────────┐    │
//! │  │ TokenManager   │  │ Realtime (WS)  │  │ HealthSyncOrchestrator │    │
//! │  │ HubClient      │  │ Connectivity   │  │ SyncProgressTracker    │    │
//! │  └────────────────┘  └────────────────┘  │ HealthPermissionBridge │    │
//! │                                          └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Blocs
//! - [`connection_bloc`] - Handoff actor around the connection machine
//! - [`auth_bloc`] - Sign-in and onboarding actor
//! - [`health_bloc`] - Permission and sync actor
//! - [`bridge`] - Builder and event emitter
//!
//! ### Services
//! - [`token_manager`] - Token issue, persistence and expiry
//! - [`permissions`] - Permission bridge over the native health SDK
//! - [`health_sync`] - Sync phase orchestration
//! - [`progress`] - Monotonic progress tracker
//! - [`connectivity`] - Online/offline monitor
//! - [`profile_store`] - Local profile and onboarding flags
//!
//! ### Adapters
//! - [`ports`] - Collaborator traits
//! - [`hub_client`] - HTTP hub client
//! - [`realtime`] / [`protocol`] - WebSocket validation channel
//! - [`simulated`] - In-process collaborators for tests and `--simulate`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wellbridge_sync::{BridgeBuilder, BridgeConfig};
//!
//! let config = BridgeConfig::load_or_default(None);
//! let bridge = BridgeBuilder::new(config)
//!     .with_platform(platform)
//!     .with_store(Arc::new(db.preferences()))
//!     .with_launcher(launcher)
//!     .start()
//!     .await?;
//!
//! bridge.connection.connect().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod ports;
pub mod protocol;

pub mod connectivity;
pub mod health_sync;
pub mod permissions;
pub mod profile_store;
pub mod progress;
pub mod token_manager;

pub mod hub_client;
pub mod realtime;
pub mod simulated;

pub mod auth_bloc;
pub mod bridge;
pub mod connection_bloc;
pub mod health_bloc;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth_bloc::{AuthBloc, AuthHandle};
pub use bridge::{Bridge, BridgeBuilder, BridgeEventEmitter, NoOpEmitter};
pub use config::BridgeConfig;
pub use connection_bloc::{ConnectionBloc, ConnectionHandle};
pub use connectivity::ConnectivityMonitor;
pub use error::{BridgeError, BridgeResult};
pub use health_bloc::{HealthBloc, HealthHandle, HealthState};
pub use health_sync::{HealthSyncOrchestrator, PhaseOutcome, SyncJob};
pub use hub_client::HubClient;
pub use permissions::HealthPermissionBridge;
pub use progress::SyncProgressTracker;
pub use token_manager::TokenManager;
