//! # wellbridge-core: Pure Domain Logic for the Wellness Bridge
//!
//! This crate holds the rules of the device-to-hub health bridge as pure
//! functions and pure state machines. Nothing here touches the network, the
//! database, the platform SDKs or the wall clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Wellness Bridge Architecture                      │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI collaborators / `wellbridge` CLI                │   │
//! │  │    Sign-in ──► Onboarding ──► Permissions ──► Connect ──► Sync  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ events in, state snapshots out         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                wellbridge-sync (runtime actors)                 │   │
//! │  │  ConnectionBloc, AuthBloc, HealthBloc, TokenManager, bridge     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ handle(event, now) -> effects          │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ wellbridge-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │  ┌──────────┐ ┌────────────┐ ┌──────────┐ ┌────────────────┐   │   │
//! │  │  │  token   │ │ permission │ │ progress │ │ connection/auth│   │   │
//! │  │  │ expiry   │ │ expansion  │ │ monotone │ │ state machines │   │   │
//! │  │  └──────────┘ └────────────┘ └──────────┘ └────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TIMERS • NO CLOCK • PURE FUNCTIONS               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                wellbridge-db (Persistence Layer)                │   │
//! │  │          namespaced key-value store, sync run history           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`token`] - Connection tokens, display format, reconnect codes
//! - [`permission`] - Permission vocabulary, expansion, status rules
//! - [`platform`] - `PlatformCapabilities` value object
//! - [`profile`] - User profile and completeness rules
//! - [`progress`] - Sync progress record
//! - [`connection`] - Handoff state machine
//! - [`auth`] - Sign-in / onboarding / permission gate state machine
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use wellbridge_core::connection::{
//!     ConnectionEvent, ConnectionMachine, ConnectionPolicy, ConnectionStatus,
//! };
//! use wellbridge_core::token::ConnectionToken;
//!
//! let now = Utc::now();
//! let mut machine = ConnectionMachine::new(ConnectionPolicy::default());
//! machine.handle(ConnectionEvent::ConnectRequested, now);
//!
//! let token = ConnectionToken::issue("AB3D9KQ2", now, Duration::minutes(30));
//! let step = machine.handle(ConnectionEvent::TokenIssued { token }, now);
//!
//! // A token on its own never links the device.
//! assert_eq!(step.state.status, ConnectionStatus::AwaitingWebValidation);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod connection;
pub mod error;
pub mod permission;
pub mod platform;
pub mod profile;
pub mod progress;
pub mod token;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use permission::{HealthAuthorization, HealthPermission, HealthPermissionStatus};
pub use platform::{Platform, PlatformCapabilities};
pub use profile::UserProfile;
pub use progress::{SyncPhase, SyncProgress, SyncStage};
pub use token::ConnectionToken;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Connection token lifetime.
pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;

/// Characters per group in the displayed connection code.
pub const DEFAULT_TOKEN_GROUP_SIZE: usize = 4;

/// Historical window of the Digital Twin backfill.
pub const DIGITAL_TWIN_DAYS: i64 = 90;
