//! Connection supervision for a single durable queue
//!
//! # Architecture
//!
//! - [`config`] - immutable target description and broker URI construction
//! - [`policy`] - pure retry decisions and the escalation table
//! - [`state`] - the mutex-guarded connection/channel pair and lifecycle states
//! - `core` - [`ConnectionSupervisor`]: connect, publish, close
//! - `watcher` - background close watchers that drive recovery
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Connected ◀──────────────┐
//!   ▲                   │                  │ connection lost     │ recovered
//!   └──────failed───────┘                  ▼                     │
//!                                      Reconnecting ─────────────┘
//!                                          │ recovery failed
//!                                          ▼
//!   close() from anywhere ──▶ Closed    Abandoned
//! ```
//!
//! Lost channels are reopened in place and never leave `Connected`.

pub mod config;
pub mod core;
pub mod policy;
pub mod state;
mod watcher;

pub use self::config::{redact_uri, SupervisorConfig};
pub use self::core::{ConnectionSupervisor, JSON_CONTENT_TYPE};
pub use self::policy::{
    escalation_for, Escalation, ResourceKind, RetryDecision, RetryPolicy, ESCALATION_POLICY,
    RECONNECT_DELAY,
};
pub use self::state::{ResourceSnapshot, SupervisorState};
