//! Wharf message bus
//!
//! A self-healing AMQP publisher for a single durable queue.
//!
//! # Overview
//!
//! - [`supervisor`] - connection supervision: bounded connect retries,
//!   background recovery of lost channels and connections, and an
//!   unexpected-close signal for the owner
//! - [`transport`] - the broker capability traits and their `lapin` adapter
//! - [`config`] - TOML configuration and credential resolution
//! - [`observability`] - structured logging
//! - [`testing`] - an in-memory broker for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wharf_messagebus::{ConnectionSupervisor, LapinBroker, SupervisorConfig};
//!
//! # tokio_test::block_on(async {
//! let config = SupervisorConfig::new(
//!     "rabbitmq.internal", 5671, "wharf", "secret", "wharf-events", "/", false, 5,
//! );
//! let supervisor = ConnectionSupervisor::new(config, Arc::new(LapinBroker::new()))?;
//! supervisor.connect().await?;
//!
//! let mut signal = supervisor.unexpected_close();
//! supervisor.publish(&serde_json::json!({"release": "v1.4.2"})).await?;
//!
//! tokio::spawn(async move {
//!     while signal.changed().await.is_ok() {
//!         if signal.borrow().is_terminal() {
//!             break;
//!         }
//!     }
//! });
//! supervisor.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use config::{BusConfig, ConfigError, INSTANCE_ENV_VAR};
pub use error::{SupervisorError, SupervisorResult};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorState};
pub use transport::LapinBroker;
