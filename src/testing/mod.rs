//! Testing utilities and mock implementations
//!
//! An in-memory broker for exercising the supervisor without a running
//! RabbitMQ.

pub mod mocks;

pub use mocks::*;
