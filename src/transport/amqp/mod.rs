//! AMQP 0-9-1 broker adapter backed by `lapin`
//!
//! Split the same way as the rest of the transport layer:
//!
//! - [`connection`] - pure mapping between capability types and lapin types
//! - [`client`] - impure dialing, channel management and publishing

pub mod client;
pub mod connection;

pub use client::{LapinBroker, LapinChannel, LapinConnection};
pub use connection::{basic_properties, header_table, publish_options, queue_declare_options};
