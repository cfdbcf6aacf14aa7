//! Broker capability interface
//!
//! The supervisor never talks to a wire protocol directly. It consumes a broker
//! through three small traits so the AMQP client can be swapped for an
//! in-memory fake in tests:
//!
//! - [`Broker`] dials a connection
//! - [`BrokerConnection`] opens channels, reports closure and can be closed
//! - [`BrokerChannel`] declares the queue, publishes and can be closed
//!
//! Both resource kinds expose a close subscription. A subscription resolves
//! with a [`CloseReason`] when the resource dies on its own, and resolves with
//! a receive error when the resource was closed by this program.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;

pub mod amqp;

pub use amqp::LapinBroker;

/// Boxed error coming out of a concrete broker client
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Receiving half of a close subscription.
///
/// `Ok(reason)` means the resource was lost unexpectedly, `Err(_)` means the
/// sender was dropped because the resource was closed deliberately.
pub type CloseNotification = oneshot::Receiver<CloseReason>;

/// Errors raised at the broker capability boundary
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Dial failed: {0}")]
    Dial(#[source] BoxError),
    #[error("Channel open failed: {0}")]
    OpenChannel(#[source] BoxError),
    #[error("Queue declare failed: {0}")]
    DeclareQueue(#[source] BoxError),
    #[error("Publish failed: {0}")]
    Publish(#[source] BoxError),
    #[error("Close failed: {0}")]
    Close(#[source] BoxError),
}

/// Why the broker (or the network) tore a resource down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub text: String,
}

impl CloseReason {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self { text: text.into() }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Lowest TLS protocol version a secured dial may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// TLS requirements handed to [`Broker::dial`] for `amqps` URIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub min_version: TlsVersion,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
        }
    }
}

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl QueueOptions {
    /// Durable, kept when unused, shared, and confirmed by the broker
    pub const fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
        }
    }
}

/// Basic.Publish delivery flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Application headers attached to every published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageHeaders {
    pub const INSTANCE_ID: &'static str = "WharfInstanceId";
    pub const TIMESTAMP: &'static str = "Timestamp";
}

/// A fully addressed message ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub headers: MessageHeaders,
    pub body: Vec<u8>,
}

/// Dials broker connections
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a transport connection. `tls` is `Some` for secured URIs.
    async fn dial(
        &self,
        uri: &str,
        tls: Option<&TlsPolicy>,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// A live transport session to the broker
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    /// Subscribe to the closure of this connection
    fn notify_close(&self) -> CloseNotification;
}

/// A logical session multiplexed over a connection
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<(), TransportError>;

    async fn publish(
        &self,
        options: PublishOptions,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Subscribe to the closure of this channel
    fn notify_close(&self) -> CloseNotification;
}

/// Fan-out of close subscriptions for one resource.
///
/// Fires at most once. Subscribing after it fired yields an already-dropped
/// sender, which reads as a deliberate close.
#[derive(Debug, Clone, Default)]
pub struct CloseListeners {
    inner: Arc<Mutex<ListenerSlot>>,
}

#[derive(Debug, Default)]
struct ListenerSlot {
    fired: bool,
    senders: Vec<oneshot::Sender<CloseReason>>,
}

impl CloseListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot();
        if !slot.fired {
            slot.senders.push(tx);
        }
        rx
    }

    /// Deliver `reason` to every subscriber (unexpected close)
    pub fn notify(&self, reason: CloseReason) {
        let senders = self.drain();
        for sender in senders {
            let _ = sender.send(reason.clone());
        }
    }

    /// Drop every subscriber without a reason (deliberate close)
    pub fn release(&self) {
        drop(self.drain());
    }

    pub fn has_fired(&self) -> bool {
        self.slot().fired
    }

    fn drain(&self) -> Vec<oneshot::Sender<CloseReason>> {
        let mut slot = self.slot();
        slot.fired = true;
        std::mem::take(&mut slot.senders)
    }

    fn slot(&self) -> MutexGuard<'_, ListenerSlot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_delivers_reason_to_every_subscriber() {
        let listeners = CloseListeners::new();
        let first = listeners.subscribe();
        let second = listeners.subscribe();

        listeners.notify(CloseReason::new("CONNECTION_FORCED"));

        assert_eq!(first.await.unwrap().text, "CONNECTION_FORCED");
        assert_eq!(second.await.unwrap().text, "CONNECTION_FORCED");
    }

    #[tokio::test]
    async fn test_release_reads_as_deliberate_close() {
        let listeners = CloseListeners::new();
        let rx = listeners.subscribe();

        listeners.release();

        assert!(rx.await.is_err());
        assert!(listeners.has_fired());
    }

    #[tokio::test]
    async fn test_subscribe_after_fire_resolves_immediately() {
        let listeners = CloseListeners::new();
        listeners.notify(CloseReason::new("gone"));

        let late = listeners.subscribe();
        assert!(late.await.is_err());
    }

    #[test]
    fn test_durable_queue_options() {
        let options = QueueOptions::durable();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.exclusive);
        assert!(!options.no_wait);
    }

    #[test]
    fn test_default_publish_options_are_not_mandatory_or_immediate() {
        let options = PublishOptions::default();
        assert!(!options.mandatory);
        assert!(!options.immediate);
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::Dial("refused".into()),
            TransportError::OpenChannel("refused".into()),
            TransportError::DeclareQueue("refused".into()),
            TransportError::Publish("refused".into()),
            TransportError::Close("refused".into()),
        ];

        for error in errors {
            assert!(error.to_string().contains("refused"));
        }
    }
}
