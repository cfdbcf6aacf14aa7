//! In-memory broker for testing
//!
//! [`FakeBroker`] implements the capability traits without a network. Tests
//! script its failures through [`FakeBehavior`], inspect what the supervisor
//! did through the recorded [`FakeEvent`] log, and simulate broker-side
//! closes through [`FakeHandle`].

use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, CloseListeners, CloseNotification, CloseReason,
    OutboundMessage, PublishOptions, QueueOptions, TlsPolicy, TransportError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How dial attempts behave
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DialScript {
    #[default]
    Succeed,
    FailAlways,
    /// Fail the next `n` dials, then succeed
    FailTimes(usize),
}

/// Scripted failures
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub dial: DialScript,
    /// Time each dial takes before resolving
    pub dial_delay: Option<Duration>,
    /// Time each channel open takes before resolving
    pub open_channel_delay: Option<Duration>,
    /// Time a successful queue declaration takes to be confirmed
    pub declare_delay: Option<Duration>,
    /// Lose the connection from this dial (1-based) as soon as a channel
    /// open starts on it. Fires once.
    pub sever_on_open: Option<usize>,
    pub fail_open_channel: bool,
    pub fail_declare: bool,
    pub fail_publish: bool,
    pub fail_channel_close: bool,
    pub fail_connection_close: bool,
}

/// Everything the supervisor asked the broker to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Dial { uri: String, tls: bool, succeeded: bool },
    OpenChannel { connection: u64, succeeded: bool },
    DeclareQueue { channel: u64, name: String, options: QueueOptions },
    Publish { channel: u64 },
    CloseChannel { channel: u64 },
    CloseConnection { connection: u64 },
}

/// Test-side handle on a fake connection or channel
#[derive(Debug, Clone)]
pub struct FakeHandle {
    id: u64,
    closed: Arc<AtomicBool>,
    listeners: CloseListeners,
}

impl FakeHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            closed: Arc::new(AtomicBool::new(false)),
            listeners: CloseListeners::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Broker-side close: subscribers receive `reason`
    pub fn fail(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.notify(CloseReason::new(reason));
    }

    /// Close without a reason: subscribers see a deliberate close
    pub fn close_quietly(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.release();
    }

    /// Mark closed without notifying anyone, like a silently dead socket
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FakeState {
    behavior: FakeBehavior,
    events: Vec<FakeEvent>,
    published: Vec<OutboundMessage>,
    dial_attempts: usize,
    last_id: u64,
    connections: Vec<FakeHandle>,
    channels: Vec<(u64, FakeHandle)>,
}

impl FakeState {
    fn new_handle(&mut self) -> FakeHandle {
        self.last_id += 1;
        FakeHandle::new(self.last_id)
    }

    fn take_dial_failure(&mut self) -> bool {
        match self.behavior.dial {
            DialScript::Succeed => false,
            DialScript::FailAlways => true,
            DialScript::FailTimes(0) => false,
            DialScript::FailTimes(remaining) => {
                self.behavior.dial = DialScript::FailTimes(remaining - 1);
                true
            }
        }
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fail `connection` and every channel opened on it with `reason`
fn sever(state: &Mutex<FakeState>, connection: &FakeHandle, reason: &str) {
    let channels: Vec<FakeHandle> = lock(state)
        .channels
        .iter()
        .filter(|(owner, _)| *owner == connection.id)
        .map(|(_, handle)| handle.clone())
        .collect();

    connection.fail(reason);
    for channel in channels {
        channel.fail(reason);
    }
}

/// Mock broker for testing
#[derive(Debug, Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        let broker = Self::new();
        broker.configure(|b| *b = behavior);
        broker
    }

    /// Adjust scripted behavior in place
    pub fn configure(&self, f: impl FnOnce(&mut FakeBehavior)) {
        f(&mut lock(&self.state).behavior);
    }

    pub fn set_dial(&self, script: DialScript) {
        self.configure(|b| b.dial = script);
    }

    pub fn dial_attempts(&self) -> usize {
        lock(&self.state).dial_attempts
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        lock(&self.state).events.clone()
    }

    pub fn count_events(&self, predicate: impl Fn(&FakeEvent) -> bool) -> usize {
        lock(&self.state).events.iter().filter(|e| predicate(e)).count()
    }

    pub fn open_channel_attempts(&self) -> usize {
        self.count_events(|e| matches!(e, FakeEvent::OpenChannel { .. }))
    }

    pub fn publish_calls(&self) -> usize {
        self.count_events(|e| matches!(e, FakeEvent::Publish { .. }))
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.state).published.clone()
    }

    pub fn connections(&self) -> Vec<FakeHandle> {
        lock(&self.state).connections.clone()
    }

    pub fn latest_connection(&self) -> Option<FakeHandle> {
        lock(&self.state).connections.last().cloned()
    }

    pub fn latest_channel(&self) -> Option<FakeHandle> {
        lock(&self.state)
            .channels
            .last()
            .map(|(_, handle)| handle.clone())
    }

    /// Broker-side loss of the latest connection and every channel on it
    pub fn sever_connection(&self, reason: &str) {
        let latest = lock(&self.state).connections.last().cloned();
        if let Some(connection) = latest {
            sever(&self.state, &connection, reason);
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn dial(
        &self,
        uri: &str,
        tls: Option<&TlsPolicy>,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let delay = lock(&self.state).behavior.dial_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.dial_attempts += 1;
        let failed = state.take_dial_failure();
        state.events.push(FakeEvent::Dial {
            uri: uri.to_string(),
            tls: tls.is_some(),
            succeeded: !failed,
        });
        if failed {
            return Err(TransportError::Dial("connection refused".into()));
        }

        let handle = state.new_handle();
        state.connections.push(handle.clone());
        Ok(Arc::new(FakeConnection {
            handle,
            dial_number: state.dial_attempts,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Mock connection for testing
pub struct FakeConnection {
    handle: FakeHandle,
    dial_number: usize,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let (delay, sever_now) = {
            let mut state = lock(&self.state);
            let sever_now = state.behavior.sever_on_open == Some(self.dial_number);
            if sever_now {
                state.behavior.sever_on_open = None;
            }
            (state.behavior.open_channel_delay, sever_now)
        };
        if sever_now {
            sever(&self.state, &self.handle, "CONNECTION_FORCED - lost during channel open");
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let succeeded = !self.handle.is_closed() && !state.behavior.fail_open_channel;
        state.events.push(FakeEvent::OpenChannel {
            connection: self.handle.id,
            succeeded,
        });
        if !succeeded {
            return Err(TransportError::OpenChannel("channel open refused".into()));
        }

        let handle = state.new_handle();
        state.channels.push((self.handle.id, handle.clone()));
        Ok(Arc::new(FakeChannel {
            handle,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = lock(&self.state);
            state.events.push(FakeEvent::CloseConnection {
                connection: self.handle.id,
            });
            if state.behavior.fail_connection_close {
                return Err(TransportError::Close("connection close refused".into()));
            }
            state
                .channels
                .iter()
                .filter(|(owner, _)| *owner == self.handle.id)
                .map(|(_, handle)| handle.clone())
                .collect::<Vec<_>>()
        };

        self.handle.close_quietly();
        for channel in channels {
            channel.close_quietly();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn notify_close(&self) -> CloseNotification {
        self.handle.listeners.subscribe()
    }
}

/// Mock channel for testing
pub struct FakeChannel {
    handle: FakeHandle,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            state.events.push(FakeEvent::DeclareQueue {
                channel: self.handle.id,
                name: name.to_string(),
                options,
            });
            if self.handle.is_closed() || state.behavior.fail_declare {
                return Err(TransportError::DeclareQueue(
                    "PRECONDITION_FAILED - inequivalent arg 'durable'".into(),
                ));
            }
            state.behavior.declare_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn publish(
        &self,
        _options: PublishOptions,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.events.push(FakeEvent::Publish {
            channel: self.handle.id,
        });
        if self.handle.is_closed() || state.behavior.fail_publish {
            return Err(TransportError::Publish("channel is closed".into()));
        }
        state.published.push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.state);
            state.events.push(FakeEvent::CloseChannel {
                channel: self.handle.id,
            });
            if state.behavior.fail_channel_close {
                return Err(TransportError::Close("channel close refused".into()));
            }
        }
        self.handle.close_quietly();
        Ok(())
    }

    fn notify_close(&self) -> CloseNotification {
        self.handle.listeners.subscribe()
    }
}
