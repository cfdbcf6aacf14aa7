//! Shared connection/channel state
//!
//! The (connection, channel) pair lives behind one async mutex inside
//! [`SharedResources`]. Callers never get the raw lock: they install, take or
//! snapshot resources through methods that each run as one critical section,
//! so nothing can hold the lock across a dial or a channel open by accident.
//! The one exception is [`SharedResources::lock_for_publish`], which
//! deliberately serializes publishing against recovery.
//!
//! Every installed resource gets a fresh generation number. Close watchers
//! remember the generation they were spawned for and only act while it is
//! still the installed one.

use crate::transport::{BrokerChannel, BrokerConnection};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Lifecycle of a supervisor as seen by its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    /// Constructed, or a `connect` call failed and may be retried
    Idle,
    /// `connect` is running
    Connecting,
    /// Connection and channel are established
    Connected,
    /// Recovering from an unexpected connection loss
    Reconnecting,
    /// Shut down deliberately
    Closed,
    /// Recovery of the connection failed; the supervisor must be rebuilt
    Abandoned(String),
}

impl SupervisorState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Closed | SupervisorState::Abandoned(_))
    }
}

/// Point-in-time view of the installed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    /// Generation of the installed connection
    pub connection: Option<u64>,
    /// Generation of the installed channel
    pub channel: Option<u64>,
    /// Set once the supervisor has been closed
    pub sealed: bool,
}

impl ResourceSnapshot {
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// A channel is never visible without the connection it runs on
    pub fn is_consistent(&self) -> bool {
        self.channel.is_none() || self.connection.is_some()
    }
}

/// Resources removed from the shared state, waiting to be closed
#[derive(Default)]
pub struct Detached {
    pub connection: Option<Arc<dyn BrokerConnection>>,
    pub channel: Option<Arc<dyn BrokerChannel>>,
}

impl Detached {
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.channel.is_none()
    }
}

/// Result of installing a connection
pub struct ConnectionInstall {
    pub generation: u64,
    /// Whatever was installed before, to be closed by the caller
    pub displaced: Detached,
}

/// Result of installing a channel
pub struct ChannelInstall {
    pub generation: u64,
    pub displaced: Option<Arc<dyn BrokerChannel>>,
}

/// A channel `install_channel` refused, to be closed by the caller
pub struct RejectedChannel {
    pub channel: Arc<dyn BrokerChannel>,
    /// Refused because the supervisor was closed, not because its
    /// connection was replaced
    pub sealed: bool,
}

struct ConnectionSlot {
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
}

struct ChannelSlot {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

#[derive(Default)]
struct Slots {
    connection: Option<ConnectionSlot>,
    channel: Option<ChannelSlot>,
    last_generation: u64,
    sealed: bool,
}

impl Slots {
    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn take_all(&mut self) -> Detached {
        Detached {
            channel: self.channel.take().map(|slot| slot.channel),
            connection: self.connection.take().map(|slot| slot.connection),
        }
    }
}

/// Mutex-guarded (connection, channel) pair
#[derive(Default)]
pub struct SharedResources {
    slots: Mutex<Slots>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        let slots = self.slots.lock().await;
        ResourceSnapshot {
            connection: slots.connection.as_ref().map(|slot| slot.generation),
            channel: slots.channel.as_ref().map(|slot| slot.generation),
            sealed: slots.sealed,
        }
    }

    /// Install a freshly dialed connection.
    ///
    /// Hands the connection back when the state has been sealed by `close`.
    pub async fn install_connection(
        &self,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<ConnectionInstall, Arc<dyn BrokerConnection>> {
        let mut slots = self.slots.lock().await;
        if slots.sealed {
            return Err(connection);
        }
        let displaced = slots.take_all();
        let generation = slots.next_generation();
        slots.connection = Some(ConnectionSlot {
            connection,
            generation,
        });
        Ok(ConnectionInstall {
            generation,
            displaced,
        })
    }

    /// Install a channel opened on connection `connection_generation`.
    ///
    /// Hands the channel back when that connection is no longer installed or
    /// the state has been sealed.
    pub async fn install_channel(
        &self,
        connection_generation: u64,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<ChannelInstall, RejectedChannel> {
        let mut slots = self.slots.lock().await;
        let current = slots.connection.as_ref().map(|slot| slot.generation);
        if slots.sealed || current != Some(connection_generation) {
            return Err(RejectedChannel {
                channel,
                sealed: slots.sealed,
            });
        }
        let generation = slots.next_generation();
        let displaced = slots
            .channel
            .replace(ChannelSlot {
                channel,
                generation,
            })
            .map(|slot| slot.channel);
        Ok(ChannelInstall {
            generation,
            displaced,
        })
    }

    /// The installed connection and its generation
    pub async fn current_connection(&self) -> Option<(Arc<dyn BrokerConnection>, u64)> {
        let slots = self.slots.lock().await;
        slots
            .connection
            .as_ref()
            .map(|slot| (slot.connection.clone(), slot.generation))
    }

    /// The installed connection, if it is still generation `generation`
    pub async fn connection_if(&self, generation: u64) -> Option<Arc<dyn BrokerConnection>> {
        let slots = self.slots.lock().await;
        slots
            .connection
            .as_ref()
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.connection.clone())
    }

    /// Remove the connection (and its channel) if `generation` is still installed
    pub async fn take_connection_if(&self, generation: u64) -> Option<Detached> {
        let mut slots = self.slots.lock().await;
        match slots.connection.as_ref() {
            Some(slot) if slot.generation == generation => Some(slots.take_all()),
            _ => None,
        }
    }

    /// Remove the channel if `generation` is still installed
    pub async fn take_channel_if(&self, generation: u64) -> Option<Arc<dyn BrokerChannel>> {
        let mut slots = self.slots.lock().await;
        match slots.channel.as_ref() {
            Some(slot) if slot.generation == generation => {
                slots.channel.take().map(|slot| slot.channel)
            }
            _ => None,
        }
    }

    /// Remove everything and refuse all later installs
    pub async fn seal(&self) -> Detached {
        let mut slots = self.slots.lock().await;
        slots.sealed = true;
        slots.take_all()
    }

    /// Hold the state lock for the duration of a publish
    pub async fn lock_for_publish(&self) -> PublishGuard<'_> {
        PublishGuard {
            slots: self.slots.lock().await,
        }
    }
}

/// Read-only access to the resources while the state lock is held
pub struct PublishGuard<'a> {
    slots: MutexGuard<'a, Slots>,
}

impl PublishGuard<'_> {
    pub fn connection(&self) -> Option<&Arc<dyn BrokerConnection>> {
        self.slots.connection.as_ref().map(|slot| &slot.connection)
    }

    pub fn channel(&self) -> Option<&Arc<dyn BrokerChannel>> {
        self.slots.channel.as_ref().map(|slot| &slot.channel)
    }
}
