//! The connection supervisor
//!
//! Owns the connection/channel pair for one queue, establishes it with bounded
//! retries, publishes onto it, and repairs it from the background close
//! watchers in [`super::watcher`].

use super::config::{redact_uri, SupervisorConfig};
use super::policy::{escalation_for, Escalation, ResourceKind, RetryDecision};
use super::state::{Detached, ResourceSnapshot, SharedResources, SupervisorState};
use super::watcher::{watch_channel, watch_connection};
use crate::config::instance_id_from_env;
use crate::error::{SupervisorError, SupervisorResult};
use crate::transport::{
    Broker, BrokerConnection, MessageHeaders, OutboundMessage, PublishOptions, QueueOptions,
    TransportError,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Content type of every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Resilient publisher for a single durable queue.
///
/// Cheap to clone; clones share the same connection, channel and watchers.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wharf_messagebus::supervisor::{ConnectionSupervisor, SupervisorConfig};
/// use wharf_messagebus::transport::LapinBroker;
///
/// # tokio_test::block_on(async {
/// let config = SupervisorConfig::new(
///     "localhost", 5672, "guest", "guest", "wharf-events", "", true, 5,
/// );
/// let supervisor = ConnectionSupervisor::new(config, Arc::new(LapinBroker::new()))?;
/// supervisor.connect().await?;
/// supervisor.publish(&serde_json::json!({"event": "deployed"})).await?;
/// supervisor.close().await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// ```
#[derive(Clone)]
pub struct ConnectionSupervisor {
    core: Arc<SupervisorCore>,
}

/// State shared between the supervisor handle and its watchers
pub(crate) struct SupervisorCore {
    config: SupervisorConfig,
    instance_id: String,
    broker: Arc<dyn Broker>,
    pub(crate) resources: SharedResources,
    state_tx: watch::Sender<SupervisorState>,
}

impl ConnectionSupervisor {
    /// Create a supervisor, reading the instance id from `WHARF_INSTANCE`.
    ///
    /// Fails before any network activity when the variable is unset.
    pub fn new(config: SupervisorConfig, broker: Arc<dyn Broker>) -> SupervisorResult<Self> {
        let instance_id = instance_id_from_env()?;
        Ok(Self::with_instance_id(config, broker, instance_id))
    }

    /// Create a supervisor with an explicitly supplied instance id
    pub fn with_instance_id(
        config: SupervisorConfig,
        broker: Arc<dyn Broker>,
        instance_id: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            core: Arc::new(SupervisorCore {
                config,
                instance_id: instance_id.into(),
                broker,
                resources: SharedResources::new(),
                state_tx,
            }),
        }
    }

    /// Establish connection, channel and queue.
    ///
    /// Either everything is up and both watchers are running, or an error is
    /// returned and no connection is left behind. A failed `connect` may be
    /// retried; a closed or abandoned supervisor may not.
    pub async fn connect(&self) -> SupervisorResult<()> {
        let core = &self.core;
        if core.state().is_terminal() {
            return Err(SupervisorError::ShutDown);
        }
        core.transition(SupervisorState::Connecting);

        let span = crate::supervisor_span!(operation = "connect", queue = %core.config.queue);
        async {
            let generation = match core.acquire_connection().await {
                Ok(generation) => generation,
                Err(e) => {
                    error!(error = %e, "Failed to connect to broker");
                    core.transition(SupervisorState::Idle);
                    return Err(e);
                }
            };

            if let Err(e) = core.acquire_channel_on(generation).await {
                error!(error = %e, "Failed to open a channel");
                core.transition(SupervisorState::Idle);
                return Err(match core.discard_connection(generation).await {
                    Ok(_) => e,
                    Err(cleanup) => {
                        error!(error = %cleanup, "Failed to close connection");
                        e.with_cleanup_failure(cleanup)
                    }
                });
            }

            core.transition(SupervisorState::Connected);
            info!("Message bus connected");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Serialize `message` to JSON and publish it onto the queue
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> SupervisorResult<()> {
        let body = serde_json::to_vec(message)?;
        self.publish_raw(body).await
    }

    /// Publish an already-encoded JSON body onto the queue.
    ///
    /// Holds the state lock for the whole call, so a publish never interleaves
    /// with recovery.
    pub async fn publish_raw(&self, body: Vec<u8>) -> SupervisorResult<()> {
        let core = &self.core;
        let guard = core.resources.lock_for_publish().await;

        let Some(connection) = guard.connection() else {
            warn!("Failed to publish a message, connection is missing");
            return Err(SupervisorError::PublishWithoutConnection);
        };
        if connection.is_closed() {
            warn!("Failed to publish a message, connection is closed");
            return Err(SupervisorError::PublishOnClosedConnection);
        }
        let Some(channel) = guard.channel() else {
            warn!("Failed to publish a message, channel is missing");
            return Err(SupervisorError::PublishWithoutChannel);
        };

        let message = core.outbound(body);
        channel
            .publish(PublishOptions::default(), message)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to publish a message");
                SupervisorError::PublishFailed(e)
            })
    }

    /// Tear down channel then connection.
    ///
    /// Each present resource is closed even if the other failed; the first
    /// failure is returned. The supervisor is terminal afterwards.
    pub async fn close(&self) -> SupervisorResult<()> {
        let core = &self.core;
        core.transition(SupervisorState::Closed);

        let detached = core.resources.seal().await;
        if detached.is_empty() {
            debug!("Nothing to close");
            return Ok(());
        }
        core.close_detached(detached)
            .await
            .map_err(|(kind, source)| SupervisorError::CloseFailed { kind, source })
    }

    /// Caller-facing signal: becomes `Closed` on shutdown and
    /// `Abandoned` when connection recovery gives up
    pub fn unexpected_close(&self) -> watch::Receiver<SupervisorState> {
        self.core.state_tx.subscribe()
    }

    /// Wait until the supervisor reaches a terminal state
    pub async fn wait_for_termination(&self) -> SupervisorState {
        let mut state_rx = self.unexpected_close();
        wait_for_terminal(&mut state_rx).await
    }

    pub fn state(&self) -> SupervisorState {
        self.core.state()
    }

    /// Which resources are installed right now
    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.core.resources.snapshot().await
    }

    pub fn instance_id(&self) -> &str {
        &self.core.instance_id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.core.config
    }
}

impl SupervisorCore {
    pub(crate) fn state(&self) -> SupervisorState {
        self.state_tx.borrow().clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.state_tx.borrow().is_terminal()
    }

    /// Move to `next` unless already terminal. Returns whether it changed.
    pub(crate) fn transition(&self, next: SupervisorState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "Supervisor state transition");
            *current = next;
            true
        })
    }

    /// Apply the escalation policy for a failed recovery of `kind`.
    ///
    /// Abandoning seals the resources the same way `close` does. The caller
    /// signal fires only once nothing is left installed.
    pub(crate) async fn escalate(&self, kind: ResourceKind, reason: String) {
        match escalation_for(kind) {
            Escalation::NotifyCaller => {
                if self.state().is_terminal() {
                    return;
                }
                let detached = self.resources.seal().await;
                if let Err((kind, e)) = self.close_detached(detached).await {
                    warn!(resource = %kind, error = %e, "Failed to close abandoned resource");
                }
                if self.transition(SupervisorState::Abandoned(reason.clone())) {
                    error!(resource = %kind, reason = %reason, "Supervision abandoned");
                }
            }
            Escalation::LogOnly => {
                warn!(resource = %kind, reason = %reason, "Recovery failed, not escalating");
            }
        }
    }

    /// Dial with bounded, fixed-delay retries and install the connection.
    ///
    /// The state lock is not held while dialing. Returns the generation of
    /// the installed connection.
    pub(crate) async fn acquire_connection(self: &Arc<Self>) -> SupervisorResult<u64> {
        let uri = self.config.amqp_uri()?;
        let redacted = redact_uri(&uri);
        let tls = self.config.tls_policy();
        let retry = self.config.retry;

        let mut completed = 0u64;
        let mut last_error: Option<TransportError> = None;

        loop {
            let attempt = match retry.decide(completed, self.is_shutting_down()) {
                RetryDecision::Proceed { attempt } => attempt,
                RetryDecision::AbortShutdownRequested => return Err(SupervisorError::ShutDown),
                RetryDecision::AbortExhausted => {
                    return Err(match last_error {
                        Some(source) => SupervisorError::ConnectFailed {
                            attempts: completed,
                            source,
                        },
                        None => SupervisorError::NoAttempts,
                    });
                }
            };

            info!(
                attempt,
                max_attempts = retry.max_attempts,
                uri = %redacted,
                "Trying to connect to broker"
            );

            match self.broker.dial(uri.as_str(), tls.as_ref()).await {
                Ok(connection) => return self.adopt_connection(connection, &redacted).await,
                Err(e) => {
                    warn!(attempt, uri = %redacted, error = %e, "Broker dial failed");
                    last_error = Some(e);
                    completed = attempt;
                    if retry.has_attempt_after(attempt)
                        && !self.interruptible_sleep(retry.delay).await
                    {
                        return Err(SupervisorError::ShutDown);
                    }
                }
            }
        }
    }

    async fn adopt_connection(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
        redacted_uri: &str,
    ) -> SupervisorResult<u64> {
        let notification = connection.notify_close();
        match self.resources.install_connection(connection).await {
            Ok(install) => {
                tokio::spawn(watch_connection(
                    Arc::clone(self),
                    install.generation,
                    notification,
                ));
                if !install.displaced.is_empty() {
                    warn!("Replacing a connection that was still installed");
                    if let Err((kind, e)) = self.close_detached(install.displaced).await {
                        warn!(resource = %kind, error = %e, "Failed to close replaced resource");
                    }
                }
                info!(uri = %redacted_uri, generation = install.generation, "Connected to broker");
                Ok(install.generation)
            }
            Err(connection) => {
                drop(notification);
                info!("Supervisor closed while dialing, dropping new connection");
                if let Err(e) = connection.close().await {
                    warn!(error = %e, "Failed to close connection");
                }
                Err(SupervisorError::ShutDown)
            }
        }
    }

    /// Open a channel on whichever connection is installed and declare the queue
    pub(crate) async fn acquire_channel(self: &Arc<Self>) -> SupervisorResult<()> {
        let (_, generation) = self
            .resources
            .current_connection()
            .await
            .ok_or(SupervisorError::MissingConnection)?;
        self.acquire_channel_on(generation).await
    }

    /// Open a channel on connection `connection_generation` and declare the queue.
    ///
    /// Never creates a connection. A failed declaration closes the connection.
    /// Fails with `Superseded` once that connection is no longer installed.
    pub(crate) async fn acquire_channel_on(
        self: &Arc<Self>,
        connection_generation: u64,
    ) -> SupervisorResult<()> {
        let connection = match self.resources.connection_if(connection_generation).await {
            Some(connection) => connection,
            None => return Err(self.lost_connection_error().await),
        };

        let channel = connection
            .open_channel()
            .await
            .map_err(SupervisorError::ChannelFailed)?;
        let notification = channel.notify_close();

        if let Err(source) = channel
            .declare_queue(&self.config.queue, QueueOptions::durable())
            .await
        {
            error!(queue = %self.config.queue, error = %source, "Failed to declare a queue");
            let declare_error = SupervisorError::QueueDeclareFailed {
                queue: self.config.queue.clone(),
                source,
            };
            return Err(match self.discard_connection(connection_generation).await {
                Ok(true) => declare_error,
                Ok(false) => {
                    debug!(error = %declare_error, "Connection replaced before the failed declare");
                    self.lost_connection_error().await
                }
                Err(cleanup) => {
                    error!(error = %cleanup, "Failed to close connection");
                    declare_error.with_cleanup_failure(cleanup)
                }
            });
        }

        match self
            .resources
            .install_channel(connection_generation, channel)
            .await
        {
            Ok(install) => {
                tokio::spawn(watch_channel(
                    Arc::clone(self),
                    install.generation,
                    notification,
                ));
                if let Some(displaced) = install.displaced {
                    if let Err(e) = displaced.close().await {
                        warn!(error = %e, "Failed to close replaced channel");
                    }
                }
                debug!(
                    queue = %self.config.queue,
                    generation = install.generation,
                    "Channel open and queue declared"
                );
                Ok(())
            }
            Err(rejected) => {
                drop(notification);
                info!("Connection went away while opening a channel, closing it");
                if let Err(e) = rejected.channel.close().await {
                    debug!(error = %e, "Failed to close orphaned channel");
                }
                Err(if rejected.sealed {
                    SupervisorError::ShutDown
                } else {
                    SupervisorError::Superseded
                })
            }
        }
    }

    /// Why a connection this task was working on is gone
    async fn lost_connection_error(&self) -> SupervisorError {
        if self.resources.snapshot().await.sealed {
            SupervisorError::ShutDown
        } else {
            SupervisorError::Superseded
        }
    }

    /// Remove connection `generation` (and its channel) and close them.
    ///
    /// Returns `false` when that generation was no longer installed, in which
    /// case whoever replaced it owns the cleanup.
    pub(crate) async fn discard_connection(
        &self,
        generation: u64,
    ) -> Result<bool, TransportError> {
        match self.resources.take_connection_if(generation).await {
            Some(detached) => self
                .close_detached(detached)
                .await
                .map(|()| true)
                .map_err(|(_, e)| e),
            None => Ok(false),
        }
    }

    /// Close channel first, then connection if it is not already closed
    pub(crate) async fn close_detached(
        &self,
        detached: Detached,
    ) -> Result<(), (ResourceKind, TransportError)> {
        let mut first_error = None;

        if let Some(channel) = detached.channel {
            info!(
                host = %self.config.host,
                port = self.config.port,
                queue = %self.config.queue,
                "Closing message queue channel"
            );
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close channel");
                first_error = Some((ResourceKind::Channel, e));
            }
        }

        if let Some(connection) = detached.connection {
            if !connection.is_closed() {
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    queue = %self.config.queue,
                    "Closing message queue connection"
                );
                if let Err(e) = connection.close().await {
                    warn!(error = %e, "Failed to close connection");
                    if first_error.is_none() {
                        first_error = Some((ResourceKind::Connection, e));
                    }
                }
            }
        }

        match first_error {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn outbound(&self, body: Vec<u8>) -> OutboundMessage {
        OutboundMessage {
            exchange: String::new(),
            routing_key: self.config.queue.clone(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: MessageHeaders {
                instance_id: self.instance_id.clone(),
                timestamp: chrono::Utc::now(),
            },
            body,
        }
    }

    /// Sleep for `delay` unless the supervisor shuts down first.
    /// Returns true if the sleep completed.
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        tokio::select! {
            _ = wait_for_terminal(&mut state_rx) => {
                info!("Shutdown requested during reconnect delay, stopping");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn wait_for_terminal(state_rx: &mut watch::Receiver<SupervisorState>) -> SupervisorState {
    loop {
        {
            let state = state_rx.borrow_and_update();
            if state.is_terminal() {
                return state.clone();
            }
        }
        if state_rx.changed().await.is_err() {
            return state_rx.borrow().clone();
        }
    }
}
