//! Background close watchers
//!
//! One task per installed connection and one per installed channel. Each
//! waits for its resource's close notification, checks that its generation is
//! still the installed one, and then either stops (deliberate close) or runs
//! recovery (unexpected close).
//!
//! The watchers return boxed futures: recovery spawns fresh watchers, and the
//! explicit `Send` bound breaks the type cycle that would otherwise form.

use super::core::SupervisorCore;
use super::policy::ResourceKind;
use super::state::SupervisorState;
use crate::error::SupervisorError;
use crate::transport::{CloseNotification, CloseReason};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

pub(crate) type WatcherFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Watch connection `generation` until it closes
pub(crate) fn watch_connection(
    core: Arc<SupervisorCore>,
    generation: u64,
    notification: CloseNotification,
) -> WatcherFuture {
    let span = crate::supervisor_span!(watcher = "connection", generation);
    Box::pin(
        async move {
            let outcome = notification.await;

            if core.resources.take_connection_if(generation).await.is_none() {
                debug!("Ignoring close of a superseded connection");
                return;
            }

            match outcome {
                Err(_) => {
                    info!("Connection closed");
                    core.transition(SupervisorState::Closed);
                }
                Ok(reason) => {
                    warn!(reason = %reason, "Connection closed unexpectedly");
                    recover_connection(&core, reason).await;
                }
            }
        }
        .instrument(span),
    )
}

/// Watch channel `generation` until it closes
pub(crate) fn watch_channel(
    core: Arc<SupervisorCore>,
    generation: u64,
    notification: CloseNotification,
) -> WatcherFuture {
    let span = crate::supervisor_span!(watcher = "channel", generation);
    Box::pin(
        async move {
            let outcome = notification.await;

            if core.resources.take_channel_if(generation).await.is_none() {
                debug!("Ignoring close of a superseded channel");
                return;
            }

            let reason = match outcome {
                Err(_) => {
                    info!("Channel closed");
                    return;
                }
                Ok(reason) => reason,
            };

            warn!(reason = %reason, "Channel closed unexpectedly");
            match core.acquire_channel().await {
                Ok(()) => info!("Channel reopened"),
                Err(SupervisorError::Superseded | SupervisorError::ShutDown) => {
                    debug!("Connection replaced or closed, not reopening channel");
                }
                Err(e) => {
                    error!(error = %e, "Unable to reopen channel");
                    core.escalate(channel_failure_kind(&e), e.to_string()).await;
                }
            }
        }
        .instrument(span),
    )
}

/// Reconnect after an unexpected connection loss, escalating on failure.
///
/// Only escalates while the connection this task installed is still the
/// current one. If it was lost again and taken over by a newer watcher, that
/// watcher owns recovery from then on.
async fn recover_connection(core: &Arc<SupervisorCore>, reason: CloseReason) {
    core.transition(SupervisorState::Reconnecting);

    let generation = match core.acquire_connection().await {
        Ok(generation) => generation,
        Err(SupervisorError::ShutDown) => {
            info!("Supervisor closed while reconnecting");
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to reconnect to broker");
            core.escalate(
                ResourceKind::Connection,
                format!("connection lost ({reason}), reconnect failed: {e}"),
            )
            .await;
            return;
        }
    };

    let e = match core.acquire_channel_on(generation).await {
        Ok(()) => {
            core.transition(SupervisorState::Connected);
            info!("Connection recovered");
            return;
        }
        Err(SupervisorError::Superseded | SupervisorError::ShutDown) => {
            info!(generation, "Connection replaced during recovery, handing over");
            return;
        }
        Err(e) => e,
    };

    error!(error = %e, "Failed to open a channel after reconnecting");
    // A failed declaration has already closed the connection it owned
    let still_owned = channel_failure_kind(&e) == ResourceKind::Connection
        || match core.discard_connection(generation).await {
            Ok(owned) => owned,
            Err(cleanup) => {
                warn!(error = %cleanup, "Failed to close new connection");
                true
            }
        };
    if !still_owned {
        info!(generation, "Connection replaced during recovery, handing over");
        return;
    }

    core.escalate(
        ResourceKind::Connection,
        format!("connection lost ({reason}), channel reopen failed: {e}"),
    )
    .await;
}

/// A failed queue declaration tears the connection down with it, which is a
/// connection-level loss. Anything else only cost the channel.
fn channel_failure_kind(error: &SupervisorError) -> ResourceKind {
    match error {
        SupervisorError::QueueDeclareFailed { .. } | SupervisorError::CleanupFailed { .. } => {
            ResourceKind::Connection
        }
        _ => ResourceKind::Channel,
    }
}
