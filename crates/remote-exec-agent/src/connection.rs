//! Per-connection channel dispatch.

use std::sync::Arc;

use remote_exec_core::RequestParser;
use remote_exec_transport::{NewChannel, ServerConnection};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::Instrument;

use crate::session::handle_session;

/// Serve one authenticated connection until the peer disconnects.
///
/// Only session channels reach this point; the transport refuses every
/// other channel kind and declines global requests. Session channels run
/// one at a time in the order they were opened unless `concurrent_channels`
/// is set, in which case each runs in its own task and all of them are
/// joined before returning.
///
/// The transport is released exactly once when this returns, or when the
/// future is dropped or unwinds.
pub async fn handle_connection(
    connection: ServerConnection,
    parser: Arc<dyn RequestParser>,
    concurrent_channels: bool,
) {
    let (mut handle, channels) = connection.into_parts();
    dispatch_channels(channels, parser, concurrent_channels).await;
    handle.close();
}

async fn dispatch_channels(
    mut channels: mpsc::UnboundedReceiver<NewChannel>,
    parser: Arc<dyn RequestParser>,
    concurrent_channels: bool,
) {
    let mut sessions = JoinSet::new();

    while let Some(new_channel) = channels.recv().await {
        let (channel, requests) = new_channel.accept();
        tracing::debug!(channel = ?channel.id(), "Session channel opened");

        let session = handle_session(channel, requests, Arc::clone(&parser));
        if concurrent_channels {
            sessions.spawn(session.in_current_span());
            while let Some(joined) = sessions.try_join_next() {
                log_session_exit(joined);
            }
        } else {
            session.await;
        }
    }

    while let Some(joined) = sessions.join_next().await {
        log_session_exit(joined);
    }
}

fn log_session_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::warn!("Session task failed: {e}");
    }
}
