//! Session channel handling: one `exec` per channel.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use remote_exec_core::{ExecutionError, ExitStatus, Operation, RequestParser, spawn_relay};
use remote_exec_transport::{Channel, ChannelRequest, protocol::EXEC};
use tokio::sync::mpsc;

/// Serve the requests of one accepted session channel.
///
/// Requests are handled strictly in arrival order. Anything other than a
/// parseable `exec` gets a negative reply and leaves the channel open; the
/// first accepted `exec` is run to completion, its exit status is sent and
/// the channel is closed. The channel is also closed when the request
/// stream ends first.
///
/// If the peer closes the channel while the operation runs, the operation
/// sees its output closed and no exit status is sent.
pub async fn handle_session(
    mut channel: Channel,
    mut requests: mpsc::UnboundedReceiver<ChannelRequest>,
    parser: Arc<dyn RequestParser>,
) {
    let id = channel.id();

    while let Some(request) = requests.recv().await {
        if request.request_type() != EXEC {
            tracing::warn!(
                channel = ?id,
                request = request.request_type(),
                "Rejecting unsupported request"
            );
            reply(request, false).await;
            continue;
        }

        let operation = match parser.parse(request.payload()) {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!(channel = ?id, "Rejecting exec request: {e}");
                reply(request, false).await;
                continue;
            }
        };
        reply(request, true).await;

        let status = execute(operation, &channel).await;
        if channel.is_closed() {
            tracing::debug!(channel = ?id, "Peer closed the channel, exit status dropped");
        } else if let Err(e) = channel.exit_status(status.to_frame()) {
            tracing::debug!(channel = ?id, "Failed to send exit status: {e}");
        }
        break;
    }

    channel.close();
    tracing::debug!(channel = ?id, "Session finished");
}

async fn reply(request: ChannelRequest, ok: bool) {
    if let Err(e) = request.reply(ok).await {
        tracing::debug!("Failed to reply to request: {e}");
    }
}

/// Run an operation with its output relayed to the channel.
///
/// Returns only after every chunk the operation produced has been handed
/// to the channel.
async fn execute(operation: Box<dyn Operation>, channel: &Channel) -> ExitStatus {
    let (output, relay) = spawn_relay(channel.writer());

    let result = match AssertUnwindSafe(operation.run(output)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
    };

    if let Err(e) = relay.wait().await {
        tracing::debug!(channel = ?channel.id(), "Output relay stopped early: {e}");
    }

    let status = ExitStatus::from(&result);
    match &result {
        Ok(()) => tracing::info!(channel = ?channel.id(), "Operation succeeded"),
        Err(e) => tracing::info!(channel = ?channel.id(), "Operation failed: {e}"),
    }
    status
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(literal.as_ref()), "boom");

        let owned: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(owned.as_ref()), "bad state");

        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other.as_ref()), "operation panicked");
    }
}
