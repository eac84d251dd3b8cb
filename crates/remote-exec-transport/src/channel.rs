//! Server-side channel and request handles.

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use russh::{ChannelId, CryptoVec, server::Handle};
use tokio::{io::AsyncWrite, sync::mpsc};

use crate::{error::TransportError, protocol::status_word};

/// Largest payload handed to the session in one data message.
const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Open/closed flag shared by everything that refers to one channel.
///
/// Set when the peer closes the channel, when the connection goes away,
/// or when we close it ourselves.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClosedFlag(Arc<AtomicBool>);

impl ClosedFlag {
    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A session channel the peer opened.
///
/// The SSH layer has already confirmed the channel; requests sent on it
/// queue up until it is accepted. If the peer closes it first, the request
/// stream handed out by [`NewChannel::accept`] is already finished.
pub struct NewChannel {
    id: ChannelId,
    handle: Handle,
    requests: mpsc::UnboundedReceiver<ChannelRequest>,
    closed: ClosedFlag,
}

impl std::fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewChannel")
            .field("id", &self.id)
            .field("closed", &self.closed.is_set())
            .finish_non_exhaustive()
    }
}

impl NewChannel {
    pub(crate) const fn new(
        id: ChannelId,
        handle: Handle,
        requests: mpsc::UnboundedReceiver<ChannelRequest>,
        closed: ClosedFlag,
    ) -> Self {
        Self {
            id,
            handle,
            requests,
            closed,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Take ownership of the channel and the stream of requests sent on it.
    #[must_use]
    pub fn accept(self) -> (Channel, mpsc::UnboundedReceiver<ChannelRequest>) {
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(forward(self.id, self.handle, queue, self.closed.clone()));

        let channel = Channel {
            id: self.id,
            outbound,
            closed: self.closed,
            close_sent: false,
        };
        (channel, self.requests)
    }
}

/// Messages written to one channel, delivered in order.
#[derive(Debug)]
enum Outbound {
    Data(Vec<u8>),
    ExitStatus(u32),
    Close,
}

async fn forward(
    id: ChannelId,
    handle: Handle,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    closed: ClosedFlag,
) {
    while let Some(message) = queue.recv().await {
        let delivered = match message {
            Outbound::Data(bytes) => handle.data(id, CryptoVec::from_slice(&bytes)).await.is_ok(),
            Outbound::ExitStatus(word) => handle.exit_status_request(id, word).await.is_ok(),
            Outbound::Close => {
                if handle.close(id).await.is_err() {
                    tracing::trace!(channel = ?id, "Session gone before close");
                }
                break;
            }
        };
        if !delivered {
            tracing::debug!(channel = ?id, "Session gone, dropping channel output");
            closed.set();
            break;
        }
    }
}

/// An accepted channel.
///
/// Closing happens exactly once, either through [`Channel::close`] or on drop.
pub struct Channel {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: ClosedFlag,
    close_sent: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether either side has closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    /// Byte sink writing data on this channel.
    #[must_use]
    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            id: self.id,
            outbound: self.outbound.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Send an `exit-status` request carrying the 4-byte `frame`.
    ///
    /// # Errors
    /// Returns error if the channel is already closed.
    pub fn exit_status(&self, frame: [u8; 4]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed(self.id));
        }
        self.outbound
            .send(Outbound::ExitStatus(status_word(frame)))
            .map_err(|_| TransportError::ChannelClosed(self.id))
    }

    /// Close the channel after everything already written. Later calls are
    /// no-ops.
    pub fn close(&mut self) {
        if self.close_sent {
            return;
        }
        self.close_sent = true;
        self.closed.set();
        // The forwarder may already be gone with the session.
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// `AsyncWrite` sink that queues bytes as channel data.
///
/// Writes fail with `BrokenPipe` once the channel is closed.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: ClosedFlag,
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed.is_set() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("channel {:?} is closed", self.id),
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let len = buf.len().min(MAX_DATA_CHUNK);
        match self.outbound.send(Outbound::Data(buf[..len].to_vec())) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A request received on a session channel.
pub struct ChannelRequest {
    channel: ChannelId,
    name: &'static str,
    payload: Vec<u8>,
    handle: Handle,
}

impl std::fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("channel", &self.channel)
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl ChannelRequest {
    pub(crate) const fn new(
        channel: ChannelId,
        name: &'static str,
        payload: Vec<u8>,
        handle: Handle,
    ) -> Self {
        Self {
            channel,
            name,
            payload,
            handle,
        }
    }

    /// Request type tag, e.g. `exec`.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request with a channel success or failure message.
    ///
    /// # Errors
    /// Returns error if the connection is gone.
    pub async fn reply(self, ok: bool) -> Result<(), TransportError> {
        let sent = if ok {
            self.handle.channel_success(self.channel).await
        } else {
            self.handle.channel_failure(self.channel).await
        };
        sent.map_err(|_| TransportError::ConnectionClosed)
    }
}
