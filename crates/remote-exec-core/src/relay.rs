//! Ordered hand-off of output chunks from an operation to a byte sink.

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

/// At most one chunk is held between producer and forwarder.
const RELAY_CAPACITY: usize = 1;

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Output relay closed")]
    Closed,
    #[error("Sink write failed: {0}")]
    Sink(#[source] std::io::Error),
    #[error("Relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Producer side of an output relay.
///
/// Clones share the same relay; the forwarder finishes once every clone
/// has been dropped.
#[derive(Debug, Clone)]
pub struct OutputSender {
    tx: mpsc::Sender<String>,
}

impl OutputSender {
    /// Hand a chunk to the relay, waiting until the previous one was taken.
    ///
    /// # Errors
    /// Returns `RelayError::Closed` once the forwarder has stopped, which
    /// happens when the sink fails.
    pub async fn send(&self, chunk: impl Into<String>) -> Result<(), RelayError> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Whether the forwarder has stopped accepting chunks.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Forwarded<W> {
    sink: W,
    error: Option<std::io::Error>,
}

/// Consumer side of an output relay: a spawned forwarding loop.
pub struct OutputRelay<W> {
    handle: JoinHandle<Forwarded<W>>,
}

impl<W> OutputRelay<W> {
    /// Wait until every chunk has been written and all senders are gone.
    ///
    /// Returns the sink so callers can keep using it.
    ///
    /// # Errors
    /// Returns error if a sink write failed or the forwarder panicked.
    pub async fn wait(self) -> Result<W, RelayError> {
        let forwarded = self.handle.await?;
        match forwarded.error {
            Some(e) => Err(RelayError::Sink(e)),
            None => Ok(forwarded.sink),
        }
    }
}

/// Spawn a relay that writes every chunk to `sink` in production order.
///
/// A sink write failure stops the forwarder; subsequent `send` calls then
/// fail, which is how a running operation learns that its peer went away.
pub fn spawn_relay<W>(sink: W) -> (OutputSender, OutputRelay<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(RELAY_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut sink = sink;
        let mut chunks = 0usize;
        let mut error = None;

        while let Some(chunk) = rx.recv().await {
            let written = async {
                sink.write_all(chunk.as_bytes()).await?;
                sink.flush().await
            }
            .await;

            if let Err(e) = written {
                tracing::warn!(chunks, "Output sink failed: {e}");
                error = Some(e);
                break;
            }
            chunks += 1;
        }

        tracing::trace!(chunks, "Output relay finished");
        Forwarded { sink, error }
    });

    (OutputSender { tx }, OutputRelay { handle })
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (output, relay) = spawn_relay(Vec::new());

        for chunk in ["one\n", "two\n", "three\n"] {
            assert_ok!(output.send(chunk).await);
        }
        drop(output);

        let sink = relay.wait().await.unwrap();
        assert_eq!(sink, b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_completes_when_all_clones_dropped() {
        let (output, relay) = spawn_relay(Vec::new());
        let second = output.clone();

        let producer = tokio::spawn(async move {
            second.send("from clone\n").await.unwrap();
        });
        producer.await.unwrap();
        output.send("from original\n").await.unwrap();
        drop(output);

        let sink = relay.wait().await.unwrap();
        assert_eq!(sink, b"from clone\nfrom original\n");
    }

    #[tokio::test]
    async fn test_empty_output() {
        let (output, relay) = spawn_relay(Vec::new());
        drop(output);
        assert!(relay.wait().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_closes_sender() {
        let (output, relay) = spawn_relay(BrokenSink);

        // The first chunk is accepted into the queue and then fails to write.
        assert_ok!(output.send("lost\n").await);
        let result = relay.wait().await;
        assert!(matches!(result, Err(RelayError::Sink(_))));

        assert!(output.is_closed());
        assert_err!(output.send("after\n").await);
    }
}
