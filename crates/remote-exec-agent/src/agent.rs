//! Listener loop: accept, handshake, dispatch.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use remote_exec_core::RequestParser;
use remote_exec_transport::{ServerConfig, TransportError, accept};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{connection::handle_connection, error::AgentError};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// How an accepted connection is handled relative to the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Handle the connection before accepting the next one.
    Inline,
    /// Handle the connection in its own task.
    Spawned,
}

/// Concurrency switches for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOptions {
    pub concurrent_connections: bool,
    pub concurrent_channels: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            concurrent_connections: true,
            concurrent_channels: false,
        }
    }
}

/// Accepts transport connections and relays their `exec` requests.
///
/// The handshake configuration is fixed at construction and shared by every
/// connection.
#[derive(Clone)]
pub struct Agent {
    config: Arc<ServerConfig>,
    parser: Arc<dyn RequestParser>,
    options: AgentOptions,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("server_id", &self.config.server_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Agent {
    #[must_use]
    pub fn new<P>(config: ServerConfig, parser: P) -> Self
    where
        P: RequestParser + 'static,
    {
        Self {
            config: Arc::new(config),
            parser: Arc::new(parser),
            options: AgentOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    const fn dispatch_mode(&self) -> DispatchMode {
        if self.options.concurrent_connections {
            DispatchMode::Spawned
        } else {
            DispatchMode::Inline
        }
    }

    /// Accept connections until the listener fails fatally.
    ///
    /// # Errors
    /// Returns `AgentError::Accept` on a non-recoverable accept error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), AgentError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves or the listener fails
    /// fatally. Connections still in flight at that point are aborted, which
    /// releases their transports.
    ///
    /// Transient accept errors are logged and retried after a short pause.
    ///
    /// # Errors
    /// Returns `AgentError::Accept` on a non-recoverable accept error.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, server_id = %self.config.server_id, "Agent listening");
        }

        let mode = self.dispatch_mode();
        let mut connections = JoinSet::new();
        let mut last_error = None::<io::ErrorKind>;
        tokio::pin!(shutdown);

        let result = loop {
            let (stream, remote) = tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Connection task failed: {e}");
                    }
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => {
                        last_error = None;
                        accepted
                    }
                    Err(e) if is_fatal_accept_error(&e) => break Err(AgentError::Accept(e)),
                    Err(e) => {
                        if last_error != Some(e.kind()) {
                            tracing::warn!("Accept failed: {e}");
                        }
                        last_error = Some(e.kind());
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            match mode {
                DispatchMode::Spawned => {
                    let agent = self.clone();
                    connections.spawn(async move { agent.serve_stream(stream, remote).await });
                }
                DispatchMode::Inline => {
                    tokio::select! {
                        () = &mut shutdown => {
                            tracing::info!("Shutdown requested");
                            break Ok(());
                        }
                        () = self.serve_stream(stream, remote) => {}
                    }
                }
            }
        };

        if !connections.is_empty() {
            tracing::info!(connections = connections.len(), "Aborting open connections");
        }
        connections.shutdown().await;
        result
    }

    /// Accept and handshake exactly one connection.
    ///
    /// With [`DispatchMode::Inline`] the connection is served before this
    /// returns and a handshake failure is returned as an error. With
    /// [`DispatchMode::Spawned`] it is served in a detached task and this
    /// returns right after the accept.
    ///
    /// # Errors
    /// Returns error if the accept fails, or the handshake fails inline.
    pub async fn serve_one(&self, listener: &TcpListener, mode: DispatchMode) -> Result<(), AgentError> {
        let (stream, remote) = listener.accept().await.map_err(AgentError::Accept)?;

        match mode {
            DispatchMode::Inline => {
                let span = tracing::info_span!("remote", %remote);
                self.handle_stream(stream).instrument(span).await?;
            }
            DispatchMode::Spawned => {
                let agent = self.clone();
                tokio::spawn(async move { agent.serve_stream(stream, remote).await });
            }
        }
        Ok(())
    }

    async fn serve_stream(&self, stream: TcpStream, remote: SocketAddr) {
        let span = tracing::info_span!("remote", %remote);
        if let Err(e) = self.handle_stream(stream).instrument(span).await {
            tracing::warn!(%remote, "Handshake failed: {e}");
        }
    }

    /// Handshake on `io` and serve the resulting connection to completion.
    ///
    /// # Errors
    /// Returns error if the handshake fails.
    pub async fn handle_stream<IO>(&self, io: IO) -> Result<(), TransportError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = accept(io, &self.config).await?;

        let span = tracing::info_span!(
            "connection",
            id = %Uuid::new_v4(),
            peer = %connection.peer(),
        );
        async {
            tracing::info!("Connection established");
            handle_connection(
                connection,
                Arc::clone(&self.parser),
                self.options.concurrent_channels,
            )
            .await;
            tracing::info!("Connection closed");
        }
        .instrument(span)
        .await;

        Ok(())
    }
}

/// Errors that mean the listener itself is unusable.
fn is_fatal_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}
