//! Server side of a connection: SSH handshake and channel routing.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use russh::{
    Channel as SshChannel, ChannelId, Disconnect,
    server::{self, Auth, Handle, Msg, Session},
};
use russh_keys::key::PublicKey;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time::{Instant, timeout_at},
};

use crate::{
    channel::{ChannelRequest, ClosedFlag, NewChannel},
    config::{AuthPolicy, ServerConfig},
    error::TransportError,
    protocol::{EXEC, SHELL, SUBSYSTEM},
};

/// Identity the peer authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    user: String,
}

impl PeerIdentity {
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)
    }
}

struct ChannelSlot {
    requests: mpsc::UnboundedSender<ChannelRequest>,
    closed: ClosedFlag,
}

/// Routes SSH events of one connection into channel and request streams.
///
/// Callbacks never wait on the consumer: they queue and return, so a slow
/// session cannot stall the SSH session loop.
struct ServerHandler {
    auth: AuthPolicy,
    authenticated: Option<oneshot::Sender<PeerIdentity>>,
    channels: mpsc::UnboundedSender<NewChannel>,
    slots: HashMap<ChannelId, ChannelSlot>,
}

impl ServerHandler {
    fn decide(&mut self, user: &str, permitted: bool, method: &'static str) -> Auth {
        if !permitted {
            tracing::warn!(user, method, "Authentication rejected");
            return Auth::Reject {
                proceed_with_methods: None,
            };
        }
        if let Some(tx) = self.authenticated.take() {
            let _ = tx.send(PeerIdentity {
                user: user.to_string(),
            });
        }
        Auth::Accept
    }

    fn route(&self, channel: ChannelId, name: &'static str, payload: Vec<u8>, session: &mut Session) {
        let request = ChannelRequest::new(channel, name, payload, session.handle());
        let undelivered = match self.slots.get(&channel) {
            Some(slot) => slot.requests.send(request).is_err(),
            None => true,
        };
        if undelivered {
            tracing::debug!(channel = ?channel, request = name, "Request for a channel nobody serves");
            let _ = session.channel_failure(channel);
        }
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            slot.closed.set();
        }
    }
}

#[async_trait]
impl server::Handler for ServerHandler {
    type Error = TransportError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let permitted = self.auth.is_open();
        Ok(self.decide(user, permitted, "none"))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let permitted = self.auth.permits_token(password);
        Ok(self.decide(user, permitted, "password"))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let permitted = self.auth.permits_key(public_key);
        Ok(self.decide(user, permitted, "publickey"))
    }

    async fn channel_open_session(
        &mut self,
        channel: SshChannel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let closed = ClosedFlag::default();
        let new_channel = NewChannel::new(id, session.handle(), requests, closed.clone());

        if self.channels.send(new_channel).is_err() {
            tracing::debug!(channel = ?id, "Refusing channel, connection is shutting down");
            return Ok(false);
        }
        self.slots.insert(
            id,
            ChannelSlot {
                requests: requests_tx,
                closed,
            },
        );
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, EXEC, data.to_vec(), session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SHELL, Vec::new(), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SUBSYSTEM, name.as_bytes().to_vec(), session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender finishes the request stream, accepted or not.
        if let Some(slot) = self.slots.remove(&channel) {
            slot.closed.set();
        }
        Ok(())
    }
}

/// An authenticated connection and its stream of session channels.
pub struct ServerConnection {
    handle: ConnectionHandle,
    channels: mpsc::UnboundedReceiver<NewChannel>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection").finish_non_exhaustive()
    }
}

impl ServerConnection {
    #[must_use]
    pub const fn peer(&self) -> &PeerIdentity {
        &self.handle.peer
    }

    /// Split into the transport handle and the channel stream.
    ///
    /// The stream ends when the peer disconnects.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<NewChannel>) {
        (self.handle, self.channels)
    }
}

/// Owns the SSH session of a connection.
///
/// Release happens exactly once, on [`ConnectionHandle::close`] or drop, and
/// disconnects the peer if it is still there.
pub struct ConnectionHandle {
    peer: PeerIdentity,
    session: Option<Handle>,
}

impl ConnectionHandle {
    #[must_use]
    pub const fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Release the transport. Later calls are no-ops.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        disconnect(session);
        tracing::debug!(peer = %self.peer, "Connection released");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn disconnect(session: Handle) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        let result = session
            .disconnect(Disconnect::ByApplication, String::new(), "en".to_string())
            .await;
        if let Err(e) = result {
            tracing::trace!("Session already gone: {e}");
        }
    });
}

/// Run the SSH handshake on a raw stream and wait for the client to
/// authenticate.
///
/// # Errors
/// Returns error if key exchange fails, the client disconnects before it
/// authenticates, or the whole handshake takes longer than the configured
/// timeout.
pub async fn accept<IO>(io: IO, config: &ServerConfig) -> Result<ServerConnection, TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let deadline = Instant::now() + config.handshake_timeout;
    let (channels_tx, channels) = mpsc::unbounded_channel();
    let (authenticated_tx, authenticated) = oneshot::channel();
    let handler = ServerHandler {
        auth: config.auth.clone(),
        authenticated: Some(authenticated_tx),
        channels: channels_tx,
        slots: HashMap::new(),
    };

    let running = timeout_at(deadline, server::run_stream(config.ssh(), io, handler))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    let handle = running.handle();
    let mut running = Box::pin(running);

    let outcome = timeout_at(deadline, async {
        tokio::select! {
            biased;
            peer = authenticated => peer.map_err(|_| TransportError::NotAuthenticated),
            ended = &mut running => match ended {
                Ok(()) => Err(TransportError::NotAuthenticated),
                Err(e) => Err(e),
            },
        }
    })
    .await;

    let peer = match outcome {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            disconnect(handle);
            return Err(TransportError::HandshakeTimeout);
        }
    };

    tokio::spawn(async move {
        if let Err(e) = running.await {
            tracing::debug!("SSH session ended: {e}");
        }
    });

    Ok(ServerConnection {
        handle: ConnectionHandle {
            peer,
            session: Some(handle),
        },
        channels,
    })
}
