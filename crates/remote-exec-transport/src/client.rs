//! Client side of a connection.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use russh::{
    Channel as SshChannel, ChannelMsg, Disconnect,
    client::{self, Handle, Msg},
};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config::ClientConfig, error::TransportError, protocol::status_frame};

/// Something that happened on a client channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output data from the server.
    Data(Vec<u8>),
    /// Payload bytes of an `exit-status` request.
    ExitStatus([u8; 4]),
    /// Reply to a request we sent.
    Reply(bool),
    /// The server closed the channel.
    Closed,
}

/// Result of running one `exec` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Whether the server acknowledged the request.
    pub accepted: bool,
    /// Concatenated output data.
    pub output: Vec<u8>,
    /// Raw exit-status frame, if one arrived.
    pub status_frame: Option<[u8; 4]>,
}

impl ExecOutcome {
    /// First byte of the exit-status frame.
    #[must_use]
    pub fn exit_code(&self) -> Option<u8> {
        self.status_frame.map(|frame| frame[0])
    }
}

struct HostKeyCheck {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected {
            Some(expected) if *expected != fingerprint => {
                tracing::warn!(%fingerprint, %expected, "Server host key mismatch");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                tracing::debug!(%fingerprint, "Accepting unpinned server host key");
                Ok(true)
            }
        }
    }
}

/// A connected, authenticated client.
pub struct Client {
    handle: Handle<HostKeyCheck>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Run the SSH handshake on a raw stream and authenticate.
///
/// Authenticates with the identity key if one is configured, otherwise with
/// the token as password, otherwise with the `none` method.
///
/// # Errors
/// Returns error if the handshake fails or the server rejects the credentials.
pub async fn connect<IO>(io: IO, config: &ClientConfig) -> Result<Client, TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = HostKeyCheck {
        expected: config.host_fingerprint.clone(),
    };
    let mut handle = client::connect_stream(Arc::new(client::Config::default()), io, handler).await?;

    let user = config.user.clone();
    let authenticated = if let Some(key) = &config.identity {
        handle.authenticate_publickey(user, Arc::clone(key)).await?
    } else if let Some(token) = &config.token {
        handle.authenticate_password(user, token.clone()).await?
    } else {
        handle.authenticate_none(user).await?
    };

    if !authenticated {
        return Err(TransportError::Unauthorized(config.user.clone()));
    }
    Ok(Client { handle })
}

impl Client {
    /// Open a session channel.
    ///
    /// # Errors
    /// Returns error if the server refuses the channel.
    pub async fn open_session(&self) -> Result<ClientChannel, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(ClientChannel::new(channel))
    }

    /// Open a `direct-tcpip` channel.
    ///
    /// # Errors
    /// Returns error if the server refuses the channel.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
    ) -> Result<ClientChannel, TransportError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await?;
        Ok(ClientChannel::new(channel))
    }

    /// Say goodbye to the server.
    ///
    /// # Errors
    /// Returns error if the session is already gone.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// A channel opened by the client.
#[derive(Debug)]
pub struct ClientChannel {
    channel: SshChannel<Msg>,
    buffered: VecDeque<ChannelEvent>,
    closed: bool,
}

impl ClientChannel {
    const fn new(channel: SshChannel<Msg>) -> Self {
        Self {
            channel,
            buffered: VecDeque::new(),
            closed: false,
        }
    }

    /// Send an `exec` request and wait for its reply.
    ///
    /// Events that arrive before the reply stay queued for
    /// [`ClientChannel::next_event`].
    ///
    /// # Errors
    /// Returns error if the channel closes before the reply.
    pub async fn exec_request(&mut self, payload: &[u8]) -> Result<bool, TransportError> {
        self.channel.exec(true, payload.to_vec()).await?;
        self.await_reply().await
    }

    /// Send a `shell` request and wait for its reply.
    ///
    /// # Errors
    /// Returns error if the channel closes before the reply.
    pub async fn shell_request(&mut self) -> Result<bool, TransportError> {
        self.channel.request_shell(true).await?;
        self.await_reply().await
    }

    /// Send a `subsystem` request and wait for its reply.
    ///
    /// # Errors
    /// Returns error if the channel closes before the reply.
    pub async fn subsystem_request(&mut self, name: &str) -> Result<bool, TransportError> {
        self.channel.request_subsystem(true, name).await?;
        self.await_reply().await
    }

    async fn await_reply(&mut self) -> Result<bool, TransportError> {
        let mut held = VecDeque::new();
        let reply = loop {
            match self.receive().await {
                Some(ChannelEvent::Reply(ok)) => break Ok(ok),
                Some(event) => held.push_back(event),
                None => break Err(TransportError::ChannelClosed(self.channel.id())),
            }
        };
        held.append(&mut self.buffered);
        self.buffered = held;
        reply
    }

    /// Next event on the channel; `None` once it is closed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.buffered.pop_front() {
            return Some(event);
        }
        self.receive().await
    }

    async fn receive(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Data(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => {
                    ChannelEvent::ExitStatus(status_frame(exit_status))
                }
                ChannelMsg::Success => ChannelEvent::Reply(true),
                ChannelMsg::Failure => ChannelEvent::Reply(false),
                ChannelMsg::Close => {
                    self.closed = true;
                    ChannelEvent::Closed
                }
                _ => continue,
            };
            return Some(event);
        }
    }

    /// Run one `exec` request to completion and collect what it produced.
    ///
    /// # Errors
    /// Returns error if the channel closes before the reply.
    pub async fn exec(&mut self, payload: &[u8]) -> Result<ExecOutcome, TransportError> {
        let accepted = self.exec_request(payload).await?;
        let mut outcome = ExecOutcome {
            accepted,
            output: Vec::new(),
            status_frame: None,
        };
        if !accepted {
            return Ok(outcome);
        }

        while let Some(event) = self.next_event().await {
            match event {
                ChannelEvent::Data(data) => outcome.output.extend_from_slice(&data),
                ChannelEvent::ExitStatus(frame) => outcome.status_frame = Some(frame),
                ChannelEvent::Closed => break,
                ChannelEvent::Reply(_) => {}
            }
        }
        Ok(outcome)
    }

    /// Close the channel from our side.
    ///
    /// # Errors
    /// Returns error if the session is already gone.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.channel.close().await?;
        Ok(())
    }
}
