//! Transport errors.

use russh::ChannelId;
use thiserror::Error;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Peer disconnected before authenticating")]
    NotAuthenticated,
    #[error("Authentication failed for {0}")]
    Unauthorized(String),
    #[error("No usable key in {0}")]
    NoKeys(String),
    #[error("Failed to generate a host key")]
    KeyGeneration,
    #[error("Channel {0:?} is closed")]
    ChannelClosed(ChannelId),
}
