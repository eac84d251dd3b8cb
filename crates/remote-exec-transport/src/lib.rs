//! SSH transport for remote execution, built on `russh`.
//!
//! Provides:
//! - Server side: handshake with auth policy and timeout, session channels
//!   and their request streams
//! - Client side: authenticating, opening channels and issuing requests

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use channel::{Channel, ChannelRequest, ChannelWriter, NewChannel};
pub use client::{ChannelEvent, Client, ClientChannel, ExecOutcome, connect};
pub use config::{
    AuthPolicy, ClientConfig, ServerConfig, generate_host_key, load_authorized_keys,
    load_secret_key, parse_authorized_keys,
};
pub use error::TransportError;
pub use russh::ChannelId;
pub use russh_keys::key::{KeyPair, PublicKey};
pub use server::{ConnectionHandle, PeerIdentity, ServerConnection, accept};
