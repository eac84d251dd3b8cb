//! Handshake configuration for both sides of a connection.

use std::{collections::HashSet, fmt, path::Path, sync::Arc, time::Duration};

use russh::{SshId, server};
use russh_keys::key::{KeyPair, PublicKey};

use crate::error::TransportError;

/// Default time a client has to finish the SSH handshake and authenticate.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which clients may authenticate.
///
/// With neither tokens nor keys configured every client is accepted,
/// including ones that offer no credentials at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    tokens: HashSet<String>,
    key_fingerprints: HashSet<String>,
}

impl AuthPolicy {
    /// Accept passwords matching one of `tokens`.
    #[must_use]
    pub fn with_tokens<I>(mut self, tokens: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Accept public keys matching one of `keys`.
    #[must_use]
    pub fn with_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        self.key_fingerprints
            .extend(keys.into_iter().map(|key| key.fingerprint()));
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty() && self.key_fingerprints.is_empty()
    }

    #[must_use]
    pub fn permits_token(&self, token: &str) -> bool {
        self.is_open() || self.tokens.contains(token)
    }

    #[must_use]
    pub fn permits_key(&self, key: &PublicKey) -> bool {
        self.is_open() || self.key_fingerprints.contains(&key.fingerprint())
    }
}

/// Immutable server-side handshake configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Identity announced in the SSH version banner.
    pub server_id: String,
    /// Client acceptance policy.
    pub auth: AuthPolicy,
    /// Maximum time from connect to successful authentication.
    pub handshake_timeout: Duration,
    ssh: Arc<server::Config>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_id", &self.server_id)
            .field("auth", &self.auth)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Create a config that accepts every client.
    #[must_use]
    pub fn new(server_id: impl Into<String>, host_key: KeyPair) -> Self {
        let server_id = server_id.into();
        let ssh = server::Config {
            server_id: SshId::Standard(format!("SSH-2.0-{server_id}")),
            keys: vec![host_key],
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..server::Config::default()
        };
        Self {
            server_id,
            auth: AuthPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ssh: Arc::new(ssh),
        }
    }

    /// Replace the auth policy.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    /// Replace the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub(crate) fn ssh(&self) -> Arc<server::Config> {
        Arc::clone(&self.ssh)
    }
}

/// Client-side handshake configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub user: String,
    /// Sent as the SSH password.
    pub token: Option<String>,
    pub identity: Option<Arc<KeyPair>>,
    /// Expected server host key fingerprint. Any key is accepted when unset.
    pub host_fingerprint: Option<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("has_token", &self.token.is_some())
            .field("has_identity", &self.identity.is_some())
            .field("host_fingerprint", &self.host_fingerprint)
            .finish()
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: None,
            identity: None,
            host_fingerprint: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_identity(mut self, key: KeyPair) -> Self {
        self.identity = Some(Arc::new(key));
        self
    }

    #[must_use]
    pub fn with_host_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_fingerprint = Some(fingerprint.into());
        self
    }
}

/// Fresh ed25519 key, for agents started without a configured host key.
///
/// # Errors
/// Returns error if key generation fails.
pub fn generate_host_key() -> Result<KeyPair, TransportError> {
    KeyPair::generate_ed25519().ok_or(TransportError::KeyGeneration)
}

/// Load an unencrypted OpenSSH private key.
///
/// # Errors
/// Returns error if the file cannot be read or decoded.
pub fn load_secret_key(path: &Path) -> Result<KeyPair, TransportError> {
    Ok(russh_keys::load_secret_key(path, None)?)
}

/// Parse `authorized_keys` text. Blank lines and comments are skipped.
///
/// # Errors
/// Returns error if a line holds no decodable key, or no line holds a key.
pub fn parse_authorized_keys(text: &str, origin: &str) -> Result<Vec<PublicKey>, TransportError> {
    let mut keys = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Key blobs are base64 of a length-prefixed type name, so they all
        // start with "AAAA"; any leading options or trailing comment is skipped.
        let blob = line
            .split_whitespace()
            .find(|field| field.starts_with("AAAA"))
            .ok_or_else(|| TransportError::NoKeys(origin.to_string()))?;
        keys.push(russh_keys::parse_public_key_base64(blob)?);
    }
    if keys.is_empty() {
        return Err(TransportError::NoKeys(origin.to_string()));
    }
    Ok(keys)
}

/// Read and parse an `authorized_keys` file.
///
/// # Errors
/// Returns error if the file cannot be read or holds no usable key.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>, TransportError> {
    let text = std::fs::read_to_string(path)?;
    parse_authorized_keys(&text, &path.display().to_string())
}
