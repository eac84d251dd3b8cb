//! Agent configuration.
//!
//! Values are resolved in order: built-in defaults, an optional JSON config
//! file, `REMOTE_EXEC_*` environment variables, then command line flags.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use remote_exec_transport::{
    AuthPolicy, ServerConfig, TransportError, generate_host_key, load_authorized_keys,
    load_secret_key,
};
use serde::{Deserialize, Serialize};

use crate::{agent::AgentOptions, error::ConfigError};

pub const ENV_LISTEN: &str = "REMOTE_EXEC_LISTEN";
pub const ENV_DATABASE: &str = "REMOTE_EXEC_DATABASE";
pub const ENV_LOG_JSON: &str = "REMOTE_EXEC_LOG_JSON";

const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 2022));

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Address the listener binds to.
    pub listen: SocketAddr,
    /// Identity announced in the SSH version banner.
    pub server_id: String,
    /// OpenSSH private host key. An ephemeral key is generated when unset.
    pub host_key: Option<PathBuf>,
    /// Accepted client passwords.
    pub auth: Vec<String>,
    /// `authorized_keys` file listing accepted client keys.
    ///
    /// With neither `auth` nor `authorized_keys` every client is accepted.
    pub authorized_keys: Option<PathBuf>,
    pub handshake_timeout_secs: u64,
    /// Handle connections in their own tasks instead of one at a time.
    pub concurrent_connections: bool,
    /// Run the channels of one connection concurrently.
    pub concurrent_channels: bool,
    /// Catalog database bootstrapped at startup, if set.
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            server_id: "remote-exec-agent".to_string(),
            host_key: None,
            auth: Vec::new(),
            authorized_keys: None,
            handshake_timeout_secs: 10,
            concurrent_connections: true,
            concurrent_channels: false,
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<SocketAddr>,
    pub database_path: Option<PathBuf>,
}

impl AgentConfig {
    /// Resolve the configuration from defaults, `file` and the environment.
    ///
    /// `env` looks up a variable by name; pass `|k| std::env::var(k).ok()`
    /// for the process environment.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, an environment
    /// variable holds an invalid value, or the result fails validation.
    pub fn load<F>(file: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid config JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env(ENV_LISTEN) {
            self.listen = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_LISTEN,
                value: value.clone(),
            })?;
        }
        if let Some(value) = env(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env(ENV_LOG_JSON) {
            self.log_json = parse_bool(&value).ok_or(ConfigError::InvalidEnv {
                var: ENV_LOG_JSON,
                value,
            })?;
        }
        Ok(())
    }

    /// Apply command line flags, which take precedence over everything else.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(path) = overrides.database_path {
            self.database_path = Some(path);
        }
    }

    /// Check values that deserialize fine but cannot work.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() || self.server_id.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "server_id must be a single non-empty word".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be positive".into(),
            ));
        }
        if self.auth.iter().any(|token| token.is_empty()) {
            return Err(ConfigError::Invalid("auth tokens must not be empty".into()));
        }
        Ok(())
    }

    /// Handshake configuration shared by every connection.
    ///
    /// # Errors
    /// Returns error if the host key or `authorized_keys` file cannot be
    /// loaded.
    pub fn server_config(&self) -> Result<ServerConfig, TransportError> {
        let host_key = match &self.host_key {
            Some(path) => load_secret_key(path)?,
            None => {
                tracing::warn!("No host_key configured, using an ephemeral host key");
                generate_host_key()?
            }
        };

        let mut auth = AuthPolicy::default().with_tokens(self.auth.iter().cloned());
        if let Some(path) = &self.authorized_keys {
            auth = auth.with_keys(load_authorized_keys(path)?);
        }

        Ok(ServerConfig::new(self.server_id.clone(), host_key)
            .with_auth(auth)
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs)))
    }

    #[must_use]
    pub const fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            concurrent_connections: self.concurrent_connections,
            concurrent_channels: self.concurrent_channels,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use tokio_test::assert_err;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load(None, no_env).unwrap();
        assert_eq!(config.listen, "127.0.0.1:2022".parse().unwrap());
        assert!(config.concurrent_connections);
        assert!(!config.concurrent_channels);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen": "0.0.0.0:4000", "auth": ["secret"], "log_json": false}}"#
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([(ENV_LOG_JSON, "true")]);
        let config =
            AgentConfig::load(Some(file.path()), |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.listen, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(config.auth, vec!["secret"]);
        assert!(config.log_json);
        assert_eq!(config.server_id, "remote-exec-agent");
    }

    #[test]
    fn test_env_then_cli() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LISTEN, "127.0.0.1:5000"),
            (ENV_DATABASE, "/var/lib/agent/catalog.db"),
        ]);
        let mut config = AgentConfig::load(None, |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.listen, "127.0.0.1:5000".parse().unwrap());

        config.apply_overrides(ConfigOverrides {
            listen: Some("127.0.0.1:6000".parse().unwrap()),
            database_path: None,
        });
        assert_eq!(config.listen, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/agent/catalog.db"))
        );
    }

    #[test]
    fn test_invalid_env_value() {
        let err = assert_err!(AgentConfig::load(None, |k| {
            (k == ENV_LISTEN).then(|| "not an address".to_string())
        }));
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_LISTEN, .. }));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen_addr": "0.0.0.0:4000"}}"#).unwrap();
        let err = assert_err!(AgentConfig::load(Some(file.path()), no_env));
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = AgentConfig {
            handshake_timeout_secs: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_server_config_auth() {
        let config = AgentConfig {
            auth: vec!["a".into(), "b".into()],
            ..AgentConfig::default()
        };
        let server = config.server_config().unwrap();
        assert!(server.auth.permits_token("a"));
        assert!(!server.auth.permits_token("c"));
        assert_eq!(server.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_server_config_authorized_keys() {
        let mut keys = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            keys,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAIvuStzQ+4u8MsigQ2N5frlT8gvb3cPVW1xcAfEefWY operator@backup"
        )
        .unwrap();
        let config = AgentConfig {
            authorized_keys: Some(keys.path().to_path_buf()),
            ..AgentConfig::default()
        };

        let server = config.server_config().unwrap();
        assert!(!server.auth.is_open());
        assert!(!server.auth.permits_token(""));
    }

    #[test]
    fn test_missing_host_key_file() {
        let config = AgentConfig {
            host_key: Some(PathBuf::from("/nonexistent/ssh_host_ed25519_key")),
            ..AgentConfig::default()
        };
        assert_err!(config.server_config());
    }

    #[test]
    fn test_server_id_must_be_one_word() {
        let config = AgentConfig {
            server_id: "backup agent".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
