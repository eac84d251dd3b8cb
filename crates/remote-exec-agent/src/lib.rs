//! Remote execution agent.
//!
//! Provides:
//! - `Agent` - Listener loop accepting transport connections
//! - Connection and session handlers relaying `exec` requests to operations
//! - `AgentConfig` - File, environment and CLI configuration

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;

pub use agent::{Agent, AgentOptions, DispatchMode};
pub use config::{AgentConfig, ConfigOverrides};
pub use connection::handle_connection;
pub use error::{AgentError, ConfigError};
pub use session::handle_session;
