//! Request parsing and plugin pipeline execution.
//!
//! Provides:
//! - `AgentRequest` - The JSON payload of an `exec` request
//! - `AgentRequestParser` - `RequestParser` producing runnable pipelines
//! - Command building and shell utilities

pub mod command;
pub mod pipeline;
pub mod request;
pub mod shell;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use pipeline::Pipeline;
pub use request::{AgentRequest, AgentRequestParser};
