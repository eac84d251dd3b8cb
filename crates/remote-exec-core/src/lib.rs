//! Core abstractions for relaying remote command execution.
//!
//! This crate provides the fundamental building blocks:
//! - `Operation` / `RequestParser` - Collaborator traits for parsing and running work
//! - `OutputRelay` - Ordered hand-off of output chunks to a byte sink
//! - `ExitStatus` - Two-valued outcome and its wire frame

pub mod relay;
pub mod status;
pub mod traits;

pub use relay::{OutputRelay, OutputSender, RelayError, spawn_relay};
pub use status::ExitStatus;
pub use traits::{ExecutionError, Operation, ParseError, RequestParser};
