//! Core traits for parsing and executing operations.

use async_trait::async_trait;
use thiserror::Error;

use crate::OutputSender;

/// Parse error for a raw request payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding,
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Execution error.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Spawn failed for {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {}", .code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    NonZeroExit { program: String, code: Option<i32> },
    #[error("Output relay closed")]
    OutputClosed,
    #[error("Operation panicked: {0}")]
    Panicked(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// A parsed, runnable operation.
///
/// Exclusively owned by the session that parsed it. `run` consumes the
/// operation; dropping the `OutputSender` (which happens when `run` returns)
/// is the end-of-stream signal observed by the relay.
#[async_trait]
pub trait Operation: Send {
    /// Run the operation, streaming text chunks into `output`.
    async fn run(self: Box<Self>, output: OutputSender) -> Result<(), ExecutionError>;
}

/// Trait for turning an `exec` payload into a runnable operation.
pub trait RequestParser: Send + Sync {
    /// Parse a raw request payload.
    ///
    /// # Errors
    /// Returns a descriptive error if the payload is not a valid request.
    fn parse(&self, payload: &[u8]) -> Result<Box<dyn Operation>, ParseError>;
}

impl<P: RequestParser + ?Sized> RequestParser for std::sync::Arc<P> {
    fn parse(&self, payload: &[u8]) -> Result<Box<dyn Operation>, ParseError> {
        (**self).parse(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_message() {
        let err = ExecutionError::NonZeroExit {
            program: "tar".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "tar exited with status 2");

        let err = ExecutionError::NonZeroExit {
            program: "tar".to_string(),
            code: None,
        };
        assert_eq!(err.to_string(), "tar exited with a signal");
    }
}
