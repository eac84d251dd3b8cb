//! Command building utilities.

use std::path::PathBuf;

use thiserror::Error;

use crate::shell::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<ResolvedCommand, CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program.clone()))?;
        Ok(ResolvedCommand {
            name: program,
            executable,
            args,
        })
    }
}

/// A command whose program has been located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    /// Program as it was requested, used in messages.
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
}

/// Builder for constructing commands.
///
/// The base may carry its own arguments (`"fs-plugin --verbose"`); they are
/// split shell-style before the builder's arguments are appended.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
    /// Arguments appended after the base.
    pub args: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the command.
    ///
    /// # Errors
    /// Returns error if the base cannot be split or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_with_arguments() {
        let parts = CommandBuilder::new("fs-plugin --verbose")
            .arg("backup")
            .args(["--endpoint", "{\"base_dir\": \"/srv\"}"])
            .build()
            .unwrap();

        assert_eq!(parts.program, "fs-plugin");
        assert_eq!(
            parts.args,
            vec!["--verbose", "backup", "--endpoint", "{\"base_dir\": \"/srv\"}"]
        );
    }

    #[test]
    fn test_empty_base() {
        let result = CommandBuilder::new("   ").build();
        assert!(matches!(result, Err(CommandBuildError::EmptyCommand)));
    }

    #[test]
    fn test_unbalanced_quotes() {
        let result = CommandBuilder::new("plugin \"unterminated").build();
        assert!(matches!(result, Err(CommandBuildError::InvalidBase(_))));
    }

    #[tokio::test]
    async fn test_resolve_missing_program() {
        let parts = CommandParts::new("definitely-not-a-real-plugin-xyz".to_string(), vec![]);
        let result = parts.into_resolved().await;
        assert!(matches!(result, Err(CommandBuildError::NotFound(_))));
    }
}
