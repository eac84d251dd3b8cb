//! `exec` request payloads and their parser.

use remote_exec_core::{Operation, ParseError, RequestParser};
use serde::{Deserialize, Serialize};

use crate::{
    command::{CommandBuilder, CommandParts},
    pipeline::Pipeline,
    shell::get_shell_command,
};

/// The JSON body of an `exec` request, tagged by `operation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Stream a target's backup into a store.
    Backup {
        target_plugin: String,
        target_endpoint: String,
        store_plugin: String,
        store_endpoint: String,
    },
    /// Stream an archive from a store back into a target.
    Restore {
        target_plugin: String,
        target_endpoint: String,
        store_plugin: String,
        store_endpoint: String,
        restore_key: String,
    },
    /// Remove an archive from a store.
    Purge {
        store_plugin: String,
        store_endpoint: String,
        restore_key: String,
    },
    /// Run a shell command line.
    Run { command: String },
}

impl AgentRequest {
    /// Parse and validate a raw payload.
    ///
    /// # Errors
    /// Returns error if the payload is not UTF-8, not a known request, or
    /// has an empty required field.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidEncoding)?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;

        match value.get("operation").and_then(serde_json::Value::as_str) {
            Some("backup" | "restore" | "purge" | "run") => {}
            Some(other) => return Err(ParseError::UnsupportedOperation(other.to_string())),
            None => return Err(ParseError::MissingField("operation")),
        }

        let request: Self =
            serde_json::from_value(value).map_err(|e| ParseError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Operation name as it appears on the wire.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Restore { .. } => "restore",
            Self::Purge { .. } => "purge",
            Self::Run { .. } => "run",
        }
    }

    fn validate(&self) -> Result<(), ParseError> {
        let required: Vec<(&'static str, &str)> = match self {
            Self::Backup {
                target_plugin,
                store_plugin,
                ..
            } => vec![("target_plugin", target_plugin.as_str()), ("store_plugin", store_plugin.as_str())],
            Self::Restore {
                target_plugin,
                store_plugin,
                restore_key,
                ..
            } => vec![
                ("target_plugin", target_plugin.as_str()),
                ("store_plugin", store_plugin.as_str()),
                ("restore_key", restore_key.as_str()),
            ],
            Self::Purge {
                store_plugin,
                restore_key,
                ..
            } => vec![("store_plugin", store_plugin.as_str()), ("restore_key", restore_key.as_str())],
            Self::Run { command } => vec![("command", command.as_str())],
        };

        match required.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(ParseError::MissingField(field)),
            None => Ok(()),
        }
    }

    /// Build the command stages for this request.
    ///
    /// # Errors
    /// Returns error if a plugin command line cannot be split.
    pub fn plan(&self) -> Result<Vec<CommandParts>, ParseError> {
        let stages = match self {
            Self::Backup {
                target_plugin,
                target_endpoint,
                store_plugin,
                store_endpoint,
            } => vec![
                plugin(target_plugin, "backup", None, target_endpoint)?,
                plugin(store_plugin, "store", None, store_endpoint)?,
            ],
            Self::Restore {
                target_plugin,
                target_endpoint,
                store_plugin,
                store_endpoint,
                restore_key,
            } => vec![
                plugin(store_plugin, "retrieve", Some(restore_key.as_str()), store_endpoint)?,
                plugin(target_plugin, "restore", None, target_endpoint)?,
            ],
            Self::Purge {
                store_plugin,
                store_endpoint,
                restore_key,
            } => vec![plugin(store_plugin, "purge", Some(restore_key.as_str()), store_endpoint)?],
            Self::Run { command } => {
                let (shell, flag) = get_shell_command();
                vec![CommandParts::new(
                    shell.to_string_lossy().into_owned(),
                    vec![flag.to_string(), command.clone()],
                )]
            }
        };
        Ok(stages)
    }
}

fn plugin(
    base: &str,
    action: &str,
    key: Option<&str>,
    endpoint: &str,
) -> Result<CommandParts, ParseError> {
    let mut builder = CommandBuilder::new(base).arg(action);
    if let Some(key) = key {
        builder = builder.args(["--key", key]);
    }
    builder
        .args(["--endpoint", endpoint])
        .build()
        .map_err(|e| ParseError::Malformed(e.to_string()))
}

/// Parses `exec` payloads into plugin pipelines.
#[derive(Debug, Default, Clone)]
pub struct AgentRequestParser;

impl RequestParser for AgentRequestParser {
    fn parse(&self, payload: &[u8]) -> Result<Box<dyn Operation>, ParseError> {
        let request = AgentRequest::from_payload(payload)?;
        let stages = request.plan()?;
        Ok(Box::new(Pipeline::new(request.operation(), stages)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_plan() {
        let request = AgentRequest::from_payload(
            br#"{
                "operation": "backup",
                "target_plugin": "fs",
                "target_endpoint": "{\"base_dir\":\"/srv\"}",
                "store_plugin": "s3",
                "store_endpoint": "{\"bucket\":\"b\"}"
            }"#,
        )
        .unwrap();

        let stages = request.plan().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].program, "fs");
        assert_eq!(
            stages[0].args,
            vec!["backup", "--endpoint", "{\"base_dir\":\"/srv\"}"]
        );
        assert_eq!(stages[1].program, "s3");
        assert_eq!(stages[1].args, vec!["store", "--endpoint", "{\"bucket\":\"b\"}"]);
    }

    #[test]
    fn test_restore_plan_reads_from_store_first() {
        let request = AgentRequest::Restore {
            target_plugin: "pg".to_string(),
            target_endpoint: "{}".to_string(),
            store_plugin: "s3".to_string(),
            store_endpoint: "{}".to_string(),
            restore_key: "archive-7".to_string(),
        };

        let stages = request.plan().unwrap();
        assert_eq!(stages[0].program, "s3");
        assert_eq!(
            stages[0].args,
            vec!["retrieve", "--key", "archive-7", "--endpoint", "{}"]
        );
        assert_eq!(stages[1].program, "pg");
        assert_eq!(stages[1].args, vec!["restore", "--endpoint", "{}"]);
    }

    #[test]
    fn test_purge_is_single_stage() {
        let request = AgentRequest::from_payload(
            br#"{"operation":"purge","store_plugin":"s3","store_endpoint":"{}","restore_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(request.plan().unwrap().len(), 1);
    }

    #[test]
    fn test_run_uses_shell() {
        let request =
            AgentRequest::from_payload(br#"{"operation":"run","command":"echo hello"}"#).unwrap();
        let stages = request.plan().unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].args, vec!["-c", "echo hello"]);
    }

    #[test]
    fn test_rejects_non_json() {
        let result = AgentRequest::from_payload(b"echo hello");
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        let result = AgentRequest::from_payload(&[0xff, 0xfe]);
        assert!(matches!(result, Err(ParseError::InvalidEncoding)));
    }

    #[test]
    fn test_rejects_unknown_operation() {
        let result = AgentRequest::from_payload(br#"{"operation":"format-disk"}"#);
        assert!(matches!(result, Err(ParseError::UnsupportedOperation(op)) if op == "format-disk"));
    }

    #[test]
    fn test_rejects_missing_operation() {
        let result = AgentRequest::from_payload(br#"{"command":"ls"}"#);
        assert!(matches!(result, Err(ParseError::MissingField("operation"))));
    }

    #[test]
    fn test_rejects_missing_and_empty_fields() {
        let missing = AgentRequest::from_payload(br#"{"operation":"purge","store_plugin":"s3"}"#);
        assert!(matches!(missing, Err(ParseError::Malformed(_))));

        let empty = AgentRequest::from_payload(br#"{"operation":"run","command":"  "}"#);
        assert!(matches!(empty, Err(ParseError::MissingField("command"))));
    }

    #[test]
    fn test_parser_produces_operation() {
        let parser = AgentRequestParser;
        assert!(parser.parse(br#"{"operation":"run","command":"true"}"#).is_ok());
        assert!(parser.parse(b"{}").is_err());
    }
}
