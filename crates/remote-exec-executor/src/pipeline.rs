//! Running a pipeline of plugin commands.

use std::process::Stdio;

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use remote_exec_core::{ExecutionError, Operation, OutputSender};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
};

use crate::command::{CommandBuildError, CommandParts, ResolvedCommand};

/// Commands whose stdout feeds the next command's stdin.
///
/// The last stage's stdout and every stage's stderr are streamed line by
/// line into the output relay.
#[derive(Debug, Clone)]
pub struct Pipeline {
    label: String,
    stages: Vec<CommandParts>,
}

impl Pipeline {
    /// Create a pipeline. `label` names the operation in logs.
    #[must_use]
    pub fn new(label: impl Into<String>, stages: Vec<CommandParts>) -> Self {
        Self {
            label: label.into(),
            stages,
        }
    }

    async fn execute(self, output: &OutputSender) -> Result<(), ExecutionError> {
        let mut resolved = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let command = stage.into_resolved().await.map_err(|e| match e {
                CommandBuildError::NotFound(program) => ExecutionError::ExecutableNotFound(program),
                other => ExecutionError::Other(other.to_string()),
            })?;
            resolved.push(command);
        }

        let mut running = Running::default();
        let result = running.spawn_all(resolved, output).await;
        if result.is_err() {
            running.kill_all();
        }
        let waited = running.wait_all().await;
        result.and(waited)
    }
}

#[async_trait]
impl Operation for Pipeline {
    async fn run(self: Box<Self>, output: OutputSender) -> Result<(), ExecutionError> {
        let pipeline = *self;
        let label = pipeline.label.clone();
        tracing::debug!(operation = %label, stages = pipeline.stages.len(), "Running pipeline");

        let result = pipeline.execute(&output).await;
        if let Err(e) = &result {
            tracing::info!(operation = %label, "Operation failed: {e}");
            // Best effort: the peer may already be gone.
            let _ = output.send(format!("{label} failed: {e}\n")).await;
        }
        result
    }
}

#[derive(Default)]
struct Running {
    children: Vec<(String, AsyncGroupChild)>,
    pumps: Vec<JoinHandle<std::io::Result<u64>>>,
    readers: Vec<JoinHandle<()>>,
}

impl Running {
    async fn spawn_all(
        &mut self,
        stages: Vec<ResolvedCommand>,
        output: &OutputSender,
    ) -> Result<(), ExecutionError> {
        let last = stages.len().saturating_sub(1);
        let mut upstream = None;

        for (index, stage) in stages.into_iter().enumerate() {
            let mut cmd = Command::new(&stage.executable);
            cmd.args(&stage.args)
                .stdin(if upstream.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.group_spawn().map_err(|source| ExecutionError::SpawnFailed {
                program: stage.name.clone(),
                source,
            })?;
            let inner = child.inner();

            if let Some(mut from) = upstream.take() {
                let mut to = inner
                    .stdin
                    .take()
                    .ok_or_else(|| ExecutionError::Other("stdin was not captured".into()))?;
                self.pumps.push(tokio::spawn(async move {
                    tokio::io::copy(&mut from, &mut to).await
                }));
            }
            if let Some(stderr) = inner.stderr.take() {
                self.readers.push(spawn_line_reader(stderr, output.clone()));
            }
            let stdout = inner
                .stdout
                .take()
                .ok_or_else(|| ExecutionError::Other("stdout was not captured".into()))?;
            if index == last {
                self.readers.push(spawn_line_reader(stdout, output.clone()));
            } else {
                upstream = Some(stdout);
            }

            self.children.push((stage.name, child));
        }
        Ok(())
    }

    fn kill_all(&mut self) {
        for (name, child) in &mut self.children {
            if let Err(e) = child.start_kill() {
                tracing::debug!(program = %name, "Failed to kill stage: {e}");
            }
        }
    }

    /// Wait for every stage, then for the pumps and readers.
    ///
    /// The first stage that exits unsuccessfully decides the error.
    async fn wait_all(self) -> Result<(), ExecutionError> {
        let mut failure = None;

        for (name, mut child) in self.children {
            let status = child.wait().await?;
            if !status.success() && failure.is_none() {
                failure = Some(ExecutionError::NonZeroExit {
                    program: name,
                    code: status.code(),
                });
            }
        }

        for pump in self.pumps {
            match pump.await {
                Ok(Ok(_)) => {}
                // A consumer that exits early breaks the pipe; its status says why.
                Ok(Err(e)) => tracing::debug!("Pipe between stages failed: {e}"),
                Err(e) => tracing::warn!("Pipe task failed: {e}"),
            }
        }
        for reader in self.readers {
            if let Err(e) = reader.await {
                tracing::warn!("Output reader failed: {e}");
            }
        }

        failure.map_or(Ok(()), Err)
    }
}

fn spawn_line_reader<R>(stream: R, output: OutputSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&line).into_owned();
                    if output.send(chunk).await.is_err() {
                        tracing::debug!("Output relay closed, discarding remaining output");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to read command output: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use remote_exec_core::spawn_relay;

    use super::*;

    fn sh(script: &str) -> CommandParts {
        CommandParts::new("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    async fn run(pipeline: Pipeline) -> (Result<(), ExecutionError>, String) {
        let (output, relay) = spawn_relay(Vec::new());
        let result = Box::new(pipeline).run(output).await;
        let sink = relay.wait().await.unwrap();
        (result, String::from_utf8(sink).unwrap())
    }

    #[tokio::test]
    async fn test_single_stage_output() {
        let (result, output) = run(Pipeline::new("run", vec![sh("echo hello")])).await;
        assert!(result.is_ok());
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_stages_are_piped() {
        let pipeline = Pipeline::new(
            "backup",
            vec![sh("printf 'a\\nb\\n'"), sh("tr a-z A-Z")],
        );
        let (result, output) = run(pipeline).await;
        assert!(result.is_ok());
        assert_eq!(output, "A\nB\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_after_output() {
        let (result, output) = run(Pipeline::new("run", vec![sh("echo partial; exit 3")])).await;
        assert!(matches!(
            result,
            Err(ExecutionError::NonZeroExit { code: Some(3), .. })
        ));
        assert!(output.starts_with("partial\n"));
        assert!(output.contains("run failed"));
    }

    #[tokio::test]
    async fn test_failing_first_stage_fails_pipeline() {
        let pipeline = Pipeline::new("restore", vec![sh("exit 1"), sh("cat")]);
        let (result, _) = run(pipeline).await;
        assert!(matches!(result, Err(ExecutionError::NonZeroExit { .. })));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let pipeline = Pipeline::new(
            "purge",
            vec![CommandParts::new("no-such-plugin-xyz".to_string(), vec![])],
        );
        let (result, output) = run(pipeline).await;
        assert!(matches!(result, Err(ExecutionError::ExecutableNotFound(_))));
        assert!(output.contains("no-such-plugin-xyz"));
    }
}
