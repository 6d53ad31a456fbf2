use super::{TaskInvocation, TaskOutcome, TaskRunner};
use crate::errors::TaskError;
use crate::model::Executable;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs script and container tasks as host processes.
///
/// Each attempt gets a scratch directory. Input payloads are written to files
/// named by `WEAVE_INPUT_<SLOT>`; the process writes each output to the path in
/// `WEAVE_OUTPUT_<SLOT>`. Parameters arrive as `WEAVE_PARAM_<NAME>`. Container
/// images are passed through in `WEAVE_IMAGE` and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    env: BTreeMap<String, String>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra variables set on every process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    async fn command(
        &self,
        invocation: &TaskInvocation,
        workdir: &Path,
    ) -> Result<(Command, Option<String>), TaskError> {
        match &invocation.executable {
            Executable::Script {
                image,
                interpreter,
                source,
            } => {
                let (program, args) = interpreter
                    .split_first()
                    .ok_or_else(|| TaskError::Runner("script has no interpreter".to_string()))?;
                let script = workdir.join("script");
                tokio::fs::write(&script, source).await.map_err(io_error)?;
                let mut command = Command::new(program);
                command.args(args).arg(script);
                Ok((command, image.clone()))
            }
            Executable::Container {
                image,
                command: argv,
                args,
            } => {
                let (program, rest) = argv.split_first().ok_or_else(|| {
                    TaskError::Runner(format!("container {image} has no command to run"))
                })?;
                let mut command = Command::new(program);
                command.args(rest).args(args);
                Ok((command, Some(image.clone())))
            }
            Executable::Handler { name } => Err(TaskError::Runner(format!(
                "process runner cannot execute handler {name}"
            ))),
        }
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        let scratch = tempfile::Builder::new()
            .prefix("weave-task-")
            .tempdir()
            .map_err(io_error)?;
        let inputs_dir = scratch.path().join("inputs");
        let outputs_dir = scratch.path().join("outputs");
        tokio::fs::create_dir_all(&inputs_dir).await.map_err(io_error)?;
        tokio::fs::create_dir_all(&outputs_dir).await.map_err(io_error)?;

        let (mut command, image) = self.command(&invocation, scratch.path()).await?;
        command
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .envs(&self.env)
            .env("WEAVE_RUN_ID", &invocation.run_id)
            .env("WEAVE_TASK_ID", &invocation.task_id)
            .env("WEAVE_ATTEMPT", invocation.attempt.to_string());
        if let Some(image) = image {
            command.env("WEAVE_IMAGE", image);
        }
        for (name, value) in &invocation.parameters {
            command.env(env_name("WEAVE_PARAM_", name), value);
        }
        for (slot, payload) in &invocation.inputs {
            let path = inputs_dir.join(slot);
            tokio::fs::write(&path, payload).await.map_err(io_error)?;
            command.env(env_name("WEAVE_INPUT_", slot), &path);
        }
        for slot in &invocation.outputs {
            command.env(env_name("WEAVE_OUTPUT_", slot), outputs_dir.join(slot));
        }

        let child = command.spawn().map_err(|e| {
            TaskError::Runner(format!("failed to spawn process for {}: {e}", invocation.task_id))
        })?;
        tracing::debug!(task_id = %invocation.task_id, pid = child.id(), "process started");

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            output = child.wait_with_output() => output.map_err(io_error)?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(TaskOutcome::exit(
                output.status.code().unwrap_or(-1),
                stderr.trim().to_string(),
            ));
        }

        let mut outcome = TaskOutcome::success();
        for slot in &invocation.outputs {
            match tokio::fs::read(outputs_dir.join(slot)).await {
                Ok(body) => {
                    outcome.outputs.insert(slot.clone(), Bytes::from(body));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(e)),
            }
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !stdout.is_empty() {
            outcome.message = Some(stdout);
        }
        Ok(outcome)
    }
}

/// `raw-data` under `WEAVE_INPUT_` becomes `WEAVE_INPUT_RAW_DATA`.
fn env_name(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{suffix}")
}

fn io_error(e: std::io::Error) -> TaskError {
    TaskError::Runner(format!("io error: {e}"))
}
