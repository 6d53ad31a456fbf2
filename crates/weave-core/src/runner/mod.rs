//! The boundary between the scheduler and whatever actually runs a task.
//!
//! A runner gets one attempt's worth of work and reports how it went. It never
//! retries on its own; retry budgets belong to the executor.

mod handler;
mod process;

pub use handler::{HandlerContext, HandlerRunner, TaskHandler};
pub use process::ProcessRunner;

use crate::errors::TaskError;
use crate::model::{Executable, ExecutableKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a runner needs for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInvocation {
    pub run_id: String,
    pub task_id: String,
    /// 1-based.
    pub attempt: u32,
    pub executable: Executable,
    pub parameters: BTreeMap<String, String>,
    /// Resolved payload per input slot.
    pub inputs: BTreeMap<String, Bytes>,
    /// Output slots the task is expected to fill.
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub exit_code: i32,
    pub outputs: BTreeMap<String, Bytes>,
    pub message: Option<String>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code: code,
            outputs: BTreeMap::new(),
            message: Some(message.into()),
        }
    }

    pub fn with_output(mut self, slot: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.outputs.insert(slot.into(), payload.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Folds a non-zero exit into the error path.
    pub fn into_result(self) -> Result<Self, TaskError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(TaskError::NonZeroExit {
            code: self.exit_code,
            message: self.message.unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, TaskError>;
}

/// Runners keyed by the kind of executable they understand.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<ExecutableKind, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for `Executable::Handler`, local processes for scripts and
    /// containers.
    pub fn local(handlers: HandlerRunner) -> Self {
        let process: Arc<dyn TaskRunner> = Arc::new(ProcessRunner::new());
        let mut registry = Self::new();
        registry.register(ExecutableKind::Handler, Arc::new(handlers));
        registry.register(ExecutableKind::Script, Arc::clone(&process));
        registry.register(ExecutableKind::Container, process);
        registry
    }

    pub fn register(&mut self, kind: ExecutableKind, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(kind, runner);
    }

    pub fn get(&self, kind: ExecutableKind) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ExecutableKind) -> bool {
        self.runners.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ExecutableKind> {
        let mut kinds: Vec<ExecutableKind> = self.runners.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
