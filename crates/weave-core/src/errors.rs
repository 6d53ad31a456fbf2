use std::fmt;
use std::time::Duration;
use thiserror::Error;
use weave_store::{ArtifactError, StoreError};

/// A malformed graph. Raised while the DAG is being built, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("reserved name prefix '_': {0}")]
    ReservedName(String),
    #[error("duplicate node name in DAG {dag}: {name}")]
    DuplicateName { dag: String, name: String },
    #[error("duplicate input declared on DAG {dag}: {name}")]
    DuplicateInput { dag: String, name: String },
    #[error("node {0} cannot be ordered after itself")]
    SelfLoop(String),
    #[error("unknown node in DAG {dag}: {name}")]
    UnknownNode { dag: String, name: String },
    #[error("DAG {dag} has no input named {name}")]
    UndeclaredInput { dag: String, name: String },
    #[error("node {node} has no output named {slot}")]
    UnknownOutput { node: String, slot: String },
    #[error("slot {slot} of node {node} is bound more than once")]
    DuplicateBinding { node: String, slot: String },
    #[error("duplicate output slot on task {task}: {slot}")]
    DuplicateOutput { task: String, slot: String },
    #[error("duplicate output declared on DAG {dag}: {name}")]
    DuplicateDagOutput { dag: String, name: String },
    #[error("sub-DAG {node} is missing argument {name}")]
    MissingArgument { node: String, name: String },
    #[error("sub-DAG {node} does not declare input {name}")]
    UnknownArgument { node: String, name: String },
    #[error("invalid executable for task {task}: {reason}")]
    InvalidExecutable { task: String, reason: String },
    #[error("DAG {0} must contain at least one node")]
    EmptyDag(String),
}

/// A dependency cycle. The first id is repeated at the end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub cycle: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle: {}", self.cycle.join(" -> "))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("workflow input {0} was not provided")]
    UnboundInput(String),
    #[error("workflow does not declare input {0}")]
    UnknownInput(String),
}

/// Failure of a single attempt. Everything except `Cancelled` is retried while
/// the task's budget lasts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("exited with code {code}: {message}")]
    NonZeroExit { code: i32, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("declared output {0} was not produced")]
    MissingOutput(String),
    #[error("runner error: {0}")]
    Runner(String),
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::NonZeroExit {
            code: 1,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("run is not executable in current status: {0}")]
    InvalidRunState(String),
    #[error("no runner registered for executable kind: {0}")]
    MissingRunner(String),
    #[error("execution deadlocked: {0}")]
    Deadlock(String),
    #[error("executor invariant violated: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
