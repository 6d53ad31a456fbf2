use crate::model::{RetryPolicy, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use weave_store::{ArchiveStrategy, ArtifactRef, EXTERNAL_PRODUCER};

/// What a task runs. The engine never interprets it; the runner registered for
/// its [`ExecutableKind`] does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Executable {
    /// A function registered by name with an in-process handler runner.
    Handler { name: String },
    /// Inline script source handed to an interpreter.
    Script {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default = "default_interpreter")]
        interpreter: Vec<String>,
        source: String,
    },
    /// An image reference plus command line.
    Container {
        image: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_interpreter() -> Vec<String> {
    vec!["sh".to_string()]
}

impl Executable {
    pub fn handler(name: impl Into<String>) -> Self {
        Self::Handler { name: name.into() }
    }

    pub fn script(source: impl Into<String>) -> Self {
        Self::Script {
            image: None,
            interpreter: default_interpreter(),
            source: source.into(),
        }
    }

    pub fn container<I, S>(image: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Container {
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            args: Vec::new(),
        }
    }

    pub fn kind(&self) -> ExecutableKind {
        match self {
            Self::Handler { .. } => ExecutableKind::Handler,
            Self::Script { .. } => ExecutableKind::Script,
            Self::Container { .. } => ExecutableKind::Container,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableKind {
    Handler,
    Script,
    Container,
}

impl ExecutableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Script => "script",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for ExecutableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default)]
    pub archive: ArchiveStrategy,
}

/// Build-time description of a task, before it is placed in a DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub executable: Executable,
    pub parameters: BTreeMap<String, String>,
    pub outputs: Vec<OutputSpec>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, executable: Executable) -> Self {
        Self {
            name: name.into(),
            executable,
            parameters: BTreeMap::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Shorthand for a task backed by the handler of the same name.
    pub fn handler(name: impl Into<String>) -> Self {
        let name = name.into();
        let executable = Executable::handler(name.clone());
        Self::new(name, executable)
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn output(self, name: impl Into<String>) -> Self {
        self.archived_output(name, ArchiveStrategy::None)
    }

    pub fn archived_output(mut self, name: impl Into<String>, archive: ArchiveStrategy) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            archive,
        });
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_limit(self, limit: u32) -> Self {
        self.retry(RetryPolicy::limit(limit))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A typed `(task_id, slot)` reference to an artifact in a flattened graph.
/// External workflow inputs use the reserved producer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub task_id: String,
    pub slot: String,
}

impl ArtifactKey {
    pub fn new(task_id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            slot: slot.into(),
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self::new(EXTERNAL_PRODUCER, name)
    }

    pub fn is_external(&self) -> bool {
        self.task_id == EXTERNAL_PRODUCER
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_external() {
            write!(f, "inputs.{}", self.slot)
        } else {
            write!(f, "{}.{}", self.task_id, self.slot)
        }
    }
}

/// A task inside a planned run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub executable: Executable,
    pub parameters: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, ArtifactKey>,
    pub outputs: Vec<OutputSpec>,
    pub retry: RetryPolicy,
    pub timeout_ms: Option<u64>,
    pub layer: u32,
    pub depends_on: Vec<String>,
    pub downstream: Vec<String>,
    pub deps_remaining: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub produced: BTreeMap<String, ArtifactRef>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, executable: Executable) -> Self {
        Self {
            task_id: task_id.into(),
            executable,
            parameters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
            layer: 0,
            depends_on: Vec::new(),
            downstream: Vec::new(),
            deps_remaining: 0,
            status: TaskStatus::Pending,
            attempts: 0,
            available_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            produced: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_serializes_with_kind_tag() {
        let script = Executable::script("echo hi");
        let json = serde_json::to_value(&script).expect("encode");
        assert_eq!(json["kind"], "script");
        assert_eq!(json["interpreter"], serde_json::json!(["sh"]));

        let decoded: Executable =
            serde_json::from_str(r#"{"kind":"container","image":"busybox"}"#).expect("decode");
        assert_eq!(
            decoded,
            Executable::Container {
                image: "busybox".to_string(),
                command: Vec::new(),
                args: Vec::new(),
            }
        );
        assert_eq!(decoded.kind(), ExecutableKind::Container);
    }

    #[test]
    fn spec_builder_collects_outputs_and_parameters() {
        let spec = TaskSpec::handler("echo")
            .parameter("message", "Hello world!")
            .output("out")
            .archived_output("log", ArchiveStrategy::Gzip)
            .retry_limit(3)
            .timeout(Duration::from_secs(5));

        assert_eq!(spec.executable, Executable::handler("echo"));
        assert_eq!(spec.parameters["message"], "Hello world!");
        assert_eq!(spec.outputs.len(), 2);
        assert_eq!(spec.outputs[1].archive, ArchiveStrategy::Gzip);
        assert_eq!(spec.retry.max_attempts(), 4);
    }

    #[test]
    fn artifact_key_display() {
        assert_eq!(ArtifactKey::new("e.extract", "raw-data").to_string(), "e.extract.raw-data");
        let input = ArtifactKey::external("rows");
        assert!(input.is_external());
        assert_eq!(input.to_string(), "inputs.rows");
    }
}
