use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use weave_core::{Run, TaskStatus, WorkflowMeta, WorkflowStatus};
use weave_store::ArtifactRef;

/// Point-in-time view of a run, as returned by a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub workflow: WorkflowMeta,
    pub status: WorkflowStatus,
    pub total_layers: u32,
    pub tasks: Vec<TaskSnapshot>,
    pub layers: Vec<LayerSummary>,
    pub outputs: BTreeMap<String, ArtifactRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub layer: u32,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Upstream tasks that have not succeeded yet. Empty unless the task is Pending.
    pub waiting_on: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSummary {
    pub layer: u32,
    pub total_tasks: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl LayerSummary {
    fn record(&mut self, status: TaskStatus) {
        self.total_tasks += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Retrying => self.retrying += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    fn counts(&self) -> [(usize, &'static str); 7] {
        [
            (self.succeeded, "succeeded"),
            (self.running, "running"),
            (self.retrying, "retrying"),
            (self.ready, "ready"),
            (self.pending, "pending"),
            (self.failed, "failed"),
            (self.cancelled, "cancelled"),
        ]
    }
}

impl RunSnapshot {
    pub fn from_run(run: &Run) -> Self {
        let mut tasks = run
            .tasks
            .values()
            .map(|task| TaskSnapshot {
                task_id: task.task_id.clone(),
                layer: task.layer,
                status: task.status,
                attempts: task.attempts,
                max_attempts: task.retry.max_attempts(),
                waiting_on: if task.status == TaskStatus::Pending {
                    task.depends_on
                        .iter()
                        .filter(|dep| {
                            run.tasks
                                .get(*dep)
                                .is_some_and(|parent| parent.status != TaskStatus::Succeeded)
                        })
                        .cloned()
                        .collect()
                } else {
                    Vec::new()
                },
                last_error: task.last_error.clone(),
            })
            .collect::<Vec<_>>();
        tasks.sort_by(|left, right| {
            (left.layer, left.task_id.as_str()).cmp(&(right.layer, right.task_id.as_str()))
        });

        let mut layers = (0..run.total_layers)
            .map(|layer| LayerSummary {
                layer,
                ..LayerSummary::default()
            })
            .collect::<Vec<_>>();
        for task in run.tasks.values() {
            if let Some(summary) = layers.get_mut(task.layer as usize) {
                summary.record(task.status);
            }
        }

        Self {
            run_id: run.run_id.clone(),
            workflow: run.workflow.clone(),
            status: run.status,
            total_layers: run.total_layers,
            tasks,
            layers,
            outputs: run.output_refs(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|task| task.task_id == task_id)
    }
}

impl Display for RunSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run {} ({}): {}",
            self.run_id,
            self.workflow.name,
            self.status.as_str()
        )?;
        if let Some(namespace) = &self.workflow.namespace {
            write!(f, " [namespace {namespace}]")?;
        }
        writeln!(f)?;

        for summary in &self.layers {
            let parts = summary
                .counts()
                .iter()
                .filter(|(count, _)| *count > 0)
                .map(|(count, label)| format!("{count}/{} {label}", summary.total_tasks))
                .collect::<Vec<_>>();
            let status_line = if parts.is_empty() {
                format!("0/{} tasks", summary.total_tasks)
            } else {
                parts.join(", ")
            };
            writeln!(f, "  Layer {}: {}", summary.layer, status_line)?;
        }

        writeln!(f)?;
        writeln!(f, "Tasks:")?;
        let width = self
            .tasks
            .iter()
            .map(|task| task.task_id.len())
            .max()
            .unwrap_or(0)
            .max(12);
        for task in &self.tasks {
            write!(
                f,
                "  {:<width$} [L{}] {} (attempt {}/{})",
                task.task_id,
                task.layer,
                task.status.as_str(),
                task.attempts,
                task.max_attempts
            )?;
            if !task.waiting_on.is_empty() {
                write!(f, " (waiting on: {})", task.waiting_on.join(", "))?;
            }
            writeln!(f)?;
            if let Some(last_error) = &task.last_error {
                writeln!(f, "    error: {last_error}")?;
            }
        }

        if !self.outputs.is_empty() {
            writeln!(f)?;
            writeln!(f, "Outputs:")?;
            for (name, reference) in &self.outputs {
                writeln!(
                    f,
                    "  {name} <- {}.{} ({} bytes, sha256 {})",
                    reference.task_id,
                    reference.slot,
                    reference.size,
                    short_digest(&reference.digest)
                )?;
            }
        }

        Ok(())
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
