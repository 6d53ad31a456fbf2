use crate::model::{Run, TaskStatus, WorkflowStatus};
use chrono::Utc;

/// Puts every task back at the start line: Pending, no attempts, nothing produced.
pub fn initialize_run(run: &mut Run) {
    let now = Utc::now();

    run.status = WorkflowStatus::Pending;
    run.started_at = None;
    run.completed_at = None;

    for task in run.tasks.values_mut() {
        task.status = TaskStatus::Pending;
        task.deps_remaining = task.depends_on.len();
        task.attempts = 0;
        task.available_at = now;
        task.started_at = None;
        task.completed_at = None;
        task.last_error = None;
        task.produced.clear();
    }
}

/// Prepares a run loaded from a snapshot for another executor pass.
///
/// Attempts that were in flight when the snapshot was written are not counted,
/// their tasks return to Pending. Dependency counters are rebuilt from the
/// persisted statuses. Returns the number of requeued tasks.
pub fn resume_run(run: &mut Run) -> usize {
    let succeeded: Vec<String> = run
        .tasks
        .iter()
        .filter_map(|(id, task)| (task.status == TaskStatus::Succeeded).then_some(id.clone()))
        .collect();

    let mut requeued = 0;
    for task in run.tasks.values_mut() {
        task.deps_remaining = task
            .depends_on
            .iter()
            .filter(|dep| !succeeded.contains(*dep))
            .count();

        match task.status {
            TaskStatus::Running => {
                task.status = TaskStatus::Pending;
                task.attempts = task.attempts.saturating_sub(1);
                requeued += 1;
            }
            TaskStatus::Ready => task.status = TaskStatus::Pending,
            _ => {}
        }
    }
    requeued
}
