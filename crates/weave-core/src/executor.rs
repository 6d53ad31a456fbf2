use crate::errors::{ExecutionError, PlanError, TaskError};
use crate::initialize::resume_run;
use crate::model::{ExecutableKind, Run, Task, TaskStatus, WorkflowStatus};
use crate::runner::{HandlerRunner, RunnerRegistry, TaskInvocation, TaskOutcome, TaskRunner};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weave_store::{
    ArtifactError, ArtifactRef, ArtifactStore, EXTERNAL_PRODUCER, MemoryStore, ObjectStore,
    StoreError, create_snapshot, read_snapshot, write_snapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on attempts in flight at once. Zero is treated as one.
    pub max_concurrency: usize,
    /// Applied to tasks that do not carry their own timeout.
    pub default_timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_timeout_secs: None,
        }
    }
}

impl ExecutorConfig {
    fn slots(&self) -> usize {
        self.max_concurrency.max(1)
    }

    fn timeout_for(&self, task: &Task) -> Option<Duration> {
        task.timeout()
            .or_else(|| self.default_timeout_secs.map(Duration::from_secs))
    }
}

/// Where run snapshots go while the executor works.
#[async_trait]
pub trait StateBackend: Send {
    async fn prepare_run(&mut self, run: &Run) -> Result<(), ExecutionError>;

    async fn persist_run(&mut self, run: &Run) -> Result<(), ExecutionError>;
}

/// Keeps nothing. The caller's `Run` is the only copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn prepare_run(&mut self, _run: &Run) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn persist_run(&mut self, _run: &Run) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Snapshots the run to `runs/<run_id>/state.json` with compare-and-swap
/// writes, so two executors never silently overwrite each other.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    etag: Option<String>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, etag: None }
    }
}

#[async_trait]
impl StateBackend for ObjectStoreBackend {
    async fn prepare_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        let etag = match read_snapshot::<Run>(self.store.as_ref(), &run.run_id).await {
            Ok(stored) => {
                if stored.value.run_id != run.run_id {
                    return Err(ExecutionError::InvariantViolation(format!(
                        "stored run id {} does not match requested run id {}",
                        stored.value.run_id, run.run_id
                    )));
                }
                stored.etag
            }
            Err(StoreError::NotFound(_)) => {
                create_snapshot(self.store.as_ref(), &run.run_id, run).await?
            }
            Err(error) => return Err(error.into()),
        };
        self.etag = Some(etag);
        Ok(())
    }

    async fn persist_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        let etag = self.etag.as_deref().ok_or_else(|| {
            ExecutionError::InvariantViolation("state etag was not initialized".to_string())
        })?;
        let next = write_snapshot(self.store.as_ref(), &run.run_id, run, etag).await?;
        self.etag = Some(next);
        Ok(())
    }
}

/// Publishes every snapshot on a watch channel.
pub struct WatchBackend {
    sender: watch::Sender<Run>,
}

impl WatchBackend {
    pub fn new(sender: watch::Sender<Run>) -> Self {
        Self { sender }
    }

    pub fn channel(run: &Run) -> (Self, watch::Receiver<Run>) {
        let (sender, receiver) = watch::channel(run.clone());
        (Self::new(sender), receiver)
    }

    pub fn publish(&self, run: &Run) {
        self.sender.send_replace(run.clone());
    }
}

#[async_trait]
impl StateBackend for WatchBackend {
    async fn prepare_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        self.persist_run(run).await
    }

    async fn persist_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        self.publish(run);
        Ok(())
    }
}

#[async_trait]
impl<A: StateBackend, B: StateBackend> StateBackend for (A, B) {
    async fn prepare_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        self.0.prepare_run(run).await?;
        self.1.prepare_run(run).await
    }

    async fn persist_run(&mut self, run: &Run) -> Result<(), ExecutionError> {
        self.0.persist_run(run).await?;
        self.1.persist_run(run).await
    }
}

type AttemptResult = Result<TaskOutcome, TaskError>;

#[derive(Default)]
struct InFlight {
    tasks: JoinSet<AttemptResult>,
    ids: HashMap<Id, String>,
    tokens: HashMap<String, CancellationToken>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn cancel_all(&self) {
        for token in self.tokens.values() {
            token.cancel();
        }
    }

    fn settle(
        &mut self,
        joined: Result<(Id, AttemptResult), JoinError>,
    ) -> Result<(String, AttemptResult), ExecutionError> {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(error) => {
                let reason = if error.is_panic() {
                    "runner panicked"
                } else {
                    "runner was aborted"
                };
                (error.id(), Err(TaskError::Runner(reason.to_string())))
            }
        };
        let task_id = self.ids.remove(&id).ok_or_else(|| {
            ExecutionError::InvariantViolation(format!("completion for unknown attempt {id}"))
        })?;
        self.tokens.remove(&task_id);
        Ok((task_id, result))
    }
}

pub struct Executor<B> {
    backend: B,
    runners: RunnerRegistry,
    config: ExecutorConfig,
}

impl<B> Executor<B> {
    pub fn new(backend: B, runners: RunnerRegistry) -> Self {
        Self {
            backend,
            runners,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn check_runners(&self, run: &Run) -> Result<(), ExecutionError> {
        let mut kinds: Vec<ExecutableKind> =
            run.tasks.values().map(|t| t.executable.kind()).collect();
        kinds.sort();
        kinds.dedup();
        match kinds.into_iter().find(|kind| !self.runners.contains(*kind)) {
            Some(kind) => Err(ExecutionError::MissingRunner(kind.to_string())),
            None => Ok(()),
        }
    }
}

impl<B: StateBackend> Executor<B> {
    /// Drives `run` until every task is terminal or blocked behind a failure.
    ///
    /// A run left `Running` by an earlier process is resumed: succeeded tasks
    /// are kept and interrupted attempts start over. Cancelling `cancel`
    /// aborts the run; in-flight attempts are told to stop and waiting tasks
    /// become `Cancelled`.
    pub async fn execute(
        &mut self,
        run: &mut Run,
        artifacts: &ArtifactStore,
        cancel: CancellationToken,
    ) -> Result<WorkflowStatus, ExecutionError> {
        if run.status.is_terminal() {
            return Err(ExecutionError::InvalidRunState(format!(
                "run {} is already {}",
                run.run_id,
                run.status.as_str()
            )));
        }
        if artifacts.run_id() != run.run_id {
            return Err(ExecutionError::InvariantViolation(format!(
                "artifact store belongs to run {}, not {}",
                artifacts.run_id(),
                run.run_id
            )));
        }
        self.check_runners(run)?;

        if run.status == WorkflowStatus::Running {
            let requeued = resume_run(run);
            info!(run_id = %run.run_id, requeued, "resuming run");
        }
        restore_artifacts(run, artifacts).await?;
        if let Some(missing) = run
            .inputs
            .iter()
            .find(|name| !artifacts.contains(EXTERNAL_PRODUCER, name))
        {
            return Err(PlanError::UnboundInput(missing.clone()).into());
        }

        self.backend.prepare_run(run).await?;

        // Attempt tokens hang off `scope`, which is cancelled however we leave.
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let mut flight = InFlight::default();
        let mut aborted = false;

        let settled = match self
            .drive(run, artifacts, &cancel, &scope, &mut flight, &mut aborted)
            .await
        {
            Ok(()) => settle(run, aborted),
            Err(error) => {
                flight.cancel_all();
                flight.tasks.shutdown().await;
                halt(run, &error);
                Err(error)
            }
        };
        run.status = match &settled {
            Ok(status) => *status,
            Err(_) => WorkflowStatus::Failed,
        };
        run.completed_at = Some(Utc::now());
        let persisted = self.backend.persist_run(run).await;
        info!(
            run_id = %run.run_id,
            status = run.status.as_str(),
            succeeded = run.count(TaskStatus::Succeeded),
            failed = run.count(TaskStatus::Failed),
            "run finished"
        );
        match (settled, persisted) {
            (Err(error), Err(persist)) => {
                warn!(run_id = %run.run_id, error = %persist, "failed to persist aborted run");
                Err(error)
            }
            (settled, persisted) => {
                persisted?;
                settled
            }
        }
    }

    /// The coordinator loop. Returns once nothing can make progress.
    async fn drive(
        &mut self,
        run: &mut Run,
        artifacts: &ArtifactStore,
        cancel: &CancellationToken,
        scope: &CancellationToken,
        flight: &mut InFlight,
        aborted: &mut bool,
    ) -> Result<(), ExecutionError> {
        run.started_at.get_or_insert_with(Utc::now);
        run.status = WorkflowStatus::Running;
        self.backend.persist_run(run).await?;
        info!(
            run_id = %run.run_id,
            tasks = run.tasks.len(),
            layers = run.total_layers,
            "run started"
        );

        loop {
            if !*aborted {
                let promoted = promote(run, artifacts, Utc::now());
                let dispatched = self.dispatch(run, artifacts, scope, flight).await?;
                if promoted || dispatched > 0 {
                    self.backend.persist_run(run).await?;
                }
            }

            if flight.is_empty() {
                if *aborted {
                    return Ok(());
                }
                let Some(next) = next_retry_at(run) else {
                    return Ok(());
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        *aborted = true;
                        abort(run, flight);
                        self.backend.persist_run(run).await?;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let retry_wait = next_retry_at(run)
                .filter(|_| !*aborted && flight.len() < self.config.slots())
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !*aborted => {
                    *aborted = true;
                    abort(run, flight);
                    self.backend.persist_run(run).await?;
                }
                joined = flight.tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        continue;
                    };
                    let (task_id, result) = flight.settle(joined)?;
                    complete(run, artifacts, &task_id, result, *aborted).await?;
                    self.backend.persist_run(run).await?;
                }
                _ = tokio::time::sleep(retry_wait.unwrap_or_default()), if retry_wait.is_some() => {}
            }
        }
    }

    async fn dispatch(
        &self,
        run: &mut Run,
        artifacts: &ArtifactStore,
        scope: &CancellationToken,
        flight: &mut InFlight,
    ) -> Result<usize, ExecutionError> {
        let mut ready: Vec<(u32, String)> = run
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Ready)
            .map(|task| (task.layer, task.task_id.clone()))
            .collect();
        ready.sort();

        let run_id = run.run_id.clone();
        let mut dispatched = 0;
        for (layer, task_id) in ready {
            if flight.len() >= self.config.slots() {
                break;
            }
            let task = run
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| missing_task(&task_id))?;
            let kind = task.executable.kind();
            let runner = self
                .runners
                .get(kind)
                .ok_or_else(|| ExecutionError::MissingRunner(kind.to_string()))?;

            let mut inputs = BTreeMap::new();
            for (slot, key) in &task.inputs {
                let payload = artifacts.get(&key.task_id, &key.slot).await?;
                inputs.insert(slot.clone(), payload);
            }

            task.status = TaskStatus::Running;
            task.attempts += 1;
            task.started_at.get_or_insert_with(Utc::now);

            let invocation = TaskInvocation {
                run_id: run_id.clone(),
                task_id: task_id.clone(),
                attempt: task.attempts,
                executable: task.executable.clone(),
                parameters: task.parameters.clone(),
                inputs,
                outputs: task.outputs.iter().map(|o| o.name.clone()).collect(),
            };
            let timeout = self.config.timeout_for(task);
            let token = scope.child_token();
            let handle = flight
                .tasks
                .spawn(attempt(runner, invocation, token.clone(), timeout));
            flight.ids.insert(handle.id(), task_id.clone());
            flight.tokens.insert(task_id.clone(), token);

            debug!(
                run_id = %run_id,
                task_id = %task_id,
                layer,
                attempt = task.attempts,
                "task dispatched"
            );
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

async fn attempt(
    runner: Arc<dyn TaskRunner>,
    invocation: TaskInvocation,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> AttemptResult {
    let run = runner.run(invocation, cancel.clone());
    let Some(limit) = timeout else {
        return run.await;
    };
    match tokio::time::timeout(limit, run).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(TaskError::Timeout(limit))
        }
    }
}

/// Pending tasks whose dependencies succeeded and whose inputs are all
/// committed become Ready, as do retries whose delay has elapsed.
fn promote(run: &mut Run, artifacts: &ArtifactStore, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    for task in run.tasks.values_mut() {
        let ready = match task.status {
            TaskStatus::Pending => {
                task.deps_remaining == 0
                    && task
                        .inputs
                        .values()
                        .all(|key| artifacts.contains(&key.task_id, &key.slot))
            }
            TaskStatus::Retrying => task.available_at <= now,
            _ => false,
        };
        if ready {
            task.status = TaskStatus::Ready;
            changed = true;
        }
    }
    changed
}

async fn complete(
    run: &mut Run,
    artifacts: &ArtifactStore,
    task_id: &str,
    result: AttemptResult,
    aborted: bool,
) -> Result<(), ExecutionError> {
    let run_id = run.run_id.clone();
    let task = run
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| missing_task(task_id))?;
    let result = result
        .and_then(TaskOutcome::into_result)
        .and_then(|outcome| {
            match task
                .outputs
                .iter()
                .find(|spec| !outcome.outputs.contains_key(&spec.name))
            {
                Some(missing) => Err(TaskError::MissingOutput(missing.name.clone())),
                None => Ok(outcome),
            }
        });
    let now = Utc::now();

    match result {
        Ok(mut outcome) => {
            for spec in &task.outputs {
                let payload = outcome.outputs.remove(&spec.name).ok_or_else(|| {
                    ExecutionError::InvariantViolation(format!(
                        "output {} of {task_id} vanished",
                        spec.name
                    ))
                })?;
                let reference = artifacts
                    .put_with(task_id, &spec.name, payload, spec.archive)
                    .await?;
                task.produced.insert(spec.name.clone(), reference);
            }
            if !outcome.outputs.is_empty() {
                debug!(
                    run_id = %run_id,
                    task_id,
                    undeclared = ?outcome.outputs.keys().collect::<Vec<_>>(),
                    "dropping undeclared outputs"
                );
            }
            task.status = TaskStatus::Succeeded;
            task.completed_at = Some(now);
            task.last_error = None;
            info!(run_id = %run_id, task_id, attempt = task.attempts, "task succeeded");

            let downstream = task.downstream.clone();
            for child_id in downstream {
                let child = run
                    .tasks
                    .get_mut(&child_id)
                    .ok_or_else(|| missing_task(&child_id))?;
                child.deps_remaining = child.deps_remaining.saturating_sub(1);
            }
        }
        Err(error) => {
            task.last_error = Some(error.to_string());
            if aborted {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                info!(run_id = %run_id, task_id, "task cancelled");
            } else if error.is_retryable() && task.attempts < task.retry.max_attempts() {
                let delay = task.retry.delay_before(task.attempts.saturating_sub(1));
                task.status = TaskStatus::Retrying;
                task.available_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    run_id = %run_id,
                    task_id,
                    attempt = task.attempts,
                    max_attempts = task.retry.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "task failed, retrying"
                );
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                warn!(
                    run_id = %run_id,
                    task_id,
                    attempt = task.attempts,
                    error = %error,
                    "task failed"
                );
            }
        }
    }
    Ok(())
}

fn abort(run: &mut Run, flight: &InFlight) {
    flight.cancel_all();
    let now = Utc::now();
    for task in run.tasks.values_mut() {
        if task.status.is_waiting() {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
        }
    }
    info!(run_id = %run.run_id, in_flight = flight.len(), "run cancellation requested");
}

/// Leaves every unfinished task terminal after a structural error: attempts in
/// flight are Failed, everything still waiting is Cancelled.
fn halt(run: &mut Run, error: &ExecutionError) {
    let now = Utc::now();
    let reason = format!("run aborted: {error}");
    for task in run.tasks.values_mut() {
        let status = match task.status {
            TaskStatus::Running => TaskStatus::Failed,
            status if status.is_waiting() => TaskStatus::Cancelled,
            _ => continue,
        };
        task.status = status;
        task.completed_at = Some(now);
        task.last_error = Some(reason.clone());
    }
    warn!(run_id = %run.run_id, error = %error, "run aborted by executor error");
}

fn next_retry_at(run: &Run) -> Option<DateTime<Utc>> {
    run.tasks
        .values()
        .filter(|task| task.status == TaskStatus::Retrying)
        .map(|task| task.available_at)
        .min()
}

fn settle(run: &Run, aborted: bool) -> Result<WorkflowStatus, ExecutionError> {
    if aborted {
        return Ok(WorkflowStatus::Cancelled);
    }
    if run.count(TaskStatus::Failed) > 0 {
        return Ok(WorkflowStatus::Failed);
    }
    if run.count(TaskStatus::Succeeded) == run.tasks.len() {
        return Ok(WorkflowStatus::Succeeded);
    }
    if run.count(TaskStatus::Cancelled) > 0 {
        return Ok(WorkflowStatus::Cancelled);
    }
    let stuck: Vec<String> = run
        .ordered_task_ids()
        .into_iter()
        .filter(|id| run.tasks.get(id).is_some_and(|t| !t.status.is_terminal()))
        .collect();
    Err(ExecutionError::Deadlock(format!(
        "no task can make progress: {}",
        stuck.join(", ")
    )))
}

async fn restore_artifacts(run: &Run, artifacts: &ArtifactStore) -> Result<(), ExecutionError> {
    let produced = run.tasks.values().flat_map(|task| task.produced.values());
    for reference in run.staged_inputs.values().chain(produced) {
        artifacts.restore(reference.clone()).await?;
    }
    Ok(())
}

fn missing_task(task_id: &str) -> ExecutionError {
    ExecutionError::InvariantViolation(format!("task missing from run map: {task_id}"))
}

/// Commits the external inputs of `run` under the reserved `_input` producer.
/// Inputs already staged by an earlier pass are left as they are.
pub async fn stage_inputs(
    run: &mut Run,
    artifacts: &ArtifactStore,
    inputs: BTreeMap<String, Bytes>,
) -> Result<(), ExecutionError> {
    if let Some(unknown) = inputs.keys().find(|name| !run.inputs.contains(*name)) {
        return Err(PlanError::UnknownInput(unknown.clone()).into());
    }
    if let Some(missing) = run
        .inputs
        .iter()
        .find(|name| !inputs.contains_key(*name) && !run.staged_inputs.contains_key(*name))
    {
        return Err(PlanError::UnboundInput(missing.clone()).into());
    }

    for (name, payload) in inputs {
        if run.staged_inputs.contains_key(&name) {
            continue;
        }
        let reference = artifacts.put(EXTERNAL_PRODUCER, &name, payload).await?;
        run.staged_inputs.insert(name, reference);
    }
    Ok(())
}

/// The result of [`LocalExecutor::execute`].
pub struct RunOutcome {
    pub status: WorkflowStatus,
    pub outputs: BTreeMap<String, ArtifactRef>,
    pub artifacts: ArtifactStore,
}

impl RunOutcome {
    /// Payload of a workflow output.
    pub async fn output(&self, name: &str) -> Result<Bytes, ArtifactError> {
        let reference = self
            .outputs
            .get(name)
            .ok_or_else(|| ArtifactError::NotFound {
                task_id: "outputs".to_string(),
                slot: name.to_string(),
            })?;
        self.artifacts.get(&reference.task_id, &reference.slot).await
    }
}

/// In-process execution against an in-memory store.
pub struct LocalExecutor {
    executor: Executor<MemoryBackend>,
    store: Arc<dyn ObjectStore>,
}

impl LocalExecutor {
    pub fn new(handlers: HandlerRunner) -> Self {
        Self {
            executor: Executor::new(MemoryBackend, RunnerRegistry::local(handlers)),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = self.executor.with_config(config);
        self
    }

    pub async fn execute(
        &mut self,
        run: &mut Run,
        inputs: BTreeMap<String, Bytes>,
    ) -> Result<RunOutcome, ExecutionError> {
        let artifacts = ArtifactStore::new(Arc::clone(&self.store), run.run_id.clone());
        stage_inputs(run, &artifacts, inputs).await?;
        let status = self
            .executor
            .execute(run, &artifacts, CancellationToken::new())
            .await?;
        Ok(RunOutcome {
            status,
            outputs: run.output_refs(),
            artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DagBuilder;
    use crate::graph::ArtifactSource;
    use crate::model::{Executable, TaskSpec};
    use crate::workflow::Workflow;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use weave_store::{ArchiveStrategy, LocalFsStore};

    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn hold(&self, duration: Duration) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(duration);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn plan(dag: DagBuilder) -> Run {
        let dag = dag.build().expect("dag");
        let run_id = format!("{}-test", dag.name());
        Workflow::builder(dag)
            .build()
            .expect("workflow")
            .plan_with_id(run_id)
            .expect("plan")
    }

    fn no_inputs() -> Vec<String> {
        Vec::new()
    }

    fn text(payload: &Bytes) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }

    #[tokio::test]
    async fn diamond_runs_branches_concurrently() {
        let mut dag = DagBuilder::new("diamond", no_inputs());
        let a = dag
            .add_task(TaskSpec::handler("a").output("out"), [])
            .expect("a");
        let b = dag
            .add_task(
                TaskSpec::handler("b").output("out"),
                [("in", a.output("out").expect("a.out"))],
            )
            .expect("b");
        let c = dag
            .add_task(
                TaskSpec::handler("c").output("out"),
                [("in", a.output("out").expect("a.out"))],
            )
            .expect("c");
        let d = dag
            .add_task(
                TaskSpec::handler("d").output("out"),
                [
                    ("left", b.output("out").expect("b.out")),
                    ("right", c.output("out").expect("c.out")),
                ],
            )
            .expect("d");
        dag.declare_output("joined", d.output("out").expect("d.out"))
            .expect("output");
        let mut run = plan(dag);

        let gauge = Arc::new(Gauge::default());
        let mut handlers = HandlerRunner::new();
        let g = Arc::clone(&gauge);
        handlers.register("a", move |_| {
            g.hold(Duration::from_millis(10));
            Ok(TaskOutcome::success().with_output("out", "A"))
        });
        for name in ["b", "c"] {
            let g = Arc::clone(&gauge);
            handlers.register(name, move |ctx| {
                g.hold(Duration::from_millis(150));
                let upstream = text(ctx.input("in")?);
                Ok(TaskOutcome::success().with_output("out", format!("{upstream}{}", ctx.task_id)))
            });
        }
        let g = Arc::clone(&gauge);
        handlers.register("d", move |ctx| {
            g.hold(Duration::from_millis(10));
            let joined = format!("{}{}", text(ctx.input("left")?), text(ctx.input("right")?));
            Ok(TaskOutcome::success().with_output("out", joined))
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(run.status, WorkflowStatus::Succeeded);
        assert_eq!(gauge.peak(), 2);
        assert_eq!(outcome.output("joined").await.expect("joined"), "AbAc");
        let d_started = run.tasks["d"].started_at.expect("d started");
        for branch in ["b", "c"] {
            assert!(run.tasks[branch].completed_at.expect("branch done") <= d_started);
        }
    }

    #[tokio::test]
    async fn exhausts_retry_budget_then_fails() {
        let mut dag = DagBuilder::new("flaky", no_inputs());
        dag.add_task(TaskSpec::handler("flaky").retry_limit(3), [])
            .expect("flaky");
        let mut run = plan(dag);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut handlers = HandlerRunner::new();
        handlers.register("flaky", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::failed("boom"))
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let task = &run.tasks["flaky"];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 4);
        assert_eq!(task.last_error.as_deref(), Some("exited with code 1: boom"));
    }

    #[tokio::test]
    async fn retry_recovers_flaky_task() {
        let mut dag = DagBuilder::new("recover", no_inputs());
        dag.add_task(TaskSpec::handler("flaky").retry_limit(3).output("out"), [])
            .expect("flaky");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("flaky", |ctx| {
            if ctx.attempt < 3 {
                return Ok(TaskOutcome::exit(2, "not yet"));
            }
            Ok(TaskOutcome::success().with_output("out", "finally"))
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        let task = &run.tasks["flaky"];
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error, None);
        assert_eq!(
            outcome.artifacts.get("flaky", "out").await.expect("out"),
            "finally"
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let mut dag = DagBuilder::new("slow", no_inputs());
        dag.add_task(
            TaskSpec::handler("slow")
                .retry_limit(1)
                .timeout(Duration::from_millis(20)),
            [],
        )
        .expect("slow");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("slow", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(TaskOutcome::success())
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        let task = &run.tasks["slow"];
        assert_eq!(task.attempts, 2);
        assert!(
            task.last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("timed out"))
        );
    }

    #[tokio::test]
    async fn failure_leaves_descendants_pending_and_siblings_running() {
        let mut dag = DagBuilder::new("partial", no_inputs());
        let broken = dag
            .add_task(TaskSpec::handler("broken").output("out"), [])
            .expect("broken");
        dag.add_task(
            TaskSpec::handler("child"),
            [("in", broken.output("out").expect("broken.out"))],
        )
        .expect("child");
        dag.add_task(TaskSpec::handler("solo"), []).expect("solo");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("broken", |_| Err(TaskError::failed("nope")));
        handlers.register("child", |_| Ok(TaskOutcome::success()));
        handlers.register("solo", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(TaskOutcome::success())
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(run.tasks["broken"].status, TaskStatus::Failed);
        assert_eq!(run.tasks["solo"].status, TaskStatus::Succeeded);
        assert_eq!(run.tasks["child"].status, TaskStatus::Pending);
        assert_eq!(run.tasks["child"].attempts, 0);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let mut dag = DagBuilder::new("fan", no_inputs());
        for idx in 0..4 {
            dag.add_task(TaskSpec::handler(format!("t{idx}")), [])
                .expect("task");
        }
        let mut run = plan(dag);

        let gauge = Arc::new(Gauge::default());
        let mut handlers = HandlerRunner::new();
        let g = Arc::clone(&gauge);
        handlers.register_fallback(move |_| {
            g.hold(Duration::from_millis(20));
            Ok(TaskOutcome::success())
        });

        let outcome = LocalExecutor::new(handlers)
            .with_config(ExecutorConfig {
                max_concurrency: 1,
                ..ExecutorConfig::default()
            })
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(gauge.peak(), 1);
        assert_eq!(run.count(TaskStatus::Succeeded), 4);
    }

    #[tokio::test]
    async fn missing_declared_output_fails_attempt() {
        let mut dag = DagBuilder::new("forgetful", no_inputs());
        dag.add_task(TaskSpec::handler("forgetful").output("out").retry_limit(1), [])
            .expect("forgetful");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("forgetful", |_| Ok(TaskOutcome::success()));

        let outcome = LocalExecutor::new(handlers)
            .execute(&mut run, BTreeMap::new())
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        let task = &run.tasks["forgetful"];
        assert_eq!(task.attempts, 2);
        assert_eq!(
            task.last_error.as_deref(),
            Some("declared output out was not produced")
        );
        assert!(!outcome.artifacts.contains("forgetful", "out"));
    }

    #[tokio::test]
    async fn cancellation_stops_running_and_waiting_tasks() {
        let mut dag = DagBuilder::new("cancel", no_inputs());
        let slow = dag.add_task(TaskSpec::handler("slow"), []).expect("slow");
        let after = dag.add_task(TaskSpec::handler("after"), []).expect("after");
        dag.order(&slow, &after).expect("order");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("slow", |ctx| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TaskError::Cancelled)
        });
        handlers.register("after", |_| Ok(TaskOutcome::success()));

        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let artifacts = ArtifactStore::new(store, run.run_id.clone());
        let mut executor = Executor::new(MemoryBackend, RunnerRegistry::local(handlers));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let status = executor
            .execute(&mut run, &artifacts, cancel)
            .await
            .expect("execute");

        assert_eq!(status, WorkflowStatus::Cancelled);
        assert_eq!(run.status, WorkflowStatus::Cancelled);
        assert_eq!(run.tasks["slow"].status, TaskStatus::Cancelled);
        assert_eq!(run.tasks["slow"].attempts, 1);
        assert_eq!(run.tasks["after"].status, TaskStatus::Cancelled);
        assert_eq!(run.tasks["after"].attempts, 0);
    }

    #[tokio::test]
    async fn missing_runner_is_rejected_up_front() {
        let mut dag = DagBuilder::new("scripted", no_inputs());
        dag.add_task(
            TaskSpec::new("say", Executable::script("echo hi")),
            [],
        )
        .expect("say");
        let mut run = plan(dag);

        let mut runners = RunnerRegistry::new();
        runners.register(ExecutableKind::Handler, Arc::new(HandlerRunner::new()));
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let artifacts = ArtifactStore::new(store, run.run_id.clone());

        let err = Executor::new(MemoryBackend, runners)
            .execute(&mut run, &artifacts, CancellationToken::new())
            .await
            .expect_err("no script runner");

        assert!(matches!(err, ExecutionError::MissingRunner(kind) if kind == "script"));
        assert_eq!(run.status, WorkflowStatus::Pending);
        assert_eq!(run.tasks["say"].attempts, 0);
    }

    #[tokio::test]
    async fn unstaged_input_is_rejected() {
        let mut dag = DagBuilder::new("needs-input", ["rows"]);
        dag.add_task(
            TaskSpec::handler("read"),
            [("rows", ArtifactSource::input("rows"))],
        )
        .expect("read");
        let mut run = plan(dag);

        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let artifacts = ArtifactStore::new(store, run.run_id.clone());
        let err = Executor::new(MemoryBackend, RunnerRegistry::local(HandlerRunner::new()))
            .execute(&mut run, &artifacts, CancellationToken::new())
            .await
            .expect_err("unbound");
        assert!(matches!(
            err,
            ExecutionError::Plan(PlanError::UnboundInput(name)) if name == "rows"
        ));

        let err = stage_inputs(
            &mut run,
            &artifacts,
            BTreeMap::from([("columns".to_string(), Bytes::from_static(b"x"))]),
        )
        .await
        .expect_err("unknown");
        assert!(matches!(
            err,
            ExecutionError::Plan(PlanError::UnknownInput(name)) if name == "columns"
        ));
    }

    #[tokio::test]
    async fn archived_outputs_read_back_transparently() {
        let mut dag = DagBuilder::new("archive", ["rows"]);
        let pack = dag
            .add_task(
                TaskSpec::handler("pack").archived_output("blob", ArchiveStrategy::Gzip),
                [("rows", ArtifactSource::input("rows"))],
            )
            .expect("pack");
        dag.declare_output("blob", pack.output("blob").expect("blob"))
            .expect("output");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("pack", |ctx| {
            let rows = ctx.input("rows")?.clone();
            Ok(TaskOutcome::success().with_output("blob", rows))
        });

        let outcome = LocalExecutor::new(handlers)
            .execute(
                &mut run,
                BTreeMap::from([("rows".to_string(), Bytes::from("a,b\n1,2\n".repeat(50)))]),
            )
            .await
            .expect("execute");

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(outcome.outputs["blob"].archive, ArchiveStrategy::Gzip);
        assert_eq!(
            outcome.output("blob").await.expect("blob"),
            "a,b\n1,2\n".repeat(50)
        );
    }

    #[tokio::test]
    async fn object_store_backend_persists_snapshots() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(temp.path()));
        let mut dag = DagBuilder::new("persisted", no_inputs());
        dag.add_task(TaskSpec::handler("only"), []).expect("only");
        let mut run = plan(dag);

        let mut handlers = HandlerRunner::new();
        handlers.register("only", |_| Ok(TaskOutcome::success()));
        let artifacts = ArtifactStore::new(Arc::clone(&store), run.run_id.clone());
        let (watch, receiver) = WatchBackend::channel(&run);
        let mut executor = Executor::new(
            (ObjectStoreBackend::new(Arc::clone(&store)), watch),
            RunnerRegistry::local(handlers),
        );

        let status = executor
            .execute(&mut run, &artifacts, CancellationToken::new())
            .await
            .expect("execute");
        assert_eq!(status, WorkflowStatus::Succeeded);

        let stored = read_snapshot::<Run>(store.as_ref(), &run.run_id)
            .await
            .expect("snapshot");
        assert_eq!(stored.value, run);
        assert_eq!(receiver.borrow().status, WorkflowStatus::Succeeded);

        let err = executor
            .execute(&mut run, &artifacts, CancellationToken::new())
            .await
            .expect_err("terminal run");
        assert!(matches!(err, ExecutionError::InvalidRunState(_)));
    }

    #[tokio::test]
    async fn artifact_conflict_fails_the_run_and_settles_every_task() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let mut dag = DagBuilder::new("conflict", no_inputs());
        dag.add_task(TaskSpec::handler("a").output("out"), [])
            .expect("a");
        dag.add_task(TaskSpec::handler("slow"), []).expect("slow");
        let mut run = plan(dag);

        // Another writer already committed a's output.
        ArtifactStore::new(Arc::clone(&store), run.run_id.clone())
            .put("a", "out", Bytes::from_static(b"stale"))
            .await
            .expect("foreign put");

        let mut handlers = HandlerRunner::new();
        handlers.register("a", |_| {
            Ok(TaskOutcome::success().with_output("out", Bytes::from_static(b"fresh")))
        });
        handlers.register("slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(TaskOutcome::success())
        });
        let artifacts = ArtifactStore::new(Arc::clone(&store), run.run_id.clone());
        let mut executor = Executor::new(
            ObjectStoreBackend::new(Arc::clone(&store)),
            RunnerRegistry::local(handlers),
        );

        let err = executor
            .execute(&mut run, &artifacts, CancellationToken::new())
            .await
            .expect_err("conflicting output");
        assert!(matches!(
            err,
            ExecutionError::Artifact(ArtifactError::Integrity { .. })
        ));
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(run.tasks.values().all(|task| task.status.is_terminal()));
        assert_eq!(run.tasks["a"].status, TaskStatus::Failed);
        assert!(run.tasks["a"].last_error.is_some());

        let stored = read_snapshot::<Run>(store.as_ref(), &run.run_id)
            .await
            .expect("snapshot");
        assert_eq!(stored.value.status, WorkflowStatus::Failed);
        assert!(
            stored
                .value
                .tasks
                .values()
                .all(|task| task.status != TaskStatus::Running)
        );
    }

    #[tokio::test]
    async fn resumed_run_keeps_succeeded_work() {
        let mut dag = DagBuilder::new("resume", no_inputs());
        let extract = dag
            .add_task(TaskSpec::handler("extract").output("raw"), [])
            .expect("extract");
        dag.add_task(
            TaskSpec::handler("load").output("loaded"),
            [("raw", extract.output("raw").expect("raw"))],
        )
        .expect("load");
        let mut run = plan(dag);
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());

        let before = ArtifactStore::new(Arc::clone(&store), run.run_id.clone());
        let raw = before
            .put("extract", "raw", Bytes::from_static(b"raw"))
            .await
            .expect("raw");
        run.status = WorkflowStatus::Running;
        let task = run.tasks.get_mut("extract").expect("extract");
        task.status = TaskStatus::Succeeded;
        task.attempts = 1;
        task.produced.insert("raw".to_string(), raw);
        let task = run.tasks.get_mut("load").expect("load");
        task.status = TaskStatus::Running;
        task.attempts = 1;

        let extracts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&extracts);
        let mut handlers = HandlerRunner::new();
        handlers.register("extract", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutcome::success().with_output("raw", "again"))
        });
        handlers.register("load", |ctx| {
            let raw = text(ctx.input("raw")?).to_uppercase();
            Ok(TaskOutcome::success().with_output("loaded", raw))
        });

        let after = ArtifactStore::new(Arc::clone(&store), run.run_id.clone());
        let status = Executor::new(MemoryBackend, RunnerRegistry::local(handlers))
            .execute(&mut run, &after, CancellationToken::new())
            .await
            .expect("execute");

        assert_eq!(status, WorkflowStatus::Succeeded);
        assert_eq!(extracts.load(Ordering::SeqCst), 0);
        assert_eq!(run.tasks["load"].attempts, 1);
        assert_eq!(after.get("load", "loaded").await.expect("loaded"), "RAW");
    }

    #[tokio::test]
    async fn promotion_waits_for_committed_inputs() {
        let mut dag = DagBuilder::new("gate", no_inputs());
        let up = dag
            .add_task(TaskSpec::handler("up").output("out"), [])
            .expect("up");
        dag.add_task(
            TaskSpec::handler("down"),
            [("in", up.output("out").expect("out"))],
        )
        .expect("down");
        let mut run = plan(dag);
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let artifacts = ArtifactStore::new(store, run.run_id.clone());

        run.tasks.get_mut("down").expect("down").deps_remaining = 0;
        run.tasks.get_mut("up").expect("up").status = TaskStatus::Running;
        assert!(!promote(&mut run, &artifacts, Utc::now()));
        assert_eq!(run.tasks["down"].status, TaskStatus::Pending);

        artifacts
            .put("up", "out", Bytes::from_static(b"ready"))
            .await
            .expect("put");
        assert!(promote(&mut run, &artifacts, Utc::now()));
        assert_eq!(run.tasks["down"].status, TaskStatus::Ready);
    }

    #[test]
    fn config_defaults_and_timeouts() {
        let config: ExecutorConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(config.slots(), 8);

        let config = ExecutorConfig {
            max_concurrency: 0,
            default_timeout_secs: Some(30),
        };
        assert_eq!(config.slots(), 1);
        let mut task = Task::new("t", Executable::handler("t"));
        assert_eq!(config.timeout_for(&task), Some(Duration::from_secs(30)));
        task.timeout_ms = Some(250);
        assert_eq!(config.timeout_for(&task), Some(Duration::from_millis(250)));
    }
}
