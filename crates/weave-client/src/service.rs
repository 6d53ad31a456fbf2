use crate::{RunSnapshot, ServiceError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weave_core::{
    ExecutionError, Executor, ExecutorConfig, HandlerRunner, ObjectStoreBackend, Run,
    RunnerRegistry, WatchBackend, Workflow, WorkflowStatus, stage_inputs,
};
use weave_store::{
    ArtifactStore, MemoryStore, ObjectStore, StoreError, list_runs, read_snapshot,
};

/// Where and as whom workflows are submitted. Carried through untouched by the
/// local service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub namespace: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub verify_tls: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "local".to_string(),
            namespace: None,
            token: None,
            verify_tls: true,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// The submission boundary: hand over a workflow, then observe or stop it.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Plans the workflow, stages its inputs and starts it. Returns the run id.
    async fn submit(
        &self,
        workflow: &Workflow,
        inputs: BTreeMap<String, Bytes>,
    ) -> Result<String, ServiceError>;

    async fn status(&self, run_id: &str) -> Result<RunSnapshot, ServiceError>;

    async fn cancel(&self, run_id: &str) -> Result<(), ServiceError>;

    /// Resolves once the run is terminal.
    async fn wait(&self, run_id: &str) -> Result<RunSnapshot, ServiceError>;
}

type RunTask = JoinHandle<Result<WorkflowStatus, ExecutionError>>;

struct LiveRun {
    state: watch::Receiver<Run>,
    cancel: CancellationToken,
    task: Mutex<Option<RunTask>>,
}

/// Runs workflows on the current tokio runtime, persisting snapshots and
/// artifacts to an object store.
pub struct LocalService {
    config: ServiceConfig,
    executor: ExecutorConfig,
    store: Arc<dyn ObjectStore>,
    runners: RunnerRegistry,
    live: DashMap<String, LiveRun>,
}

impl LocalService {
    pub fn new(store: Arc<dyn ObjectStore>, runners: RunnerRegistry) -> Self {
        Self {
            config: ServiceConfig::default(),
            executor: ExecutorConfig::default(),
            store,
            runners,
            live: DashMap::new(),
        }
    }

    pub fn in_memory(handlers: HandlerRunner) -> Self {
        Self::new(Arc::new(MemoryStore::new()), RunnerRegistry::local(handlers))
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Ids of every run with a persisted snapshot.
    pub async fn runs(&self) -> Result<Vec<String>, ServiceError> {
        Ok(list_runs(self.store.as_ref()).await?)
    }

    /// Payload of a workflow output of a finished run.
    pub async fn output(&self, run_id: &str, name: &str) -> Result<Bytes, ServiceError> {
        let snapshot = self.status(run_id).await?;
        let reference = snapshot
            .outputs
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownOutput {
                run_id: run_id.to_string(),
                name: name.to_string(),
            })?;
        let artifacts = ArtifactStore::new(Arc::clone(&self.store), run_id);
        let (task_id, slot) = (reference.task_id.clone(), reference.slot.clone());
        artifacts.restore(reference).await?;
        Ok(artifacts.get(&task_id, &slot).await?)
    }

    /// Drops live entries whose run is terminal and whose task has exited.
    /// Their state is served from the stored snapshot from then on.
    fn prune_finished(&self) {
        self.live.retain(|_, live| {
            let exited = live
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_none_or(JoinHandle::is_finished);
            !(exited && live.state.borrow().status.is_terminal())
        });
    }

    async fn stored_run(&self, run_id: &str) -> Result<Run, ServiceError> {
        match read_snapshot::<Run>(self.store.as_ref(), run_id).await {
            Ok(stored) => Ok(stored.value),
            Err(StoreError::NotFound(_)) => Err(ServiceError::UnknownRun(run_id.to_string())),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl WorkflowService for LocalService {
    async fn submit(
        &self,
        workflow: &Workflow,
        inputs: BTreeMap<String, Bytes>,
    ) -> Result<String, ServiceError> {
        workflow.check_inputs(inputs.keys().map(String::as_str))?;
        let mut run = workflow.plan()?;
        if run.workflow.namespace.is_none() {
            run.workflow.namespace = self.config.namespace.clone();
        }
        let run_id = run.run_id.clone();

        let artifacts = ArtifactStore::new(Arc::clone(&self.store), run_id.clone());
        stage_inputs(&mut run, &artifacts, inputs).await?;

        let (watch, state) = WatchBackend::channel(&run);
        let mut executor = Executor::new(
            (ObjectStoreBackend::new(Arc::clone(&self.store)), watch),
            self.runners.clone(),
        )
        .with_config(self.executor);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let result = executor.execute(&mut run, &artifacts, token).await;
            if let Err(error) = &result {
                warn!(run_id = %run.run_id, error = %error, "run aborted");
                if !run.status.is_terminal() {
                    run.status = WorkflowStatus::Failed;
                    run.completed_at = Some(Utc::now());
                }
                executor.backend().1.publish(&run);
            }
            result
        });

        self.prune_finished();
        self.live.insert(
            run_id.clone(),
            LiveRun {
                state,
                cancel,
                task: Mutex::new(Some(task)),
            },
        );
        info!(run_id = %run_id, workflow = workflow.name(), "workflow submitted");
        Ok(run_id)
    }

    async fn status(&self, run_id: &str) -> Result<RunSnapshot, ServiceError> {
        if let Some(live) = self.live.get(run_id) {
            return Ok(RunSnapshot::from_run(&live.state.borrow()));
        }
        let run = self.stored_run(run_id).await?;
        Ok(RunSnapshot::from_run(&run))
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ServiceError> {
        let live = self
            .live
            .get(run_id)
            .ok_or_else(|| ServiceError::UnknownRun(run_id.to_string()))?;
        info!(run_id, "cancelling run");
        live.cancel.cancel();
        Ok(())
    }

    async fn wait(&self, run_id: &str) -> Result<RunSnapshot, ServiceError> {
        let live = self.live.get(run_id).map(|live| {
            let task = live
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            (live.state.clone(), task)
        });
        let Some((mut state, task)) = live else {
            let run = self.stored_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(RunSnapshot::from_run(&run));
            }
            return Err(ServiceError::Detached(run_id.to_string()));
        };

        let joined = match task {
            Some(task) => Some(task.await),
            None => None,
        };
        let terminal = state
            .wait_for(|run| run.status.is_terminal())
            .await
            .map(|run| RunSnapshot::from_run(&run))
            .map_err(|_| ServiceError::Detached(run_id.to_string()));
        self.live.remove(run_id);
        if let Some(joined) = joined {
            joined??;
        }
        terminal
    }
}
