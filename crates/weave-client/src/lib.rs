mod display;
mod service;

pub use display::{LayerSummary, RunSnapshot, TaskSnapshot};
pub use service::{LocalService, ServiceConfig, WorkflowService};

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::task::JoinError;
use weave_core::{ExecutionError, PlanError, Workflow};
use weave_store::{ArtifactError, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("run {0} is not executing in this process")]
    Detached(String),
    #[error("run {run_id} has no output named {name}")]
    UnknownOutput { run_id: String, name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("run task failed to join: {0}")]
    Join(#[from] JoinError),
}

/// Thin front for a [`WorkflowService`].
pub struct Client<S> {
    service: S,
}

impl<S: WorkflowService> Client<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Submits `workflow`. With `wait` the returned snapshot is terminal,
    /// otherwise it is whatever the service reports right after submission.
    pub async fn create(
        &self,
        workflow: &Workflow,
        inputs: BTreeMap<String, Bytes>,
        wait: bool,
    ) -> Result<RunSnapshot, ServiceError> {
        let run_id = self.service.submit(workflow, inputs).await?;
        if wait {
            self.service.wait(&run_id).await
        } else {
            self.service.status(&run_id).await
        }
    }

    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot, ServiceError> {
        self.service.status(run_id).await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<(), ServiceError> {
        self.service.cancel(run_id).await
    }

    pub async fn wait(&self, run_id: &str) -> Result<RunSnapshot, ServiceError> {
        self.service.wait(run_id).await
    }
}
