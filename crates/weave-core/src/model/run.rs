use crate::model::{ArtifactKey, Task, TaskStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use weave_store::ArtifactRef;

/// Metadata a workflow carries through to its runs. The engine never acts on
/// namespace, service account or labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub workflow: WorkflowMeta,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_layers: u32,
    /// Declared external inputs of the entrypoint DAG.
    pub inputs: Vec<String>,
    /// Input payloads committed to the artifact store for this run.
    #[serde(default)]
    pub staged_inputs: BTreeMap<String, ArtifactRef>,
    /// Entrypoint DAG outputs, resolved to the flattened producer slot.
    pub outputs: BTreeMap<String, ArtifactKey>,
    pub tasks: HashMap<String, Task>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, workflow: WorkflowMeta) -> Self {
        Self {
            run_id: run_id.into(),
            workflow,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_layers: 0,
            inputs: Vec::new(),
            staged_inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Task ids sorted by `(layer, id)`, the order the executor dispatches in.
    pub fn ordered_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<(u32, &String)> = self
            .tasks
            .iter()
            .map(|(id, task)| (task.layer, id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Committed references for each workflow output. Outputs whose producer
    /// has not succeeded are omitted.
    pub fn output_refs(&self) -> BTreeMap<String, ArtifactRef> {
        self.outputs
            .iter()
            .filter_map(|(name, key)| {
                let producer = self.tasks.get(&key.task_id)?;
                let reference = producer.produced.get(&key.slot)?;
                Some((name.clone(), reference.clone()))
            })
            .collect()
    }
}
