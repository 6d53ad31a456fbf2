use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use weave_core::{
    ArtifactSource, Backoff, Dag, DagBuilder, Executable, INPUTS_NAMESPACE, OutputSpec,
    RetryPolicy, TaskSpec, Workflow,
};

/// A workflow as written on disk.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub metadata: Metadata,
    pub entrypoint: String,
    pub dags: Vec<DagManifest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    pub name: Option<String>,
    pub generate_name: Option<String>,
    pub namespace: Option<String>,
    pub service_account: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct DagManifest {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub nodes: Vec<NodeManifest>,
    #[serde(default)]
    pub order: Vec<OrderManifest>,
    /// Each entry chains its nodes one after the other.
    #[serde(default)]
    pub steps: Vec<Vec<String>>,
    /// Output name to `node.slot`.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeManifest {
    Task(TaskManifest),
    Dag(SubDagManifest),
}

#[derive(Debug, Deserialize)]
pub struct TaskManifest {
    pub name: String,
    /// Defaults to the handler named after the task.
    pub executable: Option<Executable>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Input slot to `node.slot` or `inputs.name`.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_limit: u32,
    pub backoff: Option<Backoff>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SubDagManifest {
    /// Node name; defaults to the referenced DAG's name.
    pub name: Option<String>,
    pub dag: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderManifest {
    pub from: Vec<String>,
    pub to: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse manifest {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Builds every DAG reachable from the entrypoint, children first.
    pub fn into_workflow(self) -> Result<Workflow> {
        let mut by_name = HashMap::new();
        for dag in &self.dags {
            if by_name.insert(dag.name.as_str(), dag).is_some() {
                bail!("DAG {} is defined more than once", dag.name);
            }
        }

        let mut built = HashMap::new();
        let mut visiting = Vec::new();
        let entrypoint = build_dag(&self.entrypoint, &by_name, &mut built, &mut visiting)?;

        let metadata = self.metadata;
        let mut builder = Workflow::builder(entrypoint);
        if let Some(name) = metadata.name {
            builder = builder.name(name);
        }
        if let Some(prefix) = metadata.generate_name {
            builder = builder.generate_name(prefix);
        }
        if let Some(namespace) = metadata.namespace {
            builder = builder.namespace(namespace);
        }
        if let Some(account) = metadata.service_account {
            builder = builder.service_account(account);
        }
        for (key, value) in metadata.labels {
            builder = builder.label(key, value);
        }
        Ok(builder.build()?)
    }
}

fn build_dag(
    name: &str,
    manifests: &HashMap<&str, &DagManifest>,
    built: &mut HashMap<String, Dag>,
    visiting: &mut Vec<String>,
) -> Result<Dag> {
    if let Some(dag) = built.get(name) {
        return Ok(dag.clone());
    }
    if visiting.iter().any(|v| v == name) {
        visiting.push(name.to_string());
        bail!("DAG references form a loop: {}", visiting.join(" -> "));
    }
    let manifest = manifests
        .get(name)
        .ok_or_else(|| anyhow!("no DAG named {name}"))?;

    visiting.push(name.to_string());
    let mut children = HashMap::new();
    for node in &manifest.nodes {
        if let NodeManifest::Dag(sub) = node {
            let child = build_dag(&sub.dag, manifests, built, visiting)?;
            children.insert(sub.dag.clone(), child);
        }
    }
    visiting.pop();

    let mut dag = DagBuilder::new(&manifest.name, manifest.inputs.iter().cloned());
    for node in &manifest.nodes {
        match node {
            NodeManifest::Task(task) => {
                let bindings = parse_bindings(&task.inputs)?;
                dag.add_task(task_spec(task), bindings)
                    .with_context(|| format!("in DAG {name}"))?;
            }
            NodeManifest::Dag(sub) => {
                let child = children
                    .get(&sub.dag)
                    .ok_or_else(|| anyhow!("no DAG named {}", sub.dag))?;
                let arguments = parse_bindings(&sub.arguments)?;
                let node_name = sub.name.clone().unwrap_or_else(|| sub.dag.clone());
                dag.add_sub_dag_as(node_name, child, arguments)
                    .with_context(|| format!("in DAG {name}"))?;
            }
        }
    }
    for order in &manifest.order {
        dag.order(order.from.clone(), order.to.clone())
            .with_context(|| format!("in DAG {name}"))?;
    }
    for chain in &manifest.steps {
        dag.steps(chain).with_context(|| format!("in DAG {name}"))?;
    }
    for (output, reference) in &manifest.outputs {
        dag.declare_output(output.as_str(), parse_source(reference)?)
            .with_context(|| format!("in DAG {name}"))?;
    }

    let dag = dag.build()?;
    built.insert(name.to_string(), dag.clone());
    Ok(dag)
}

fn task_spec(task: &TaskManifest) -> TaskSpec {
    let executable = task
        .executable
        .clone()
        .unwrap_or_else(|| Executable::handler(task.name.clone()));
    let mut retry = RetryPolicy::limit(task.retry_limit);
    if let Some(backoff) = task.backoff {
        retry = retry.with_backoff(backoff);
    }
    let mut spec = TaskSpec::new(task.name.clone(), executable).retry(retry);
    spec.parameters = task.parameters.clone();
    spec.outputs = task.outputs.clone();
    if let Some(secs) = task.timeout_secs {
        spec = spec.timeout(Duration::from_secs(secs));
    }
    spec
}

fn parse_bindings(raw: &BTreeMap<String, String>) -> Result<Vec<(&str, ArtifactSource)>> {
    raw.iter()
        .map(|(slot, reference)| Ok((slot.as_str(), parse_source(reference)?)))
        .collect()
}

/// `inputs.<name>` names an input of the enclosing DAG, `<node>.<slot>` an
/// output of a sibling node.
pub fn parse_source(reference: &str) -> Result<ArtifactSource> {
    let (node, slot) = reference
        .split_once('.')
        .filter(|(node, slot)| !node.is_empty() && !slot.is_empty())
        .ok_or_else(|| {
            anyhow!("invalid reference {reference:?}, expected node.slot or {INPUTS_NAMESPACE}.name")
        })?;
    if node == INPUTS_NAMESPACE {
        Ok(ArtifactSource::input(slot))
    } else {
        Ok(ArtifactSource::output(node, slot))
    }
}
