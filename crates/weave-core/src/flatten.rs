//! Expands composite nodes into a single task-level graph.
//!
//! Inner tasks are renamed `<composite>.<task>`. A composite's inputs and
//! outputs disappear: consumers are wired straight to the producing task, and
//! ordering edges touching a composite fan out to its exit and entry tasks.

use crate::errors::{BuildError, CycleError, PlanError};
use crate::graph::{ArtifactSource, Dag, EdgeKind, Node};
use crate::layers::topological_layers;
use crate::model::{ArtifactKey, TaskSpec};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct FlatTask {
    pub id: String,
    pub spec: TaskSpec,
    pub inputs: BTreeMap<String, ArtifactKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatGraph {
    pub tasks: BTreeMap<String, FlatTask>,
    /// Task-level dependencies, `(upstream, downstream)`.
    pub edges: BTreeSet<(String, String)>,
    /// Declared inputs of the root DAG.
    pub inputs: Vec<String>,
    pub outputs: BTreeMap<String, ArtifactKey>,
}

/// What a node looks like from its parent once expanded.
#[derive(Debug, Default)]
struct Exports {
    outputs: BTreeMap<String, ArtifactKey>,
    entries: Vec<String>,
    exits: Vec<String>,
}

pub fn flatten(dag: &Dag) -> Result<FlatGraph, PlanError> {
    let mut graph = FlatGraph {
        inputs: dag.inputs().to_vec(),
        ..FlatGraph::default()
    };
    let bound: BTreeMap<String, ArtifactKey> = dag
        .inputs()
        .iter()
        .map(|name| (name.clone(), ArtifactKey::external(name.clone())))
        .collect();

    let exports = expand(dag, "", &bound, &mut graph)?;
    graph.outputs = exports.outputs;
    Ok(graph)
}

fn expand(
    dag: &Dag,
    prefix: &str,
    bound: &BTreeMap<String, ArtifactKey>,
    graph: &mut FlatGraph,
) -> Result<Exports, PlanError> {
    let node_order = topological_layers(
        dag.nodes().iter().map(Node::name),
        dag.edges().iter().map(|e| (e.from.as_str(), e.to.as_str())),
    )
    .map_err(|err| CycleError {
        cycle: err.cycle.iter().map(|id| format!("{prefix}{id}")).collect(),
    })?
    .order;

    let mut expanded: BTreeMap<String, Exports> = BTreeMap::new();
    let mut owned: BTreeSet<String> = BTreeSet::new();

    for name in node_order {
        let node = dag.node(&name).ok_or_else(|| BuildError::UnknownNode {
            dag: dag.name().to_string(),
            name: name.clone(),
        })?;
        let exports = match node {
            Node::Task(task) => {
                let id = format!("{prefix}{name}");
                let mut inputs = BTreeMap::new();
                for (slot, source) in &task.bindings {
                    let key = resolve(source, bound, &expanded)?;
                    if !key.is_external() {
                        graph.edges.insert((key.task_id.clone(), id.clone()));
                    }
                    inputs.insert(slot.clone(), key);
                }
                graph.tasks.insert(
                    id.clone(),
                    FlatTask {
                        id: id.clone(),
                        spec: task.spec.clone(),
                        inputs,
                    },
                );
                owned.insert(id.clone());
                Exports {
                    outputs: task
                        .spec
                        .outputs
                        .iter()
                        .map(|o| (o.name.clone(), ArtifactKey::new(id.clone(), o.name.clone())))
                        .collect(),
                    entries: vec![id.clone()],
                    exits: vec![id],
                }
            }
            Node::Composite(composite) => {
                let mut arguments = BTreeMap::new();
                for (arg, source) in &composite.arguments {
                    arguments.insert(arg.clone(), resolve(source, bound, &expanded)?);
                }
                let before: BTreeSet<String> = graph.tasks.keys().cloned().collect();
                let inner_prefix = format!("{prefix}{}.", composite.name);
                let exports = expand(&composite.dag, &inner_prefix, &arguments, graph)?;
                owned.extend(
                    graph
                        .tasks
                        .keys()
                        .filter(|id| !before.contains(*id))
                        .cloned(),
                );
                exports
            }
        };
        expanded.insert(name, exports);
    }

    for edge in dag.edges().iter().filter(|e| e.kind == EdgeKind::Ordering) {
        let (Some(from), Some(to)) = (expanded.get(&edge.from), expanded.get(&edge.to)) else {
            continue;
        };
        for exit in &from.exits {
            for entry in &to.entries {
                graph.edges.insert((exit.clone(), entry.clone()));
            }
        }
    }

    let mut outputs = BTreeMap::new();
    for (name, source) in dag.outputs() {
        outputs.insert(name.clone(), resolve(source, bound, &expanded)?);
    }

    let internal: Vec<&(String, String)> = graph
        .edges
        .iter()
        .filter(|(a, b)| owned.contains(a) && owned.contains(b))
        .collect();
    let entries = owned
        .iter()
        .filter(|id| !internal.iter().any(|(_, to)| to == *id))
        .cloned()
        .collect();
    let exits = owned
        .iter()
        .filter(|id| !internal.iter().any(|(from, _)| from == *id))
        .cloned()
        .collect();

    Ok(Exports {
        outputs,
        entries,
        exits,
    })
}

fn resolve(
    source: &ArtifactSource,
    bound: &BTreeMap<String, ArtifactKey>,
    expanded: &BTreeMap<String, Exports>,
) -> Result<ArtifactKey, PlanError> {
    match source {
        ArtifactSource::Input(name) => bound
            .get(name)
            .cloned()
            .ok_or_else(|| PlanError::UnboundInput(name.clone())),
        ArtifactSource::Output { node, slot } => expanded
            .get(node)
            .and_then(|exports| exports.outputs.get(slot))
            .cloned()
            .ok_or_else(|| {
                PlanError::Build(BuildError::UnknownOutput {
                    node: node.clone(),
                    slot: slot.clone(),
                })
            }),
    }
}
