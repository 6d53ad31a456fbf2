use crate::model::TaskSpec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where an input slot reads from: a declared input of the enclosing DAG or
/// an output slot of a sibling node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactSource {
    Input(String),
    Output { node: String, slot: String },
}

impl ArtifactSource {
    pub fn input(name: impl Into<String>) -> Self {
        Self::Input(name.into())
    }

    pub fn output(node: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::Output {
            node: node.into(),
            slot: slot.into(),
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Input(_) => None,
            Self::Output { node, .. } => Some(node),
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(name) => write!(f, "inputs.{name}"),
            Self::Output { node, slot } => write!(f, "{node}.{slot}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub spec: TaskSpec,
    pub bindings: BTreeMap<String, ArtifactSource>,
}

/// A built DAG embedded as a single node of its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeNode {
    pub name: String,
    pub dag: Arc<Dag>,
    pub arguments: BTreeMap<String, ArtifactSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Task(TaskNode),
    Composite(CompositeNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Self::Task(task) => &task.spec.name,
            Self::Composite(composite) => &composite.name,
        }
    }

    /// Output slot names this node exposes to its siblings.
    pub fn output_names(&self) -> Vec<&str> {
        match self {
            Self::Task(task) => task.spec.outputs.iter().map(|o| o.name.as_str()).collect(),
            Self::Composite(composite) => composite.dag.output_names().collect(),
        }
    }

    pub fn has_output(&self, slot: &str) -> bool {
        self.output_names().contains(&slot)
    }

    /// Sources this node reads, in slot order.
    pub fn sources(&self) -> impl Iterator<Item = &ArtifactSource> {
        match self {
            Self::Task(task) => task.bindings.values(),
            Self::Composite(composite) => composite.arguments.values(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Ordering,
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// An immutable, validated DAG. Produced by [`crate::DagBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dag {
    pub(crate) name: String,
    pub(crate) inputs: Vec<String>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) outputs: Vec<(String, ArtifactSource)>,
}

impl Dag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn outputs(&self) -> &[(String, ArtifactSource)] {
        &self.outputs
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }

    /// Number of tasks once every composite is expanded.
    pub fn task_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Task(_) => 1,
                Node::Composite(composite) => composite.dag.task_count(),
            })
            .sum()
    }
}
