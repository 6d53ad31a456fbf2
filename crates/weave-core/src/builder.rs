use crate::errors::BuildError;
use crate::graph::{ArtifactSource, CompositeNode, Dag, Edge, EdgeKind, Node, TaskNode};
use crate::model::{Executable, TaskSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Node name reserved for references to a DAG's own inputs in manifests.
pub const INPUTS_NAMESPACE: &str = "inputs";

/// Handle to a task added to a [`DagBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    name: String,
    outputs: Vec<String>,
}

/// Handle to a sub-DAG embedded in a [`DagBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeRef {
    name: String,
    outputs: Vec<String>,
}

impl TaskRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source for one of this task's declared output slots.
    pub fn output(&self, slot: &str) -> Result<ArtifactSource, BuildError> {
        node_output(&self.name, &self.outputs, slot)
    }
}

impl CompositeRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source for one of the embedded DAG's declared outputs.
    pub fn output(&self, name: &str) -> Result<ArtifactSource, BuildError> {
        node_output(&self.name, &self.outputs, name)
    }
}

impl AsRef<str> for TaskRef {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for CompositeRef {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

fn node_output(node: &str, outputs: &[String], slot: &str) -> Result<ArtifactSource, BuildError> {
    if !outputs.iter().any(|o| o == slot) {
        return Err(BuildError::UnknownOutput {
            node: node.to_string(),
            slot: slot.to_string(),
        });
    }
    Ok(ArtifactSource::output(node, slot))
}

/// One or more node names on either side of [`DagBuilder::order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nodes(Vec<String>);

impl<T: AsRef<str> + ?Sized> From<&T> for Nodes {
    fn from(node: &T) -> Self {
        Self(vec![node.as_ref().to_string()])
    }
}

impl<T: AsRef<str> + ?Sized, const N: usize> From<[&T; N]> for Nodes {
    fn from(nodes: [&T; N]) -> Self {
        Self(nodes.iter().map(|n| n.as_ref().to_string()).collect())
    }
}

impl<T: AsRef<str> + ?Sized> From<Vec<&T>> for Nodes {
    fn from(nodes: Vec<&T>) -> Self {
        Self(nodes.iter().map(|n| n.as_ref().to_string()).collect())
    }
}

impl From<Vec<String>> for Nodes {
    fn from(nodes: Vec<String>) -> Self {
        Self(nodes)
    }
}

pub struct DagBuilder {
    name: String,
    inputs: Vec<String>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    seen_edges: HashSet<(String, String, EdgeKind)>,
    outputs: Vec<(String, ArtifactSource)>,
}

impl DagBuilder {
    /// Starts a DAG with the external inputs it expects its parent (or the
    /// workflow submitter) to bind.
    pub fn new<I, S>(name: impl Into<String>, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            seen_edges: HashSet::new(),
            outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source for one of this DAG's declared inputs.
    pub fn input(&self, name: &str) -> Result<ArtifactSource, BuildError> {
        if !self.inputs.iter().any(|i| i == name) {
            return Err(self.undeclared_input(name));
        }
        Ok(ArtifactSource::input(name))
    }

    /// Adds a task. Every binding maps an input slot to its source; bindings to
    /// another node also order this task after it.
    pub fn add_task<'a, I>(&mut self, spec: TaskSpec, bindings: I) -> Result<TaskRef, BuildError>
    where
        I: IntoIterator<Item = (&'a str, ArtifactSource)>,
    {
        self.check_new_node(&spec.name)?;
        validate_executable(&spec)?;

        let mut slots = HashSet::new();
        for output in &spec.outputs {
            validate_name(&output.name)?;
            if !slots.insert(output.name.as_str()) {
                return Err(BuildError::DuplicateOutput {
                    task: spec.name.clone(),
                    slot: output.name.clone(),
                });
            }
        }

        let bindings = self.collect_bindings(&spec.name, bindings)?;
        let handle = TaskRef {
            name: spec.name.clone(),
            outputs: spec.outputs.iter().map(|o| o.name.clone()).collect(),
        };
        self.insert_node(Node::Task(TaskNode { spec, bindings }));
        Ok(handle)
    }

    /// Embeds `dag` as a node named after it.
    pub fn add_sub_dag<'a, I>(&mut self, dag: &Dag, arguments: I) -> Result<CompositeRef, BuildError>
    where
        I: IntoIterator<Item = (&'a str, ArtifactSource)>,
    {
        let name = dag.name().to_string();
        self.add_sub_dag_as(name, dag, arguments)
    }

    /// Embeds `dag` under an explicit node name, so the same DAG can be used
    /// more than once.
    pub fn add_sub_dag_as<'a, I>(
        &mut self,
        name: impl Into<String>,
        dag: &Dag,
        arguments: I,
    ) -> Result<CompositeRef, BuildError>
    where
        I: IntoIterator<Item = (&'a str, ArtifactSource)>,
    {
        let name = name.into();
        self.check_new_node(&name)?;

        let arguments = self.collect_bindings(&name, arguments)?;
        for declared in dag.inputs() {
            if !arguments.contains_key(declared) {
                return Err(BuildError::MissingArgument {
                    node: name.clone(),
                    name: declared.clone(),
                });
            }
        }
        if let Some(extra) = arguments.keys().find(|arg| !dag.inputs().contains(*arg)) {
            return Err(BuildError::UnknownArgument {
                node: name.clone(),
                name: extra.clone(),
            });
        }

        let handle = CompositeRef {
            name: name.clone(),
            outputs: dag.output_names().map(str::to_string).collect(),
        };
        self.insert_node(Node::Composite(CompositeNode {
            name,
            dag: Arc::new(dag.clone()),
            arguments,
        }));
        Ok(handle)
    }

    /// Orders every node in `from` before every node in `to`.
    pub fn order(
        &mut self,
        from: impl Into<Nodes>,
        to: impl Into<Nodes>,
    ) -> Result<(), BuildError> {
        let Nodes(from) = from.into();
        let Nodes(to) = to.into();
        for name in from.iter().chain(to.iter()) {
            self.require_node(name)?;
        }
        for source in &from {
            for target in &to {
                if source == target {
                    return Err(BuildError::SelfLoop(source.clone()));
                }
            }
        }
        for source in &from {
            for target in &to {
                self.push_edge(source, target, EdgeKind::Ordering);
            }
        }
        Ok(())
    }

    /// Chains nodes so each runs after the previous one.
    pub fn steps<I, T>(&mut self, nodes: I) -> Result<(), BuildError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let names: Vec<String> = nodes.into_iter().map(|n| n.as_ref().to_string()).collect();
        for pair in names.windows(2) {
            self.order(pair[0].as_str(), pair[1].as_str())?;
        }
        if let [only] = names.as_slice() {
            self.require_node(only)?;
        }
        Ok(())
    }

    /// Exposes `source` as an output of this DAG.
    pub fn declare_output(
        &mut self,
        name: impl Into<String>,
        source: ArtifactSource,
    ) -> Result<(), BuildError> {
        let name = name.into();
        validate_name(&name)?;
        if self.outputs.iter().any(|(existing, _)| *existing == name) {
            return Err(BuildError::DuplicateDagOutput {
                dag: self.name.clone(),
                name,
            });
        }
        self.check_source(&source)?;
        self.outputs.push((name, source));
        Ok(())
    }

    pub fn build(self) -> Result<Dag, BuildError> {
        validate_name(&self.name)?;
        let mut declared = HashSet::new();
        for input in &self.inputs {
            validate_name(input)?;
            if !declared.insert(input.as_str()) {
                return Err(BuildError::DuplicateInput {
                    dag: self.name.clone(),
                    name: input.clone(),
                });
            }
        }
        if self.nodes.is_empty() {
            return Err(BuildError::EmptyDag(self.name));
        }

        Ok(Dag {
            name: self.name,
            inputs: self.inputs,
            nodes: self.nodes,
            edges: self.edges,
            outputs: self.outputs,
        })
    }

    fn check_new_node(&self, name: &str) -> Result<(), BuildError> {
        validate_name(name)?;
        if name == INPUTS_NAMESPACE {
            return Err(BuildError::ReservedName(name.to_string()));
        }
        if self.index.contains_key(name) {
            return Err(BuildError::DuplicateName {
                dag: self.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn collect_bindings<'a, I>(
        &self,
        node: &str,
        bindings: I,
    ) -> Result<BTreeMap<String, ArtifactSource>, BuildError>
    where
        I: IntoIterator<Item = (&'a str, ArtifactSource)>,
    {
        let mut collected = BTreeMap::new();
        for (slot, source) in bindings {
            validate_name(slot)?;
            self.check_source(&source)?;
            if collected.insert(slot.to_string(), source).is_some() {
                return Err(BuildError::DuplicateBinding {
                    node: node.to_string(),
                    slot: slot.to_string(),
                });
            }
        }
        Ok(collected)
    }

    fn check_source(&self, source: &ArtifactSource) -> Result<(), BuildError> {
        match source {
            ArtifactSource::Input(name) => {
                if !self.inputs.contains(name) {
                    return Err(self.undeclared_input(name));
                }
            }
            ArtifactSource::Output { node, slot } => {
                let producer = self.require_node(node)?;
                if !producer.has_output(slot) {
                    return Err(BuildError::UnknownOutput {
                        node: node.clone(),
                        slot: slot.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn require_node(&self, name: &str) -> Result<&Node, BuildError> {
        self.index
            .get(name)
            .and_then(|idx| self.nodes.get(*idx))
            .ok_or_else(|| BuildError::UnknownNode {
                dag: self.name.clone(),
                name: name.to_string(),
            })
    }

    fn insert_node(&mut self, node: Node) {
        let name = node.name().to_string();
        let producers: Vec<String> = node
            .sources()
            .filter_map(|source| source.node().map(str::to_string))
            .collect();
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(node);
        for producer in producers {
            self.push_edge(&producer, &name, EdgeKind::Artifact);
        }
    }

    fn push_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        if self
            .seen_edges
            .insert((from.to_string(), to.to_string(), kind))
        {
            self.edges.push(Edge {
                from: from.to_string(),
                to: to.to_string(),
                kind,
            });
        }
    }

    fn undeclared_input(&self, name: &str) -> BuildError {
        BuildError::UndeclaredInput {
            dag: self.name.clone(),
            name: name.to_string(),
        }
    }
}

fn validate_executable(spec: &TaskSpec) -> Result<(), BuildError> {
    let reason = match &spec.executable {
        Executable::Handler { name } if name.trim().is_empty() => "handler name is empty",
        Executable::Script { source, .. } if source.trim().is_empty() => "script source is empty",
        Executable::Script { interpreter, .. } if interpreter.is_empty() => {
            "script interpreter is empty"
        }
        Executable::Container { image, .. } if image.trim().is_empty() => {
            "container image is empty"
        }
        _ => return Ok(()),
    };
    Err(BuildError::InvalidExecutable {
        task: spec.name.clone(),
        reason: reason.to_string(),
    })
}

/// Names start with an ASCII letter or digit and continue with letters,
/// digits, `_` or `-`. A leading `_` is reserved for engine use.
pub(crate) fn validate_name(name: &str) -> Result<(), BuildError> {
    if name.starts_with('_') {
        return Err(BuildError::ReservedName(name.to_string()));
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(BuildError::InvalidName(name.to_string()));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(BuildError::InvalidName(name.to_string()));
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(BuildError::InvalidName(name.to_string()));
    }

    Ok(())
}
