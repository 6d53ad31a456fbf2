use crate::builder::validate_name;
use crate::errors::{BuildError, PlanError};
use crate::flatten::flatten;
use crate::graph::Dag;
use crate::initialize::initialize_run;
use crate::layers::topological_layers;
use crate::model::{Run, Task, WorkflowMeta};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// A root DAG plus the metadata submitted alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    meta: WorkflowMeta,
    generate_name: Option<String>,
    entrypoint: Arc<Dag>,
}

pub struct WorkflowBuilder {
    meta: WorkflowMeta,
    generate_name: Option<String>,
    entrypoint: Dag,
}

impl WorkflowBuilder {
    /// The workflow is named after its entrypoint unless [`Self::name`] says otherwise.
    pub fn new(entrypoint: Dag) -> Self {
        Self {
            meta: WorkflowMeta {
                name: entrypoint.name().to_string(),
                ..WorkflowMeta::default()
            },
            generate_name: None,
            entrypoint,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = name.into();
        self
    }

    /// Run ids become this prefix followed by a random suffix.
    pub fn generate_name(mut self, prefix: impl Into<String>) -> Self {
        self.generate_name = Some(prefix.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.meta.namespace = Some(namespace.into());
        self
    }

    pub fn service_account(mut self, account: impl Into<String>) -> Self {
        self.meta.service_account = Some(account.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.labels.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Workflow, BuildError> {
        validate_name(&self.meta.name)?;
        if let Some(prefix) = &self.generate_name {
            validate_name(prefix)?;
        }
        Ok(Workflow {
            meta: self.meta,
            generate_name: self.generate_name,
            entrypoint: Arc::new(self.entrypoint),
        })
    }
}

impl Workflow {
    pub fn builder(entrypoint: Dag) -> WorkflowBuilder {
        WorkflowBuilder::new(entrypoint)
    }

    pub fn meta(&self) -> &WorkflowMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn entrypoint(&self) -> &Dag {
        &self.entrypoint
    }

    pub fn inputs(&self) -> &[String] {
        self.entrypoint.inputs()
    }

    pub fn new_run_id(&self) -> String {
        match &self.generate_name {
            Some(prefix) => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{prefix}{}", &suffix[..8])
            }
            None => format!("{}-{}", self.meta.name, Uuid::now_v7()),
        }
    }

    /// Every declared input must be provided, and nothing else.
    pub fn check_inputs<'a, I>(&self, provided: I) -> Result<(), PlanError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let provided: Vec<&str> = provided.into_iter().collect();
        if let Some(unknown) = provided
            .iter()
            .find(|name| !self.inputs().iter().any(|i| i == *name))
        {
            return Err(PlanError::UnknownInput(unknown.to_string()));
        }
        if let Some(missing) = self
            .inputs()
            .iter()
            .find(|declared| !provided.contains(&declared.as_str()))
        {
            return Err(PlanError::UnboundInput(missing.clone()));
        }
        Ok(())
    }

    pub fn plan(&self) -> Result<Run, PlanError> {
        self.plan_with_id(self.new_run_id())
    }

    /// Flattens the entrypoint and lays out a fresh run. Pure: nothing runs
    /// and nothing is persisted.
    pub fn plan_with_id(&self, run_id: impl Into<String>) -> Result<Run, PlanError> {
        let graph = flatten(&self.entrypoint)?;
        let layering = topological_layers(
            graph.tasks.keys().map(String::as_str),
            graph.edges.iter().map(|(a, b)| (a.as_str(), b.as_str())),
        )?;

        let mut upstream: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        let mut downstream: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (from, to) in &graph.edges {
            upstream.entry(to.as_str()).or_default().push(from.clone());
            downstream.entry(from.as_str()).or_default().push(to.clone());
        }

        let mut tasks = HashMap::with_capacity(graph.tasks.len());
        for (id, flat) in &graph.tasks {
            let spec = &flat.spec;
            let mut task = Task::new(id.clone(), spec.executable.clone());
            task.parameters = spec.parameters.clone();
            task.inputs = flat.inputs.clone();
            task.outputs = spec.outputs.clone();
            task.retry = spec.retry;
            task.timeout_ms = spec
                .timeout
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            task.layer = layering.layers.get(id).copied().unwrap_or(0);
            task.depends_on = upstream.remove(id.as_str()).unwrap_or_default();
            task.downstream = downstream.remove(id.as_str()).unwrap_or_default();
            tasks.insert(id.clone(), task);
        }

        let mut run = Run::new(run_id, self.meta.clone());
        run.total_layers = layering.total_layers;
        run.inputs = graph.inputs;
        run.outputs = graph.outputs;
        run.tasks = tasks;
        initialize_run(&mut run);
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DagBuilder;
    use crate::graph::ArtifactSource;
    use crate::model::{ArtifactKey, TaskSpec, TaskStatus, WorkflowStatus};
    use std::time::Duration;

    fn hello() -> Dag {
        let mut dag = DagBuilder::new("hello", ["greeting"]);
        let say = dag
            .add_task(
                TaskSpec::handler("say")
                    .parameter("message", "Hello world!")
                    .output("said")
                    .timeout(Duration::from_millis(1500)),
                [("greeting", ArtifactSource::input("greeting"))],
            )
            .expect("say");
        dag.add_task(
            TaskSpec::handler("echo").retry_limit(2),
            [("said", say.output("said").expect("said"))],
        )
        .expect("echo");
        dag.declare_output("said", say.output("said").expect("said"))
            .expect("output");
        dag.build().expect("hello")
    }

    #[test]
    fn plan_lays_out_tasks_with_wiring() {
        let workflow = Workflow::builder(hello())
            .namespace("argo")
            .service_account("argo-workflow")
            .label("team", "data")
            .build()
            .expect("workflow");
        let run = workflow.plan_with_id("hello-1").expect("plan");

        assert_eq!(run.run_id, "hello-1");
        assert_eq!(run.status, WorkflowStatus::Pending);
        assert_eq!(run.workflow.namespace.as_deref(), Some("argo"));
        assert_eq!(run.total_layers, 2);
        assert_eq!(run.inputs, vec!["greeting"]);
        assert_eq!(run.outputs["said"], ArtifactKey::new("say", "said"));

        let say = &run.tasks["say"];
        assert_eq!(say.layer, 0);
        assert_eq!(say.downstream, vec!["echo"]);
        assert_eq!(say.timeout_ms, Some(1500));
        assert_eq!(say.parameters["message"], "Hello world!");
        assert_eq!(say.inputs["greeting"], ArtifactKey::external("greeting"));

        let echo = &run.tasks["echo"];
        assert_eq!(echo.depends_on, vec!["say"]);
        assert_eq!(echo.deps_remaining, 1);
        assert_eq!(echo.retry.max_attempts(), 3);
        assert!(run.tasks.values().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn run_ids_follow_generate_name() {
        let workflow = Workflow::builder(hello())
            .generate_name("hello-world-")
            .build()
            .expect("workflow");
        let first = workflow.new_run_id();
        let second = workflow.new_run_id();
        assert!(first.starts_with("hello-world-"));
        assert_eq!(first.len(), "hello-world-".len() + 8);
        assert_ne!(first, second);

        let named = Workflow::builder(hello()).build().expect("workflow");
        assert!(named.new_run_id().starts_with("hello-"));
    }

    #[test]
    fn rejects_invalid_workflow_name() {
        let err = Workflow::builder(hello())
            .name("bad name")
            .build()
            .expect_err("space");
        assert_eq!(err, BuildError::InvalidName("bad name".to_string()));
    }

    #[test]
    fn inputs_must_match_declaration() {
        let workflow = Workflow::builder(hello()).build().expect("workflow");
        assert!(workflow.check_inputs(["greeting"]).is_ok());
        assert_eq!(
            workflow.check_inputs([]).expect_err("missing"),
            PlanError::UnboundInput("greeting".to_string())
        );
        assert_eq!(
            workflow
                .check_inputs(["greeting", "extra"])
                .expect_err("unknown"),
            PlanError::UnknownInput("extra".to_string())
        );
    }
}
