pub mod builder;
pub mod errors;
pub mod executor;
pub mod flatten;
pub mod graph;
pub mod initialize;
pub mod layers;
pub mod model;
pub mod runner;
pub mod workflow;

pub use builder::{CompositeRef, DagBuilder, INPUTS_NAMESPACE, Nodes, TaskRef};
pub use errors::{BuildError, CycleError, ExecutionError, PlanError, TaskError};
pub use executor::{
    Executor, ExecutorConfig, LocalExecutor, MemoryBackend, ObjectStoreBackend, RunOutcome,
    StateBackend, WatchBackend, stage_inputs,
};
pub use flatten::{FlatGraph, FlatTask, flatten};
pub use graph::{ArtifactSource, CompositeNode, Dag, Edge, EdgeKind, Node, TaskNode};
pub use initialize::{initialize_run, resume_run};
pub use layers::{Layering, topological_layers};
pub use model::{
    ArtifactKey, Backoff, Executable, ExecutableKind, OutputSpec, RetryPolicy, Run, Task,
    TaskSpec, TaskStatus, WorkflowMeta, WorkflowStatus,
};
pub use runner::{
    HandlerContext, HandlerRunner, ProcessRunner, RunnerRegistry, TaskHandler, TaskInvocation,
    TaskOutcome, TaskRunner,
};
pub use workflow::{Workflow, WorkflowBuilder};
