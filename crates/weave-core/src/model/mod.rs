mod retry;
mod run;
mod status;
mod task;

pub use retry::{Backoff, RetryPolicy};
pub use run::{Run, WorkflowMeta};
pub use status::{TaskStatus, WorkflowStatus};
pub use task::{ArtifactKey, Executable, ExecutableKind, OutputSpec, Task, TaskSpec};
