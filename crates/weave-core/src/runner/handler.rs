use super::{TaskInvocation, TaskOutcome, TaskRunner};
use crate::errors::TaskError;
use crate::model::Executable;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

pub type TaskHandler = Arc<dyn Fn(HandlerContext) -> Result<TaskOutcome, TaskError> + Send + Sync>;

/// What a handler sees of its invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub run_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub parameters: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, Bytes>,
    /// Declared output slots, in declaration order.
    pub outputs: Vec<String>,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub fn input(&self, slot: &str) -> Result<&Bytes, TaskError> {
        self.inputs
            .get(slot)
            .ok_or_else(|| TaskError::Runner(format!("no input bound to slot {slot}")))
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Long-running handlers should poll this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// In-process runner for `Executable::Handler` tasks. Handlers run on the
/// blocking pool.
#[derive(Clone, Default)]
pub struct HandlerRunner {
    handlers: HashMap<String, TaskHandler>,
    fallback: Option<TaskHandler>,
}

impl HandlerRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(HandlerContext) -> Result<TaskOutcome, TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Used for handler names nothing else was registered under.
    pub fn register_fallback<F>(&mut self, handler: F)
    where
        F: Fn(HandlerContext) -> Result<TaskOutcome, TaskError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(handler));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&TaskHandler> {
        self.handlers.get(name).or(self.fallback.as_ref())
    }
}

#[async_trait]
impl TaskRunner for HandlerRunner {
    async fn run(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        let Executable::Handler { name } = &invocation.executable else {
            return Err(TaskError::Runner(format!(
                "handler runner cannot execute {} tasks",
                invocation.executable.kind()
            )));
        };
        let handler = self
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::Runner(format!("no handler registered as {name}")))?;

        let context = HandlerContext {
            run_id: invocation.run_id,
            task_id: invocation.task_id,
            attempt: invocation.attempt,
            parameters: invocation.parameters,
            inputs: invocation.inputs,
            outputs: invocation.outputs,
            cancel: cancel.clone(),
        };

        let work = spawn_blocking(move || handler(context));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            joined = work => joined.map_err(|e| TaskError::Runner(format!("handler panicked: {e}")))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn invocation(name: &str) -> TaskInvocation {
        TaskInvocation {
            run_id: "run-1".to_string(),
            task_id: "greet".to_string(),
            attempt: 1,
            executable: Executable::handler(name),
            parameters: BTreeMap::from([("message".to_string(), "hello".to_string())]),
            inputs: BTreeMap::from([("name".to_string(), Bytes::from_static(b"alice"))]),
            outputs: vec!["greeting".to_string()],
        }
    }

    #[tokio::test]
    async fn runs_registered_handler() {
        let mut runner = HandlerRunner::new();
        runner.register("greet", |ctx| {
            let name = String::from_utf8_lossy(ctx.input("name")?).to_string();
            let message = ctx.parameter("message").unwrap_or("hi");
            Ok(TaskOutcome::success().with_output("greeting", format!("{message} {name}")))
        });

        let outcome = runner
            .run(invocation("greet"), CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome.outputs["greeting"], Bytes::from("hello alice"));
    }

    #[tokio::test]
    async fn specific_handler_takes_precedence_over_fallback() {
        let mut runner = HandlerRunner::new();
        runner.register("greet", |_| Ok(TaskOutcome::success().with_output("from", "specific")));
        runner.register_fallback(|_| Ok(TaskOutcome::success().with_output("from", "fallback")));

        let specific = runner
            .run(invocation("greet"), CancellationToken::new())
            .await
            .expect("specific");
        let fallback = runner
            .run(invocation("other"), CancellationToken::new())
            .await
            .expect("fallback");
        assert_eq!(specific.outputs["from"], Bytes::from("specific"));
        assert_eq!(fallback.outputs["from"], Bytes::from("fallback"));
        assert_eq!(runner.names(), vec!["greet"]);
    }

    #[tokio::test]
    async fn unknown_handler_is_a_runner_error() {
        let runner = HandlerRunner::new();
        let err = runner
            .run(invocation("missing"), CancellationToken::new())
            .await
            .expect_err("nothing registered");
        assert!(matches!(err, TaskError::Runner(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting() {
        let mut runner = HandlerRunner::new();
        runner.register("greet", |ctx| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TaskError::Cancelled)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = runner
            .run(invocation("greet"), cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(err, TaskError::Cancelled);
    }
}
