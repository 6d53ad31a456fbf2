mod config;
mod manifest;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use config::Config;
use manifest::Manifest;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weave_client::{Client, LocalService, WorkflowService};
use weave_core::{HandlerContext, HandlerRunner, RunnerRegistry, TaskError, TaskOutcome, WorkflowStatus};
use weave_store::{LocalFsStore, ObjectStore};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Build, run and inspect DAG workflows")]
struct Cli {
    #[arg(long, global = true, default_value = "weave.toml")]
    config: PathBuf,

    /// Overrides RUST_LOG for weave crates (e.g. debug).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, env = "WEAVE_STORE_PATH")]
    store_path: Option<PathBuf>,

    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a manifest and print its layers without running anything.
    Validate(ValidateArgs),
    /// Run a manifest to completion.
    Run(RunArgs),
    Status(StatusArgs),
    /// List persisted runs.
    List,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    manifest: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    manifest: PathBuf,
    #[arg(long, value_name = "NAME=VALUE|NAME=@FILE")]
    input: Vec<String>,
    /// Serve handler tasks with no registered handler from a builtin.
    #[arg(long, default_value = "echo")]
    handler_builtin: String,
    /// Write the payload of this workflow output to stdout once the run succeeds.
    #[arg(long)]
    print_output: Option<String>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long, default_value_t = false)]
    watch: bool,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut config = Config::load(&cli.config)?;
    if let Some(path) = &cli.store_path {
        config.store.path = path.clone();
    }
    if let Some(limit) = cli.max_concurrency {
        config.executor.max_concurrency = limit;
    }

    match cli.command {
        Commands::Validate(args) => run_validate_command(args),
        Commands::Run(args) => run_run_command(args, &config).await,
        Commands::Status(args) => run_status_command(args, &config).await,
        Commands::List => run_list_command(&config).await,
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(format!("weave={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "weave=info".into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_validate_command(args: ValidateArgs) -> Result<()> {
    let workflow = Manifest::load(&args.manifest)?.into_workflow()?;
    let run = workflow
        .plan_with_id(format!("{}-validate", workflow.name()))
        .context("workflow does not plan")?;

    println!(
        "Workflow {}: {} tasks in {} layers",
        workflow.name(),
        run.tasks.len(),
        run.total_layers
    );
    if !workflow.inputs().is_empty() {
        println!("Inputs: {}", workflow.inputs().join(", "));
    }
    let mut layers: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for task_id in run.ordered_task_ids() {
        if let Some(task) = run.tasks.get(&task_id) {
            layers.entry(task.layer).or_default().push(task_id);
        }
    }
    for (layer, tasks) in layers {
        println!("  Layer {layer}: {}", tasks.join(", "));
    }
    for (name, key) in &run.outputs {
        println!("Output {name} <- {key}");
    }
    Ok(())
}

async fn run_run_command(args: RunArgs, config: &Config) -> Result<()> {
    let workflow = Manifest::load(&args.manifest)?.into_workflow()?;
    let inputs = parse_inputs(&args.input)?;

    let mut handlers = HandlerRunner::new();
    match args.handler_builtin.as_str() {
        "echo" => handlers.register_fallback(echo),
        "none" => {}
        other => bail!("unknown --handler-builtin {other}, expected echo or none"),
    }

    let service = local_service(config, RunnerRegistry::local(handlers))?;
    let client = Client::new(service);
    let snapshot = client.create(&workflow, inputs, true).await?;
    println!("{snapshot}");

    if snapshot.status != WorkflowStatus::Succeeded {
        bail!("run {} finished {}", snapshot.run_id, snapshot.status.as_str());
    }
    if let Some(name) = args.print_output {
        let payload = client.service().output(&snapshot.run_id, &name).await?;
        println!("{}", String::from_utf8_lossy(&payload));
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs, config: &Config) -> Result<()> {
    let client = Client::new(local_service(config, RunnerRegistry::new())?);

    loop {
        let snapshot = client.status(&args.run_id).await?;
        println!("{snapshot}");

        if !args.watch || snapshot.status.is_terminal() {
            break;
        }

        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    Ok(())
}

async fn run_list_command(config: &Config) -> Result<()> {
    let service = local_service(config, RunnerRegistry::new())?;
    for run_id in service.runs().await? {
        let snapshot = service.status(&run_id).await?;
        println!("{run_id}\t{}\t{}", snapshot.workflow.name, snapshot.status.as_str());
    }
    Ok(())
}

fn local_service(config: &Config, runners: RunnerRegistry) -> Result<LocalService> {
    let service_config = config.service_config(|name| std::env::var(name).ok());
    if service_config.endpoint != "local" {
        bail!(
            "unsupported service endpoint {}, only local is available",
            service_config.endpoint
        );
    }
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(config.store.path.clone()));
    Ok(LocalService::new(store, runners)
        .with_config(service_config)
        .with_executor_config(config.executor))
}

fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, Bytes>> {
    let mut inputs = BTreeMap::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --input value '{item}', expected NAME=VALUE"))?;
        let payload = match value.strip_prefix('@') {
            Some(path) => Bytes::from(
                std::fs::read(Path::new(path))
                    .with_context(|| format!("failed to read input {name} from {path}"))?,
            ),
            None => Bytes::from(value.to_string()),
        };
        if inputs.insert(name.to_string(), payload).is_some() {
            bail!("input {name} given more than once");
        }
    }
    Ok(inputs)
}

/// Fills every declared output with a JSON description of the invocation.
fn echo(ctx: HandlerContext) -> Result<TaskOutcome, TaskError> {
    let inputs: BTreeMap<&str, String> = ctx
        .inputs
        .iter()
        .map(|(slot, payload)| (slot.as_str(), String::from_utf8_lossy(payload).into_owned()))
        .collect();
    let body = serde_json::json!({
        "task_id": ctx.task_id,
        "attempt": ctx.attempt,
        "parameters": ctx.parameters,
        "inputs": inputs,
    });
    let payload = serde_json::to_vec(&body).map_err(|e| TaskError::Runner(e.to_string()))?;
    let payload = Bytes::from(payload);
    Ok(ctx
        .outputs
        .iter()
        .fold(TaskOutcome::success(), |outcome, slot| {
            outcome.with_output(slot.clone(), payload.clone())
        }))
}
