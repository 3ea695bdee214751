use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{Pipeline, ReleaseConfig, ReleaseError, ReleaseRequest, DEFAULT_CONFIG_PATH};
use keel_apply::{Action, ApplyReport, ChangePlan, OpStatus};
use keel_build::{DockerCli, RegistryCredentials};
use keel_core::{ArtifactRef, StackId, Topology};
use keel_kubehub::KubeCluster;
use keel_persist::{Backend, SqliteBackend};
use keel_plan::SecretPayload;
use keel_resolve::DEFAULT_LOCATION;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Build, resolve and reconcile one workload")]
struct Cli {
    /// Release config
    #[arg(long = "config", global = true, env = "KEEL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Override the configured topology (service | scheduled-job)
    #[arg(long = "topology", global = true, value_parser = Topology::from_str)]
    topology: Option<Topology>,

    /// Kubeconfig file (default: KUBECONFIG or in-cluster)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// Shared backend database
    #[arg(long = "db", global = true, env = "KEEL_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build, push and reconcile the cluster for a commit
    Release {
        /// Commit identifier; becomes the image tag
        #[arg(long = "commit", env = "KEEL_COMMIT")]
        commit: String,
        /// Deploy an existing image instead of building
        #[arg(long = "skip-build", action = ArgAction::SetTrue, requires = "image")]
        skip_build: bool,
        /// Pre-built image reference (repo:tag), used with --skip-build
        #[arg(long = "image")]
        image: Option<String>,
        /// Secret key fed from an environment variable, e.g. api_key=BOOKER_API_KEY
        #[arg(long = "secret-env", value_name = "KEY=ENV_VAR")]
        secret_env: Vec<String>,
    },
    /// Compute the change plan for a commit without building or mutating
    Plan {
        #[arg(long = "commit", env = "KEEL_COMMIT")]
        commit: String,
        #[arg(long = "secret-env", value_name = "KEY=ENV_VAR")]
        secret_env: Vec<String>,
    },
    /// Print the desired resource set (secret values redacted)
    Render {
        #[arg(long = "commit", env = "KEEL_COMMIT")]
        commit: String,
        #[arg(long = "secret-env", value_name = "KEY=ENV_VAR")]
        secret_env: Vec<String>,
    },
    /// Resolve configured remote outputs and list their keys
    Resolve,
    /// Reconciliation state of this stack
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Read or write stack outputs in a backend
    Outputs {
        #[command(subcommand)]
        command: OutputsCommands,
    },
    /// Force-release this stack's lock
    Unlock,
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    /// Print the last persisted state
    Show,
}

#[derive(Subcommand, Debug)]
enum OutputsCommands {
    /// Print a stack's outputs
    Get {
        /// Stack as namespace/stack (default: this stack)
        #[arg(long = "stack")]
        stack: Option<String>,
        #[arg(long = "backend", default_value = DEFAULT_LOCATION)]
        backend: String,
    },
    /// Merge KEY=VALUE pairs into a stack's outputs
    Set {
        #[arg(long = "stack")]
        stack: String,
        #[arg(long = "backend", default_value = DEFAULT_LOCATION)]
        backend: String,
        #[arg(required = true, value_name = "KEY=VALUE")]
        values: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries command output (render, -o json)
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let code = e.downcast_ref::<ReleaseError>().map(|r| r.exit_code()).unwrap_or(1);
        error!(error = %format!("{e:#}"), code, "keelctl failed");
        eprintln!("error: {e:#}");
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = ReleaseConfig::load(&cli.config).map_err(ReleaseError::from).with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(t) = cli.topology {
        cfg.topology = t;
    }
    let pipeline = open_pipeline(&cli, cfg)?;
    info!(stack = %pipeline.stack(), topology = %pipeline.config().topology, "keelctl ready");

    match cli.command {
        Commands::Release { ref commit, skip_build, ref image, ref secret_env } => {
            let mut req = ReleaseRequest::new(commit.clone()).secrets(secret_payload(secret_env)?);
            if skip_build {
                let image = image.as_deref().ok_or_else(|| anyhow!("--skip-build needs --image"))?;
                req = req.prebuilt(ArtifactRef::parse(image).map_err(|e| anyhow!("--image {image}: {e}"))?);
            } else {
                req.credentials = registry_credentials();
            }
            let cluster = connect(&cli, &pipeline).await?;
            let released = pipeline.release(&cluster, &req).await.map_err(|e| report_failure(cli.output, e))?;
            match cli.output {
                Output::Human => {
                    println!("image:   {}", released.artifact);
                    println!("serial:  {}", released.state.serial);
                    print_report(&released.report);
                    if released.report.ops.is_empty() {
                        println!("no changes; {} resource(s) already converged", released.plan.unchanged.len());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&released)?),
            }
        }
        Commands::Plan { ref commit, ref secret_env } => {
            let secrets = secret_payload(secret_env)?;
            let cluster = connect(&cli, &pipeline).await?;
            let planned = pipeline.plan(&cluster, commit, &secrets).await?;
            match cli.output {
                Output::Human => {
                    println!("image:       {}", planned.artifact);
                    println!("fingerprint: {}", planned.desired_fingerprint);
                    print_plan(&planned.plan);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&planned)?),
            }
        }
        Commands::Render { ref commit, ref secret_env } => {
            let secrets = secret_payload(secret_env)?;
            let artifact = ArtifactRef::new(&pipeline.config().repository, commit.as_str()).map_err(|e| anyhow!("commit {commit}: {e}"))?;
            let set = pipeline.desired(&artifact, &secrets)?.redacted();
            match cli.output {
                Output::Human => print!("{}", set.to_yaml()?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&set)?),
            }
        }
        Commands::Resolve => {
            let resolved = pipeline.resolve()?;
            let keys: Vec<&String> = resolved.keys().collect();
            match cli.output {
                Output::Human => {
                    for req in &pipeline.config().outputs {
                        println!("{:<20} <- {} {} ({})", req.key(), req.stack, req.output, req.location());
                    }
                    println!("{} value(s) resolved", keys.len());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }
        }
        Commands::State { command: StateCommands::Show } => match pipeline.state()? {
            None => match cli.output {
                Output::Human => println!("stack {} has no reconciliation state", pipeline.stack()),
                Output::Json => println!("null"),
            },
            Some(state) => match cli.output {
                Output::Human => {
                    println!("serial:    {}", state.serial);
                    println!("run:       {}", state.run_id);
                    println!("outcome:   {:?}", state.outcome);
                    println!("image:     {}", state.artifact);
                    println!("topology:  {}", state.topology);
                    println!("namespace: {}", state.namespace);
                    for key in &state.applied {
                        println!("  {}", key);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&state)?),
            },
        },
        Commands::Outputs { command: OutputsCommands::Get { ref stack, ref backend } } => {
            let stack = match stack {
                Some(s) => parse_stack(s)?,
                None => pipeline.stack().clone(),
            };
            let outputs = pipeline.outputs(backend, &stack)?;
            match (cli.output, outputs) {
                (Output::Json, o) => println!("{}", serde_json::to_string_pretty(&o)?),
                (Output::Human, None) => println!("stack {stack} has never been applied"),
                (Output::Human, Some(o)) => {
                    for (k, v) in o {
                        println!("{k}={v}");
                    }
                }
            }
        }
        Commands::Outputs { command: OutputsCommands::Set { ref stack, ref backend, ref values } } => {
            let stack = parse_stack(stack)?;
            let mut pairs = BTreeMap::new();
            for v in values {
                let (k, val) = split_pair(v)?;
                pairs.insert(k.to_string(), val.to_string());
            }
            let merged = pipeline.set_outputs(backend, &stack, pairs).await?;
            match cli.output {
                Output::Human => println!("stack {stack}: {} output(s)", merged.len()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&merged)?),
            }
        }
        Commands::Unlock => {
            let removed = pipeline.force_unlock()?;
            match (cli.output, removed) {
                (Output::Json, r) => println!("{}", serde_json::to_string_pretty(&r)?),
                (Output::Human, None) => println!("no lock held for {}", pipeline.stack()),
                (Output::Human, Some(l)) => println!("released lock held by {} (expires_at_ms={})", l.holder, l.expires_at_ms),
            }
        }
    }
    Ok(())
}

fn open_backend(path: Option<&str>, cfg: &ReleaseConfig) -> Result<SqliteBackend> {
    match path {
        Some(p) => SqliteBackend::open(p, cfg.timeouts.backend()).map_err(ReleaseError::from).with_context(|| format!("opening backend {p}")),
        None => SqliteBackend::open_default().map_err(ReleaseError::from).context("opening default backend"),
    }
}

fn open_pipeline(cli: &Cli, cfg: ReleaseConfig) -> Result<Pipeline> {
    let own: Arc<dyn Backend> = Arc::new(open_backend(cli.db.as_deref(), &cfg)?);
    let mut extra = Vec::new();
    for (name, path) in &cfg.backends {
        let b: Arc<dyn Backend> = Arc::new(open_backend(Some(path), &cfg)?);
        extra.push((name.clone(), b));
    }
    let builder = Arc::new(DockerCli::from_env().with_timeouts(cfg.timeouts.build(), cfg.timeouts.push()));
    let pipeline = extra.into_iter().fold(Pipeline::new(cfg, own, builder)?, |p, (name, b)| p.with_location(name, b));
    Ok(pipeline)
}

async fn connect(cli: &Cli, pipeline: &Pipeline) -> Result<KubeCluster> {
    let timeout = pipeline.config().timeouts.cluster();
    let client = keel_kubehub::connect(cli.kubeconfig.as_deref().map(Path::new), cli.context.as_deref(), timeout)
        .await
        .map_err(ReleaseError::from)
        .context("connecting to cluster")?;
    let cluster = KubeCluster::new(client, timeout);
    cluster.preflight().await.map_err(ReleaseError::from).context("cluster preflight")?;
    Ok(cluster)
}

/// `--secret-env KEY=ENV_VAR`: the value comes from the environment, never from argv.
fn secret_payload(specs: &[String]) -> Result<SecretPayload> {
    let mut secrets = SecretPayload::new();
    for spec in specs {
        let (key, var) = split_pair(spec)?;
        let value = std::env::var(var).map_err(|_| anyhow!("--secret-env {key}: environment variable {var} is not set"))?;
        secrets.insert(key, value).with_context(|| format!("--secret-env {key}"))?;
    }
    Ok(secrets)
}

fn registry_credentials() -> Option<RegistryCredentials> {
    match (std::env::var("KEEL_REGISTRY_USER"), std::env::var("KEEL_REGISTRY_PASSWORD")) {
        (Ok(username), Ok(password)) if !username.is_empty() => Some(RegistryCredentials { username, password }),
        (Ok(_), Err(_)) => {
            warn!("KEEL_REGISTRY_USER set without KEEL_REGISTRY_PASSWORD; skipping registry login");
            None
        }
        _ => None,
    }
}

fn split_pair(s: &str) -> Result<(&str, &str)> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k, v)),
        _ => bail!("expected KEY=VALUE, got {s:?}"),
    }
}

fn parse_stack(s: &str) -> Result<StackId> {
    s.parse::<StackId>().map_err(|e| anyhow!("--stack: {e}"))
}

/// Print the per-operation report before handing a failure that touched the
/// cluster back.
fn report_failure(output: Output, e: ReleaseError) -> anyhow::Error {
    match (output, e.report()) {
        (Output::Human, Some(report)) => print_report(report),
        (Output::Json, Some(_)) => match failure_document(&e).map(|doc| serde_json::to_string_pretty(&doc)) {
            Some(Ok(doc)) => println!("{doc}"),
            Some(Err(err)) => warn!(error = %err, "could not encode the apply report"),
            None => {}
        },
        _ => {}
    }
    anyhow::Error::new(e)
}

/// `{ "error": <class>, "report": <ApplyReport> }` for failures that carry a report.
fn failure_document(e: &ReleaseError) -> Option<serde_json::Value> {
    let report = serde_json::to_value(e.report()?).ok()?;
    Some(serde_json::json!({ "error": e.class(), "report": report }))
}

fn print_plan(plan: &ChangePlan) {
    if plan.is_empty() {
        println!("no changes ({} unchanged)", plan.unchanged.len());
        return;
    }
    for op in &plan.ops {
        let sign = match op.action {
            Action::Create => "+",
            Action::Update => "~",
            Action::Delete => "-",
        };
        match &op.diff {
            Some(d) => println!("{sign} {} (+{} ~{} -{})", op.key, d.adds, d.updates, d.removes),
            None => println!("{sign} {}", op.key),
        }
    }
    println!(
        "{} to create, {} to update, {} to delete, {} unchanged",
        plan.count(Action::Create),
        plan.count(Action::Update),
        plan.count(Action::Delete),
        plan.unchanged.len()
    );
}

fn print_report(report: &ApplyReport) {
    for op in &report.ops {
        match &op.status {
            OpStatus::Succeeded => println!("ok      {:<6} {}", op.action, op.key),
            OpStatus::Failed(reason) => println!("FAILED  {:<6} {}: {}", op.action, op.key, reason),
            OpStatus::Skipped => println!("skipped {:<6} {}", op.action, op.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_apply::OpReport;
    use keel_core::{ResourceKey, ResourceKind};

    #[test]
    fn partial_failure_document_lists_every_operation() {
        let report = ApplyReport {
            dry_run: false,
            ops: vec![
                OpReport::new(Action::Create, ResourceKey::namespace("bookings"), OpStatus::Succeeded),
                OpReport::new(
                    Action::Create,
                    ResourceKey::namespaced(ResourceKind::Deployment, "bookings", "booker"),
                    OpStatus::Failed("admission webhook denied".into()),
                ),
            ],
        };
        let doc = failure_document(&ReleaseError::ApplyPartialFailure(report)).unwrap();
        assert_eq!(doc["error"], "ApplyPartialFailure");
        let ops = doc["report"]["ops"].as_array().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1]["status"], "failed");
        assert_eq!(ops[1]["reason"], "admission webhook denied");

        let lock = ReleaseError::LockContention { scope: StackId::new("bookings", "booker"), holder: "h".into(), attempts: 1 };
        assert!(failure_document(&lock).is_none());
    }
}
