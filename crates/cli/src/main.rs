use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_admission::{FailurePolicy, ImagePolicy, RunAsNonRoot, ValidatingBinding};
use keel_api::{ApiError, InProcApi, KeelApi};
use keel_core::prelude::*;
use keel_engine::{Engine, EngineConfig};
use keel_registry::{Kind, Registry};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod demo;
mod manifest;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: reconcile and admission core, in process")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Reconcile workers
    #[arg(long = "workers", env = "KEEL_WORKERS", global = true)]
    workers: Option<usize>,

    /// Per-hook admission timeout in milliseconds
    #[arg(long = "hook-timeout-ms", default_value_t = 2000, global = true)]
    hook_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk a Widget through schema, admission, reconcile and conflict handling
    Demo,
    /// Register CRDs and create objects from a manifest, reconcile until idle, print the result
    Apply {
        /// Multi-document YAML file
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Give up waiting for the engine to settle after this many seconds
        #[arg(long = "wait-secs", default_value_t = 10)]
        wait_secs: u64,
    },
    /// Dry-run pod manifests against the built-in pod policies
    Check {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Also require allowPrivilegeEscalation=false and readOnlyRootFilesystem=true
        #[arg(long = "strict", action = ArgAction::SetTrue)]
        strict: bool,
        /// Require cpu/memory requests and limits on every container
        #[arg(long = "require-resources", action = ArgAction::SetTrue)]
        require_resources: bool,
        /// Approved registry (repeatable); replaces the default list
        #[arg(long = "registry")]
        registries: Vec<String>,
        /// Namespace whose pods skip the checks (repeatable)
        #[arg(long = "exempt-ns")]
        exempt: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
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

fn engine_config(cli: &Cli) -> EngineConfig {
    let mut cfg = EngineConfig::from_env();
    if let Some(n) = cli.workers.filter(|n| *n > 0) {
        cfg.workers = n;
    }
    cfg
}

/// Engine running in the background until `stop` is called.
struct Running {
    engine: Arc<Engine>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), keel_engine::EngineError>>,
}

impl Running {
    async fn start(api: &InProcApi, cfg: EngineConfig) -> Self {
        let engine = Arc::new(Engine::new(api.store().clone(), api.registry().clone(), cfg));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.clone().run(cancel.clone()));
        engine.started().await;
        Self { engine, cancel, task }
    }

    async fn settle(&self, within: Duration) -> bool { self.engine.wait_idle(within).await }

    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.context("engine task")??;
        Ok(())
    }
}

#[derive(Serialize)]
struct Step {
    step: &'static str,
    ok: bool,
    detail: String,
}

fn report(output: Output, step: &'static str, ok: bool, detail: String) -> Result<()> {
    match output {
        Output::Human => println!("{} {:<12} {}", if ok { "✔" } else { "✘" }, step, detail),
        Output::Json => println!("{}", serde_json::to_string(&Step { step, ok, detail })?),
    }
    Ok(())
}

async fn run_demo(cli: &Cli) -> Result<()> {
    let out = cli.output;
    let registry = Arc::new(Registry::new());
    demo::register_widget(&registry, Duration::from_millis(cli.hook_timeout_ms))?;
    let api = InProcApi::in_memory(registry).as_user("demo");
    let widget = |replicas: i64| {
        Object::new(&demo::widget_gvk(), Some("default"), "w1").with_spec(serde_json::json!({"replicas": replicas}))
    };

    match api.create(widget(0)).await {
        Err(e @ ApiError::Schema(_)) => report(out, "schema", true, format!("replicas=0 rejected: {e}"))?,
        other => return Err(anyhow!("expected a schema rejection, got {other:?}")),
    }

    let stored = api.create(widget(3)).await?;
    report(
        out,
        "admit",
        true,
        format!("stored rv={} owner={}", stored.metadata.resource_version.unwrap_or_default(), stored.spec["owner"]),
    )?;

    let running = Running::start(&api, engine_config(cli)).await;
    if !running.settle(Duration::from_secs(10)).await {
        warn!("engine did not settle");
    }
    let reconciled = api.get(&stored.key()).await?;
    report(
        out,
        "reconcile",
        reconciled.status["ready"] == true,
        format!("status={} rv={}", reconciled.status, reconciled.metadata.resource_version.unwrap_or_default()),
    )?;

    let mut stale = stored.clone();
    stale.spec["replicas"] = serde_json::json!(5);
    match api.update(stale).await {
        Err(e) if e.is_conflict() => report(out, "conflict", true, format!("stale write rejected: {e}"))?,
        other => return Err(anyhow!("expected a conflict, got {other:?}")),
    }

    api.delete(&stored.key()).await?;
    running.settle(Duration::from_secs(10)).await;
    let gone = api.get(&stored.key()).await.err().map(|e| e.is_not_found()).unwrap_or(false);
    let children = api.list(&Gvk::new("", "v1", "ConfigMap"), Some("default")).await?;
    report(out, "finalize", gone && children.is_empty(), format!("widget erased={gone} configmaps left={}", children.len()))?;

    running.stop().await
}

async fn run_apply(cli: &Cli, file: &Path, wait_secs: u64) -> Result<()> {
    let docs = manifest::load(file)?;
    let registry = Arc::new(Registry::new());
    let mut objects = Vec::new();
    for doc in docs {
        match doc {
            manifest::Doc::Crd(crd) => {
                let gvk = crd.gvk.clone();
                registry
                    .register(Kind::from_crd(crd)?.reconciler(Arc::new(demo::Acceptor)))
                    .with_context(|| format!("registering {gvk}"))?;
            }
            manifest::Doc::Object(obj) => objects.push(obj),
        }
    }
    let api = InProcApi::in_memory(registry.clone());
    let running = Running::start(&api, engine_config(cli)).await;

    let mut kinds: BTreeSet<Gvk> = registry.kinds().into_iter().collect();
    let mut failed = 0usize;
    for mut obj in objects {
        kinds.insert(obj.gvk());
        let namespaced = registry.lookup(&obj.gvk()).map(|r| r.namespaced).unwrap_or(true);
        if namespaced && obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some("default".to_string());
        }
        let key = obj.key();
        match api.create(obj).await {
            Ok(o) => info!(key = %key, rv = %o.metadata.resource_version.unwrap_or_default(), "apply: created"),
            Err(e) => {
                failed += 1;
                eprintln!("{key}: {e}");
            }
        }
    }
    if !running.settle(Duration::from_secs(wait_secs)).await {
        warn!(wait_secs, "engine did not settle; printing current state");
    }

    let mut rows = Vec::new();
    for gvk in &kinds {
        rows.extend(api.list(gvk, None).await?);
    }
    running.stop().await?;

    match cli.output {
        Output::Human => print_objects(&rows, &registry),
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    if failed > 0 {
        return Err(anyhow!("{failed} object(s) rejected"));
    }
    Ok(())
}

fn print_objects(rows: &[Object], registry: &Registry) {
    println!("{:<28} {:<11} {:<24} {:<6} {:<10} AGE", "KIND", "NAMESPACE", "NAME", "GEN", "READY");
    for o in rows {
        let ready = o
            .condition("Accepted")
            .map(|c| format!("{:?}", c.status))
            .or_else(|| o.status.get("ready").map(|v| v.to_string()))
            .unwrap_or_else(|| "-".to_string());
        let extra = registry
            .lookup(&o.gvk())
            .and_then(|r| r.columns.clone())
            .map(|crd| crd.columns(o).into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        println!(
            "{:<28} {:<11} {:<24} {:<6} {:<10} {} {}",
            o.gvk().to_string(),
            o.metadata.namespace.as_deref().unwrap_or("-"),
            o.metadata.name,
            o.metadata.generation,
            ready,
            render_age(o.metadata.creation_timestamp),
            extra
        );
    }
}

#[derive(Serialize)]
struct CheckRow {
    object: String,
    allowed: bool,
    message: String,
    warnings: Vec<String>,
}

async fn run_check(
    cli: &Cli,
    file: &Path,
    strict: bool,
    require_resources: bool,
    registries: Vec<String>,
    exempt: Vec<String>,
) -> Result<()> {
    let timeout = Duration::from_millis(cli.hook_timeout_ms);
    let mut images = if registries.is_empty() { ImagePolicy::default() } else { ImagePolicy::new(registries, vec!["latest".into()]) };
    if require_resources {
        images = images.require_resources();
    }
    let non_root = if strict { RunAsNonRoot::strict() } else { RunAsNonRoot::new() };
    let mut security = ValidatingBinding::validating(non_root, timeout, FailurePolicy::FailClosed);
    let mut image_binding = ValidatingBinding::validating(images, timeout, FailurePolicy::FailClosed);
    for ns in &exempt {
        security = security.exempt_namespace(ns);
        image_binding = image_binding.exempt_namespace(ns);
    }
    let registry = Arc::new(Registry::new());
    for gvk in [Gvk::new("", "v1", "Pod"), Gvk::new("apps", "v1", "Deployment")] {
        registry.register(Kind::new(gvk).validating(security.clone()).validating(image_binding.clone()))?;
    }
    let api = InProcApi::in_memory(registry);

    let mut rows = Vec::new();
    for doc in manifest::load(file)? {
        let manifest::Doc::Object(mut obj) = doc else { continue };
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some("default".to_string());
        }
        let object = obj.key().to_string();
        let row = match api.dry_run(obj).await {
            Ok(d) => CheckRow { object, allowed: true, message: "allowed".into(), warnings: d.warnings },
            Err(e @ (ApiError::Admission(_) | ApiError::Schema(_) | ApiError::Invalid(_))) => {
                CheckRow { object, allowed: false, message: e.to_string(), warnings: Vec::new() }
            }
            Err(e) => return Err(e.into()),
        };
        rows.push(row);
    }

    match cli.output {
        Output::Human => {
            for r in &rows {
                println!("{} {}  {}", if r.allowed { "ALLOW" } else { "DENY " }, r.object, r.message);
                for w in &r.warnings {
                    println!("      warning: {w}");
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    let denied = rows.iter().filter(|r| !r.allowed).count();
    if denied > 0 {
        return Err(anyhow!("{denied} of {} object(s) denied", rows.len()));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Demo => {
            info!("demo invoked");
            run_demo(&cli).await
        }
        Commands::Apply { file, wait_secs } => {
            info!(file = %file.display(), "apply invoked");
            run_apply(&cli, file, *wait_secs).await
        }
        Commands::Check { file, strict, require_resources, registries, exempt } => {
            info!(file = %file.display(), strict, "check invoked");
            run_check(&cli, file, *strict, *require_resources, registries.clone(), exempt.clone()).await
        }
    }
}

fn render_age(created: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (chrono::Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
