use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use docpipe::broker::{Broker, MemoryBroker};
use docpipe::capability::build_registry;
use docpipe::job::{JobFilter, JobId, JobStatus};
use docpipe::metrics::{CostModel, MetricsRecorder};
use docpipe::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use docpipe::observability::server::MetricsServer;
use docpipe::pipeline::{ExecutorSettings, PipelineExecutor};
use docpipe::service::{AnalysisService, ResultView};
use docpipe::settings::{Settings, validate_settings};
use docpipe::store::{JobStore, MemoryJobStore};
use docpipe::worker::WorkerPool;
use glob::glob;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Run {
            inputs,
            config,
            query,
            workers,
            store,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint: _,
        } => {
            let mut settings = read_settings(config.as_deref())?;
            if let Some(workers) = workers {
                settings.workers = workers;
            }
            if store.is_some() {
                settings.store.path = store;
            }
            check_settings(&settings, config.as_deref())?;
            run_jobs(
                settings,
                inputs,
                query.unwrap_or_default(),
                MetricsOutputs {
                    print: print_metrics,
                    json: metrics_json,
                    prometheus: metrics_prometheus,
                    listen: metrics_listen,
                },
            )
            .await
        }
        Commands::Status { id, store } => show_status(&id, store).await,
        Commands::Result { id, store } => show_result(&id, store).await,
        Commands::List {
            status,
            limit,
            store,
        } => list_jobs(status, limit, store).await,
        Commands::Stats { store } => show_stats(store).await,
        Commands::Validate { config } => validate_config_cmd(config),
        Commands::Stages { config } => list_stages(config.as_deref()),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "docpipe")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

fn read_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Ok(Settings::load(path)?),
        None => Ok(Settings::default()),
    }
}

/// Validates settings after command-line overrides were applied.
fn check_settings(settings: &Settings, path: Option<&Path>) -> Result<()> {
    let source = path.map_or_else(|| "<defaults>".to_string(), |path| path.display().to_string());
    let report = validate_settings(settings);
    for warning in &report.warnings {
        warn!(file = %source, "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %source, "{error_msg}");
        }
        bail!(
            "Settings validation failed with {} error(s): {}",
            report.errors.len(),
            report.errors.join("; ")
        );
    }
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = read_settings(path)?;
    check_settings(&settings, path)?;
    Ok(settings)
}

fn open_store(path: Option<&Path>) -> Result<MemoryJobStore> {
    match path {
        Some(path) => MemoryJobStore::open(path)
            .with_context(|| format!("Failed to open job store: {}", path.display())),
        None => Ok(MemoryJobStore::new()),
    }
}

fn open_existing_store(store: Option<PathBuf>) -> Result<MemoryJobStore> {
    let path = store.context("A persistent store is required; pass --store <FILE>")?;
    if !path.exists() {
        bail!("Job store '{}' not found", path.display());
    }
    open_store(Some(&path))
}

fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let matches =
            glob(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        let mut found = false;
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                resolved.push(path);
                found = true;
            }
        }
        if !found {
            bail!("No inputs matched pattern: {}", pattern);
        }
    }
    Ok(resolved)
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
    listen: Option<String>,
}

async fn run_jobs(
    settings: Settings,
    patterns: Vec<String>,
    query: String,
    outputs: MetricsOutputs,
) -> Result<()> {
    let inputs = expand_inputs(&patterns)?;

    let store: Arc<dyn JobStore> = Arc::new(open_store(settings.store.path.as_deref())?);
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(settings.broker.broker_settings()));
    let registry = build_registry(&settings.capabilities)?;
    info!(bindings = ?registry, "Capability registry ready");

    let collector = MetricsCollector::new();
    let recorder = MetricsRecorder::new(
        store.clone(),
        collector.clone(),
        CostModel::from(&settings.metrics),
    );
    let executor = Arc::new(PipelineExecutor::new(
        store.clone(),
        broker.clone(),
        registry,
        recorder,
        ExecutorSettings::from(&settings),
    ));
    let service = AnalysisService::new(store.clone(), broker.clone());

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &outputs.listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, collector.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &outputs.listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let mut ids = service.recover().await?;
    for input in &inputs {
        let id = service.submit(&input.display().to_string(), &query).await?;
        ids.push(id);
    }
    if ids.is_empty() {
        warn!("No inputs resolved and nothing to recover. Nothing to process.");
        return Ok(());
    }

    let pool = WorkerPool::spawn(settings.workers, executor, broker.clone());
    let waited = service.wait_for_terminal(&ids, POLL_INTERVAL).await;
    pool.shutdown().await;
    broker.close();
    let jobs = waited?;

    let mut failed = 0usize;
    for job in &jobs {
        match job.status {
            JobStatus::Completed => info!(
                job_id = %job.id,
                input = %job.input_ref,
                duration_seconds = job.duration_seconds.unwrap_or_default(),
                "Job completed"
            ),
            _ => {
                failed += 1;
                error!(
                    job_id = %job.id,
                    input = %job.input_ref,
                    error = job.error_message.as_deref().unwrap_or("unknown"),
                    "Job failed"
                );
            }
        }
        println!("{}\t{}\t{}", job.id, job.status, job.input_ref);
    }

    write_metrics(&collector, &outputs)?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if failed > 0 {
        bail!("{} of {} job(s) failed", failed, jobs.len());
    }
    Ok(())
}

fn write_metrics(collector: &MetricsCollector, outputs: &MetricsOutputs) -> Result<()> {
    if !(outputs.print || outputs.json.is_some() || outputs.prometheus.is_some()) {
        return Ok(());
    }
    let snapshot = collector.snapshot();
    if outputs.print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &outputs.json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &outputs.prometheus {
        create_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    Ok(())
}

fn parse_job_id(id: &str) -> Result<JobId> {
    id.parse()
        .with_context(|| format!("Invalid job id: {id}"))
}

fn service_over(store: MemoryJobStore) -> AnalysisService {
    AnalysisService::new(Arc::new(store), Arc::new(MemoryBroker::default()))
}

async fn show_status(id: &str, store: Option<PathBuf>) -> Result<()> {
    let id = parse_job_id(id)?;
    let service = service_over(open_existing_store(store)?);
    let job = service.get_status(id).await?;
    let stages = service.stage_results(id).await?;
    let metrics = service.metrics(id).await?;
    let body = serde_json::json!({
        "job": job,
        "stages": stages,
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn show_result(id: &str, store: Option<PathBuf>) -> Result<()> {
    let id = parse_job_id(id)?;
    let service = service_over(open_existing_store(store)?);
    let view = service.get_result(id).await?;
    match &view {
        ResultView::Completed { result, .. } => println!("{}", result.analysis),
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}

async fn list_jobs(status: Option<String>, limit: usize, store: Option<PathBuf>) -> Result<()> {
    let filter = match status {
        Some(status) => JobFilter::status(status.parse::<JobStatus>().map_err(|err| anyhow!(err))?),
        None => JobFilter::default(),
    };
    let service = service_over(open_existing_store(store)?);
    for job in service.list_jobs(filter, limit).await? {
        println!(
            "{}\t{}\t{}\t{}",
            job.id,
            job.status,
            job.created_at.to_rfc3339(),
            job.input_ref
        );
    }
    Ok(())
}

async fn show_stats(store: Option<PathBuf>) -> Result<()> {
    let service = service_over(open_existing_store(store)?);
    let stats = service.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn validate_config_cmd(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load(&config_path)?;
    let report = validate_settings(&settings);

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }

    if report.is_ok() {
        build_registry(&settings.capabilities)?;
        info!(file = %config_path.display(), "Settings validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Settings validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn list_stages(config: Option<&Path>) -> Result<()> {
    let settings = load_settings(config)?;
    let registry = build_registry(&settings.capabilities)?;
    println!("Pipeline stages:");
    for (stage, binding) in registry.stages() {
        let empty = if binding.empty_output_valid {
            " (empty output allowed)"
        } else {
            ""
        };
        println!(
            "{}. {} -> {}{}",
            stage.index() + 1,
            stage,
            binding.capability.variant(),
            empty
        );
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "docpipe", version, about = "Multi-stage document analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit documents and process them until every job is terminal.
    Run {
        #[arg(required = true, value_name = "INPUT_GLOB")]
        inputs: Vec<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Status {
        id: String,
        #[arg(long)]
        store: Option<PathBuf>,
    },
    Result {
        id: String,
        #[arg(long)]
        store: Option<PathBuf>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Summarise a persistent store: counts per status, average duration, token totals.
    Stats {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    Validate {
        config: PathBuf,
    },
    Stages {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
