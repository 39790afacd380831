//! Stevedore Worker
//!
//! Runs every configured group against SQS (or an in-memory backend with
//! `--in-memory`). Each configured queue gets a logging worker unless the
//! embedding application registers its own.
//!
//! Signals:
//! - SIGUSR1: stop fetching, keep in-flight work running
//! - SIGTERM / Ctrl+C: stop fetching, wait up to `timeout` seconds, abort the rest

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use sv_common::logging::init_logging;
use sv_common::QueueAttributes;
use sv_config::{AppConfig, ConfigLoader, QueueEntry};
use sv_dispatch::{Body, BodyWorker, Context, DispatchOptions, Launcher, WorkerDefinition, WorkerOptions, WorkerRegistry};
use sv_queue::sqs::SqsQueueClient;
use sv_queue::{InMemoryQueueClient, QueueClient};

#[derive(Parser, Debug)]
#[command(name = "sv-worker")]
#[command(about = "Stevedore worker process")]
struct Args {
    /// Config file; the standard search paths are used when unset
    #[arg(short = 'C', long, env = "STEVEDORE_CONFIG")]
    config: Option<PathBuf>,

    /// Processors of the default group
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Queue for the default group, `name` or `name,weight`; repeatable
    #[arg(short, long = "queue", value_name = "QUEUE[,WEIGHT]")]
    queues: Vec<String>,

    /// Hard shutdown timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "STEVEDORE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Use the in-memory backend instead of SQS
    #[arg(long)]
    in_memory: bool,
}

/// Logs every message it receives
struct LoggingWorker {
    queue: String,
}

#[async_trait]
impl BodyWorker for LoggingWorker {
    async fn perform(&self, body: &Body) -> anyhow::Result<()> {
        for item in body.items() {
            info!(queue = %self.queue, body = ?item, "Received job");
        }
        Ok(())
    }
}

fn parse_queue_arg(arg: &str) -> Result<QueueEntry> {
    match arg.split_once(',') {
        Some((name, weight)) => {
            let weight: usize = weight
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid weight in queue argument: {arg}"))?;
            Ok(QueueEntry::Pair(name.trim().to_string(), weight))
        }
        None => Ok(QueueEntry::Name(arg.trim().to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging("sv-worker");

    let args = Args::parse();
    info!("Starting Stevedore worker");

    let cli_queues = args
        .queues
        .iter()
        .map(|arg| parse_queue_arg(arg))
        .collect::<Result<Vec<_>>>()?;

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load_with(|config| {
        if let Some(concurrency) = args.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout) = args.timeout {
            config.timeout = timeout;
        }
        if !cli_queues.is_empty() {
            config.queues = cli_queues;
        }
    })?;

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()?;
        info!(port, "Prometheus metrics listener started");
    }

    let client = build_client(&config, args.in_memory).await?;

    let registry = Arc::new(WorkerRegistry::new());
    for group in config.groups()? {
        for queue in group.unique_queues() {
            let worker_queue = queue.clone();
            registry.register_worker(WorkerDefinition::from_body_worker(
                format!("LoggingWorker[{queue}]"),
                WorkerOptions::new(queue).auto_delete(true),
                move || LoggingWorker {
                    queue: worker_queue.clone(),
                },
            ))?;
        }
    }

    let ctx = Arc::new(Context::new(client, registry).with_options(DispatchOptions::from_config(&config)));
    let launcher = Launcher::from_config(ctx, &config)?;
    launcher.start().await?;

    info!(
        groups = launcher.managers().len(),
        timeout_secs = config.timeout,
        "Stevedore worker started"
    );

    if let Err(e) = wait_for_stop(&launcher).await {
        error!(error = %e, "Signal handling failed, shutting down");
    }

    launcher.stop_now(Duration::from_secs(config.timeout)).await;
    info!("Stevedore worker shutdown complete");
    Ok(())
}

async fn build_client(config: &AppConfig, in_memory: bool) -> Result<Arc<dyn QueueClient>> {
    if in_memory {
        info!("Using in-memory queue backend");
        let client = InMemoryQueueClient::new().with_wait_time_seconds(config.sqs.wait_time_seconds as u64);
        for group in config.groups()? {
            for queue in group.unique_queues() {
                client.create_queue(&queue, QueueAttributes::default().visibility_timeout);
            }
        }
        return Ok(Arc::new(client));
    }

    let region = Some(config.sqs.region.clone()).filter(|r| !r.is_empty());
    let endpoint = Some(config.sqs.endpoint_url.clone()).filter(|e| !e.is_empty());
    let client = SqsQueueClient::connect(region, endpoint)
        .await
        .with_wait_time_seconds(config.sqs.wait_time_seconds)
        .with_attribute_cache(config.cache_visibility_timeout);
    Ok(Arc::new(client))
}

/// Resolves on SIGTERM or Ctrl+C. SIGUSR1 quiets the launcher and keeps waiting.
#[cfg(unix)]
async fn wait_for_stop(launcher: &Launcher) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quiet = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating shutdown");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                return Ok(());
            }
            _ = quiet.recv() => {
                info!("Received SIGUSR1, no longer fetching");
                launcher.quiet().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop(_launcher: &Launcher) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating shutdown");
    Ok(())
}
