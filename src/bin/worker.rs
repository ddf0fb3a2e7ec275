//! Triggerflow Worker
//!
//! Runs the trigger execution engine for one namespace. Namespace documents
//! are read from a NATS key-value bucket and events are consumed from the
//! namespace's event source. Stops when the root workflow completes, a
//! `terminate` action fires, or on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use triggerflow::engine::{HttpTaskInvoker, LocalTaskInvoker, NatsDocumentStore};
use triggerflow::{BrokerResolver, HandlerRegistry, TaskInvoker, TriggerflowConfig, Worker};

#[derive(Parser)]
#[command(name = "triggerflow-worker")]
#[command(about = "Triggerflow Worker - Execute the triggers of one namespace")]
#[command(version = "1.0")]
struct Cli {
    /// Namespace to run
    #[arg(long, env = "TRIGGERFLOW_NAMESPACE")]
    namespace: String,

    /// Configuration file (defaults to ./triggerflow.toml if present)
    #[arg(long)]
    config: Option<String>,

    /// NATS server URL, overriding the configuration
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Complete Task states in-process instead of posting them to their Resource
    #[arg(long)]
    local_tasks: bool,

    /// Timeout for task requests, in seconds
    #[arg(long, default_value_t = 30)]
    task_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TriggerflowConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.nats_url {
        config.nats.url = url;
    }

    // RUST_LOG wins over the configured level
    let level = if cli.verbose { "debug".to_string() } else { config.log_level.clone() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Triggerflow worker for namespace {}", cli.namespace);
    info!("📡 NATS: {} (bucket {})", config.nats.url, config.nats.bucket);

    let store = NatsDocumentStore::connect(&config.nats.url, &config.nats.bucket).await?;

    let invoker: Arc<dyn TaskInvoker> = if cli.local_tasks {
        Arc::new(LocalTaskInvoker)
    } else {
        Arc::new(HttpTaskInvoker::new(Duration::from_secs(cli.task_timeout))?)
    };
    let registry = HandlerRegistry::with_task_invoker(invoker);
    let resolver = BrokerResolver::new().with_stream_prefix(config.nats.stream_prefix.clone());

    let mut worker = Worker::new(cli.namespace.clone(), Arc::new(store))
        .with_registry(Arc::new(registry))
        .with_resolver(resolver)
        .with_settings(config.worker.clone());

    let cancel = worker.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping worker");
            cancel.cancel();
        }
    });

    let status = worker.run().await?;
    info!(
        "✅ Namespace {}: {} events, {} triggers fired, {} handler failures in {:.2}s",
        status.namespace,
        status.events_processed,
        status.triggers_fired,
        status.handler_failures,
        status.elapsed_seconds
    );

    Ok(())
}
