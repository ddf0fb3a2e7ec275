//! Triggerflow CLI
//!
//! Compiles workflow definitions into triggers and manages namespaces through
//! the trigger API configured in `[api]`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use triggerflow::engine::compiler::INIT_EVENT;
use triggerflow::{
    Credentials, EventSource, InMemoryDocumentStore, LocalTransport, StateMachineCompiler, StateMachineDefinition,
    StoreMode, TriggerStore, TriggerflowConfig,
};

#[derive(Parser)]
#[command(name = "triggerflow")]
#[command(about = "Triggerflow CLI - Compile workflows and manage namespaces")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./triggerflow.toml if present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a workflow definition and print the resulting triggers
    Compile {
        /// Path to the workflow definition (JSON)
        file: String,

        /// Namespace the triggers belong to
        #[arg(long, default_value = "local")]
        namespace: String,

        /// Subject of the event that starts the workflow
        #[arg(long, default_value = INIT_EVENT)]
        init_event: String,

        /// Commit the triggers through the trigger API
        #[arg(long)]
        commit: bool,
    },

    /// Create a namespace with a NATS event source
    CreateNamespace {
        name: String,

        /// Global context as a JSON object
        #[arg(long)]
        global_context: Option<String>,

        /// Event subject (defaults to the namespace name)
        #[arg(long)]
        subject: Option<String>,
    },

    /// Delete a namespace and everything in it
    DeleteNamespace {
        name: String,

        /// Confirm the deletion
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TriggerflowConfig::load(cli.config.as_deref())?;

    let level = if cli.verbose { "debug".to_string() } else { config.log_level.clone() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Compile {
            file,
            namespace,
            init_event,
            commit,
        } => compile(&config, &file, &namespace, &init_event, commit).await?,

        Commands::CreateNamespace {
            name,
            global_context,
            subject,
        } => {
            let global_context: Option<Value> = global_context
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--global-context must be JSON")?;
            let source = EventSource::nats(
                name.clone(),
                config.nats.url.clone(),
                subject.unwrap_or_else(|| name.clone()),
            );

            let mut store = TriggerStore::from_config(&config.api, StoreMode::Remote)?;
            store.create_namespace(&name, global_context, Some(source)).await?;
            info!("✅ Namespace {} created", name);
        }

        Commands::DeleteNamespace { name, confirm } => {
            if !confirm {
                error!("❌ Delete operation requires --confirm flag for safety");
                return Ok(());
            }
            let mut store = TriggerStore::from_config(&config.api, StoreMode::Remote)?;
            store.delete_namespace(Some(&name)).await?;
            info!("✅ Namespace {} deleted", name);
        }
    }

    Ok(())
}

async fn compile(
    config: &TriggerflowConfig,
    file: &str,
    namespace: &str,
    init_event: &str,
    commit: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let definition = StateMachineDefinition::from_json(&raw)?;

    let mut store = if commit {
        TriggerStore::from_config(&config.api, StoreMode::Cached)?
    } else {
        // dry run: nothing leaves the process
        let transport = Arc::new(LocalTransport::new(Arc::new(InMemoryDocumentStore::new())));
        TriggerStore::with_transport(Credentials::new("local", "local")?, transport, StoreMode::Cached)
    };
    store.target_namespace(namespace);

    let mut compiler = StateMachineCompiler::new();
    let completion = compiler.compile(&mut store, &definition, init_event).await?;

    let triggers = store.list_cached_triggers()?;
    if triggers.is_empty() {
        bail!("{} produced no triggers", file);
    }
    println!("{}", serde_json::to_string_pretty(&triggers)?);
    info!("🧩 {} triggers, completion event {}", triggers.len(), completion);

    if commit {
        store.commit_cached_triggers().await?;
        info!("✅ Committed {} triggers to {}", triggers.len(), namespace);
    }
    Ok(())
}
