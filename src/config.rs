// Layered configuration for the Triggerflow binaries

//! # Configuration
//!
//! Settings are resolved in layers, later layers overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a `.env` file in the working directory (loaded into the environment)
//! 3. an optional TOML/YAML/JSON file (`triggerflow.toml` or `--config`)
//! 4. environment variables such as `TRIGGERFLOW__API__ENDPOINT` or
//!    `TRIGGERFLOW__WORKER__IDLE_BACKOFF_MS`
//!
//! ```toml
//! log_level = "debug"
//!
//! [api]
//! endpoint = "http://127.0.0.1:8080"
//! user = "admin"
//! password = "s3cret"
//!
//! [nats]
//! url = "nats://localhost:4222"
//! bucket = "triggerflow"
//!
//! [worker]
//! idle_backoff_ms = 100
//! refresh_every = 50
//! max_idle_polls = 0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TriggerflowError};

/// File looked up when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "triggerflow.toml";

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerflowConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TriggerflowConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            nats: NatsConfig::default(),
            worker: WorkerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Trigger API (persistence transport) access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user: String::new(),
            password: String::new(),
        }
    }
}

/// NATS connection used for event sources and document storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Key-value bucket holding namespace documents
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Prefix of the JetStream streams created for event sources
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            bucket: default_bucket(),
            stream_prefix: default_stream_prefix(),
        }
    }
}

/// Worker loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pause after an empty or failed poll
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Reload the trigger set every N poll cycles; 0 disables reloading
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u64,

    /// Stop after this many consecutive empty polls; 0 runs until stopped
    #[serde(default)]
    pub max_idle_polls: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: default_idle_backoff_ms(),
            refresh_every: default_refresh_every(),
            max_idle_polls: 0,
        }
    }
}

impl WorkerConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_bucket() -> String {
    "triggerflow".to_string()
}

fn default_stream_prefix() -> String {
    "TRIGGERFLOW".to_string()
}

fn default_idle_backoff_ms() -> u64 {
    100
}

fn default_refresh_every() -> u64 {
    50
}

impl TriggerflowConfig {
    /// Load configuration from defaults, `.env`, an optional file and the environment
    ///
    /// `path` may start with `~`. Without a path, [`DEFAULT_CONFIG_FILE`] is
    /// used if it exists.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();
        Self::build(path, true)
    }

    fn build(path: Option<&str>, with_environment: bool) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&TriggerflowConfig::default()).map_err(config_error)?);

        match path {
            Some(path) => {
                let expanded = shellexpand::tilde(path);
                builder = builder.add_source(config::File::with_name(&expanded).required(true));
            }
            None => {
                builder = builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
        }

        if with_environment {
            builder = builder.add_source(
                config::Environment::with_prefix("TRIGGERFLOW")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(config_error)
    }
}

fn config_error(e: config::ConfigError) -> TriggerflowError {
    TriggerflowError::Config(e.to_string())
}
