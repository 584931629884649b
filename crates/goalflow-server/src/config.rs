//! Configuration for the Goalflow server
//!
//! Settings are layered with the `config` crate: serde defaults, then an
//! optional file named by `GOALFLOW_CONFIG`, then `GOALFLOW_*` environment
//! variables. Nested keys use a double underscore, for example
//! `GOALFLOW_ENGINE__RETRY__MAX_RETRIES=3`.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use goalflow_core::EngineConfig;
use goalflow_monitoring::MonitoringConfig;
use goalflow_state_inmemory::WriteBehindConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use tracing::info;

use crate::error::{ServerError, ServerResult};

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_VAR: &str = "GOALFLOW_CONFIG";

const ENV_PREFIX: &str = "GOALFLOW";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Prometheus scrape address
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    /// Base URL async steps call back on. Derived from host and port when
    /// unset.
    #[serde(default)]
    pub webhook_base_url: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Snapshot store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key prefix for flow snapshots
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_save_timeout_ms")]
    pub save_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    "goalflow".to_string()
}

fn default_workers() -> usize {
    WriteBehindConfig::default().workers
}

fn default_queue_size() -> usize {
    WriteBehindConfig::default().queue_size
}

fn default_save_timeout_ms() -> u64 {
    WriteBehindConfig::default().save_timeout_ms
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            save_timeout_ms: default_save_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn write_behind(&self) -> WriteBehindConfig {
        WriteBehindConfig {
            workers: self.workers,
            queue_size: self.queue_size,
            save_timeout_ms: self.save_timeout_ms,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_json: false,
            metrics_addr: None,
            webhook_base_url: None,
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> ServerResult<Self> {
        let path = env::var(CONFIG_PATH_VAR).ok();
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an explicit file path plus the environment
    pub fn load_from(path: Option<&str>) -> ServerResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Self::from_builder(builder)
    }

    pub(crate) fn from_builder(builder: ConfigBuilder<DefaultState>) -> ServerResult<Self> {
        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine or store cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        self.engine
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        self.store.write_behind().validate()?;
        if self.store.namespace.is_empty() {
            return Err(ServerError::ConfigError(
                "store namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine settings with the server-level overrides applied
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        engine.webhook_base_url = self
            .webhook_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.callback_host(), self.port));
        engine.namespace = self.store.namespace.clone();
        engine
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        MonitoringConfig {
            service_name: "goalflow-server".to_string(),
            log_filter: self.log_level.clone(),
            json: self.log_json,
            metrics_addr: self.metrics_addr,
        }
    }

    fn callback_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            host => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> ServerResult<ServerConfig> {
        ServerConfig::from_builder(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.engine.retry.max_retries, 10);
        assert_eq!(config.store.workers, 4);
        assert_eq!(
            config.engine_config().webhook_base_url,
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_file_values() {
        let config = from_toml(
            r#"
            port = 9000
            webhook_base_url = "https://flows.example.com"

            [engine.retry]
            max_retries = 3
            backoff_type = "fixed"

            [store]
            namespace = "staging"
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine.retry.max_retries, 3);
        assert_eq!(config.store.write_behind().workers, 2);

        let engine = config.engine_config();
        assert_eq!(engine.webhook_base_url, "https://flows.example.com");
        assert_eq!(engine.namespace, "staging");
    }

    #[test]
    fn test_rejects_backoff_above_max() {
        let err = from_toml(
            r#"
            [engine.retry]
            backoff_ms = 5000
            max_backoff_ms = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_zero_step_timeout() {
        let err = from_toml("[engine]\nstep_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = from_toml("[store]\nworkers = 0").unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    #[test]
    fn test_environment_overrides() {
        env::set_var("GOALFLOW_PORT", "9191");
        env::set_var("GOALFLOW_ENGINE__STEP_TIMEOUT_MS", "1234");
        let config = ServerConfig::load_from(None);
        env::remove_var("GOALFLOW_PORT");
        env::remove_var("GOALFLOW_ENGINE__STEP_TIMEOUT_MS");

        let config = config.unwrap();
        assert_eq!(config.port, 9191);
        assert_eq!(config.engine.step_timeout_ms, 1234);
    }
}
