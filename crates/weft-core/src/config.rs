use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("WEFT")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("WEFT")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("database.url", "postgres://localhost/weft")?
        .set_default("database.max_connections", 10)?
        .set_default("database.min_connections", 2)?
        .set_default("store.backend", "memory")?
        .set_default("engine.default_wait_timeout_secs", 3600)?
        .set_default("engine.max_concurrent_children", 0)?
        .set_default("engine.infra_retry_attempts", 5)?
        .set_default("engine.infra_retry_initial_delay_ms", 100)?
        .set_default("scheduler.enabled", true)?
        .set_default("scheduler.poll_interval_secs", 1)?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("executor.endpoint", "http://localhost:9000/execute")?
        .set_default("executor.request_timeout_secs", 300)
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }

    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Which state store backend the engine persists to
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Workflow engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Used by wait tasks that declare no timeout
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
    /// Upper bound on concurrently running children per parent (0 = unlimited)
    #[serde(default)]
    pub max_concurrent_children: usize,
    #[serde(default = "default_infra_retry_attempts")]
    pub infra_retry_attempts: u32,
    #[serde(default = "default_infra_retry_initial_delay_ms")]
    pub infra_retry_initial_delay_ms: u64,
}

impl EngineConfig {
    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }

    pub fn infra_retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.infra_retry_initial_delay_ms)
    }

    pub fn with_default_wait_timeout(mut self, secs: u64) -> Self {
        self.default_wait_timeout_secs = secs;
        self
    }

    pub fn with_max_concurrent_children(mut self, max: usize) -> Self {
        self.max_concurrent_children = max;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_secs: default_wait_timeout_secs(),
            max_concurrent_children: 0,
            infra_retry_attempts: default_infra_retry_attempts(),
            infra_retry_initial_delay_ms: default_infra_retry_initial_delay_ms(),
        }
    }
}

fn default_wait_timeout_secs() -> u64 {
    3600
}

fn default_infra_retry_attempts() -> u32 {
    5
}

fn default_infra_retry_initial_delay_ms() -> u64 {
    100
}

/// Cron scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    1
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Remote agent/tool executor endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ExecutorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_creation() {
        let config = DatabaseConfig::new("postgres://localhost".to_string()).with_pool_size(5, 20);

        assert_eq!(config.url, "postgres://localhost");
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 20);
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default()
            .with_host("127.0.0.1".to_string())
            .with_port(3000);
        assert_eq!(config.address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default().with_max_concurrent_children(4);
        assert_eq!(config.default_wait_timeout(), Duration::from_secs(3600));
        assert_eq!(config.max_concurrent_children, 4);
        assert_eq!(config.infra_retry_initial_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_load_from_env_defaults() {
        let config = AppConfig::load_from_env("WEFT_TEST_UNSET_PREFIX").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.server.port, 8080);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.executor.request_timeout(), Duration::from_secs(300));
    }
}
