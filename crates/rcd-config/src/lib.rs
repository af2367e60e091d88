//! Remote Command Dispatcher Configuration
//!
//! This crate provides TOML-based service configuration with environment
//! variable override support, and the routing model that maps a service
//! identity to the exchanges and queues it consumes from and publishes to.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

mod loader;
pub mod routes;

pub use loader::ConfigLoader;
pub use routes::{
    ConsumeRoute, ExchangeType, PublishRoute, PublishRoutes, RouteRole, RoutingTable,
    ServiceRoutes,
};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Routes were not provided for service '{0}'")]
    MissingService(String),
}

/// What a service instance does on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Publisher,
    Consumer,
    All,
}

impl ServiceKind {
    pub fn consumes(&self) -> bool {
        matches!(self, ServiceKind::Consumer | ServiceKind::All)
    }

    pub fn publishes(&self) -> bool {
        matches!(self, ServiceKind::Publisher | ServiceKind::All)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Publisher => "publisher",
            ServiceKind::Consumer => "consumer",
            ServiceKind::All => "all",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publisher" => Ok(ServiceKind::Publisher),
            "consumer" => Ok(ServiceKind::Consumer),
            "all" => Ok(ServiceKind::All),
            other => Err(ConfigError::ValidationError(format!(
                "Wrong service kind '{}'. Acceptable values are: publisher, consumer, all",
                other
            ))),
        }
    }
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSection,
    pub broker: BrokerConfig,
    pub handler: HandlerConfig,
    pub dispatch: DispatchConfig,

    /// Default log filter when RUST_LOG is not set
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceSection::default(),
            broker: BrokerConfig::default(),
            handler: HandlerConfig::default(),
            dispatch: DispatchConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Service identity and role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub kind: ServiceKind,
    /// Path to the JSON routes file
    pub routes_file: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            kind: ServiceKind::Consumer,
            routes_file: "routes.json".to_string(),
        }
    }
}

/// AMQP broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Unacknowledged deliveries the broker may push at once
    pub prefetch_count: u16,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            prefetch_count: 100,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for the configured broker. Credentials and vhost are
    /// percent-encoded, so reserved characters survive the round trip.
    pub fn uri(&self) -> String {
        let vhost = if self.virtual_host == "/" {
            "/"
        } else {
            self.virtual_host.trim_start_matches('/')
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(vhost)
        )
    }
}

/// Remote command runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// PowerShell executable
    pub program: String,
    /// Remote account used for the session
    pub username: String,
    /// Private key used for the session
    pub key_path: String,
    /// Prefix of the error-notification category ("<source> error")
    pub error_source: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            program: "pwsh".to_string(),
            username: "administrator".to_string(),
            key_path: String::new(),
            error_source: "__PowerShell".to_string(),
        }
    }
}

impl HandlerConfig {
    pub fn error_category(&self) -> String {
        format!("{} error", self.error_source)
    }
}

/// Dispatch fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent remote command invocations across all jobs (0 = unbounded)
    pub max_concurrent_commands: usize,
}

impl DispatchConfig {
    pub fn command_limit(&self) -> Option<usize> {
        (self.max_concurrent_commands > 0).then_some(self.max_concurrent_commands)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::ValidationError("broker.host is empty".to_string()));
        }
        if self.broker.prefetch_count == 0 {
            return Err(ConfigError::ValidationError(
                "broker.prefetch_count must be positive".to_string(),
            ));
        }
        if self.handler.program.is_empty() {
            return Err(ConfigError::ValidationError("handler.program is empty".to_string()));
        }
        if self.service.routes_file.is_empty() {
            return Err(ConfigError::ValidationError(
                "service.routes_file is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Remote Command Dispatcher Configuration
# Environment variables (RCD_*) override these settings

log_level = "info"

[service]
kind = "consumer"  # publisher, consumer, or all
routes_file = "routes.json"

[broker]
host = "localhost"
port = 5672
username = "guest"
password = "guest"
virtual_host = "/"
prefetch_count = 100
reconnect_delay_secs = 5
connect_timeout_secs = 10

[handler]
program = "pwsh"
username = "administrator"
key_path = "/etc/rcd/id_rsa"
error_source = "__PowerShell"

[dispatch]
max_concurrent_commands = 0  # 0 = unbounded
"#
        .to_string()
    }
}
