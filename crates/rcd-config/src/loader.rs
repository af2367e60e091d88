//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError, ServiceKind};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "rcd.toml",
    "./config/config.toml",
    "./config/rcd.toml",
    "/etc/rcd/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    ///
    /// An explicitly given path that does not exist is an error; the search
    /// paths are only consulted when no path was given.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file()? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        } else {
            warn!("No configuration file found, using defaults");
        }

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ValidationError(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        if let Ok(path) = env::var("RCD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        // Service
        if let Ok(val) = env::var("RCD_SERVICE_KIND") {
            config.service.kind = val.parse::<ServiceKind>()?;
        }
        if let Ok(val) = env::var("RCD_ROUTES_FILE") {
            config.service.routes_file = val;
        }

        // Broker
        if let Ok(val) = env::var("RCD_BROKER_HOST") {
            config.broker.host = val;
        }
        if let Ok(val) = env::var("RCD_BROKER_PORT") {
            if let Ok(port) = val.parse() {
                config.broker.port = port;
            }
        }
        if let Ok(val) = env::var("RCD_BROKER_USERNAME") {
            config.broker.username = val;
        }
        if let Ok(val) = env::var("RCD_BROKER_PASSWORD") {
            config.broker.password = val;
        }
        if let Ok(val) = env::var("RCD_BROKER_PREFETCH") {
            if let Ok(prefetch) = val.parse() {
                config.broker.prefetch_count = prefetch;
            }
        }

        // Handler
        if let Ok(val) = env::var("RCD_PWSH_PROGRAM") {
            config.handler.program = val;
        }

        // Dispatch
        if let Ok(val) = env::var("RCD_MAX_CONCURRENT_COMMANDS") {
            if let Ok(limit) = val.parse() {
                config.dispatch.max_concurrent_commands = limit;
            }
        }

        // General
        if let Ok(val) = env::var("RCD_LOG_LEVEL") {
            config.log_level = val;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
