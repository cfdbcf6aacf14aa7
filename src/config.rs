//! File-based configuration for the message bus
//!
//! A TOML file names the broker, the queue and the retry budget. Credentials
//! may be given inline or through environment variables; environment variables
//! are resolved when the file is turned into a [`SupervisorConfig`].
//!
//! ```toml
//! [broker]
//! host = "rabbitmq.internal"
//! port = 5671
//! user_env = "WHARF_RABBITMQ_USER"
//! password_env = "WHARF_RABBITMQ_PASSWORD"
//! vhost = "wharf"
//! disable_ssl = false
//!
//! [queue]
//! name = "wharf-events"
//!
//! [retry]
//! max_attempts = 5
//! delay_secs = 3
//! ```

use crate::supervisor::{RetryPolicy, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable identifying this process instance
pub const INSTANCE_ENV_VAR: &str = "WHARF_INSTANCE";

/// Default AMQP port without TLS
pub const AMQP_PORT: u16 = 5672;

/// Default AMQP port with TLS
pub const AMQPS_PORT: u16 = 5671;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    pub broker: BrokerSection,
    pub queue: QueueSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    /// Defaults to 5671 with TLS, 5672 without
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Environment variable containing the username (wins over `user`)
    pub user_env: Option<String>,
    /// Environment variable containing the password (wins over `password`)
    pub password_env: Option<String>,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub disable_ssl: bool,
}

/// Queue section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    pub name: String,
}

/// Retry section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

fn default_max_attempts() -> u64 {
    5
}

fn default_delay_secs() -> u64 {
    3
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that TOML typing cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.port == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "broker.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "queue.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Port to dial, falling back to the scheme default
    pub fn effective_port(&self) -> u16 {
        self.broker.port.unwrap_or(if self.broker.disable_ssl {
            AMQP_PORT
        } else {
            AMQPS_PORT
        })
    }

    /// Resolve the username, preferring the environment variable when named
    pub fn resolve_user(&self) -> Result<String, ConfigError> {
        Self::resolve_secret(
            self.broker.user_env.as_deref(),
            self.broker.user.as_ref(),
            "broker.user",
        )
    }

    /// Resolve the password, preferring the environment variable when named
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        Self::resolve_secret(
            self.broker.password_env.as_deref(),
            self.broker.password.as_ref(),
            "broker.password",
        )
    }

    fn resolve_secret(
        env_name: Option<&str>,
        inline: Option<&String>,
        field: &str,
    ) -> Result<String, ConfigError> {
        match (env_name, inline) {
            (Some(name), _) => Self::get_env_var_required(name),
            (None, Some(value)) => Ok(value.clone()),
            (None, None) => Err(ConfigError::InvalidConfig(format!(
                "{field} or {field}_env must be set"
            ))),
        }
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Build the in-memory supervisor configuration, resolving credentials
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        Ok(SupervisorConfig {
            host: self.broker.host.clone(),
            port: self.effective_port(),
            user: self.resolve_user()?,
            password: self.resolve_password()?,
            queue: self.queue.name.clone(),
            vhost: self.broker.vhost.clone(),
            disable_ssl: self.broker.disable_ssl,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                delay: Duration::from_secs(self.retry.delay_secs),
            },
        })
    }
}

/// Read the instance identifier from [`INSTANCE_ENV_VAR`]
pub fn instance_id_from_env() -> Result<String, ConfigError> {
    std::env::var(INSTANCE_ENV_VAR)
        .map_err(|_| ConfigError::EnvVarNotFound(INSTANCE_ENV_VAR.to_string()))
}
