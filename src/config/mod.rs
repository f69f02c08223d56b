//! Configuration Module
//!
//! Provides TOML-based configuration for HubMQ with support for:
//! - Server settings (bind address, workers)
//! - Connection and queue limits
//! - Session timing
//! - MQTT feature flags
//! - Authentication, ACL and pre-shared keys
//! - Environment variable overrides (HUBMQ__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;
use crate::session::OverflowPolicy;
use crate::topic::MAX_TOPIC_LEVELS;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    pub storage: StorageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Number of worker threads (0 = auto)
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            workers: 0,
        }
    }
}

/// Connection and queue limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Largest accepted remaining length in bytes (fixed header excluded)
    pub max_packet_size: usize,
    /// Frames buffered per connection before the overflow policy applies
    pub outbound_queue_capacity: usize,
    /// block | drop_oldest | drop_newest
    pub overflow_policy: OverflowPolicy,
    /// How long a publish may wait for room under `block`
    #[serde(with = "humantime_serde")]
    pub block_timeout: Duration,
    /// Messages held for an offline persistent session
    pub max_queued_messages: usize,
    /// Resend interval for unacknowledged QoS 1/2 messages (0s disables)
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            max_connections: broker.max_connections,
            max_packet_size: broker.max_packet_size,
            outbound_queue_capacity: broker.outbound_queue_capacity,
            overflow_policy: broker.overflow_policy,
            block_timeout: broker.block_timeout,
            max_queued_messages: broker.max_queued_messages,
            retry_interval: broker.retry_interval,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive multiplier before a silent client is dropped
    pub keep_alive_grace: f64,
    /// Time allowed between accept and CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_grace: 1.5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level granted to subscriptions (0, 1, or 2)
    pub max_qos: u8,
    /// Store retained messages
    pub retain_available: bool,
    /// Assign an id to clean-session clients with an empty one
    pub allow_empty_client_id: bool,
    /// Use the CONNECT username as the client id
    pub username_as_client_id: bool,
    /// Deepest topic name or filter accepted (0 = built-in ceiling)
    pub max_topic_levels: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            allow_empty_client_id: true,
            username_as_client_id: false,
            max_topic_levels: 128,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow anonymous connections when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
    /// Pre-shared keys by identity
    pub psk: Vec<PskConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
            psk: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// Pre-shared key entry
#[derive(Debug, Clone, Deserialize)]
pub struct PskConfig {
    pub identity: String,
    /// Server hint the key is bound to (any hint when unset)
    #[serde(default)]
    pub hint: Option<String>,
    /// Base64-encoded key
    pub key: String,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether ACL is enabled
    pub enabled: bool,
    /// ACL roles
    pub roles: Vec<AclRole>,
    /// Default permissions for users without explicit role (including anonymous)
    pub default: AclPermissions,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    /// Role name
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    /// Topic patterns that can be published to
    pub publish: Vec<String>,
    /// Topic patterns that can be subscribed to
    pub subscribe: Vec<String>,
}

/// Session storage backend
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Only "memory" is available
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `HUBMQ__` prefix with double underscores for nesting:
    ///    - `HUBMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `HUBMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `HUBMQ__AUTH__ENABLED=true` overrides `auth.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.workers", 0)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.outbound_queue_capacity", 1024)?
            .set_default("limits.overflow_policy", "block")?
            .set_default("limits.block_timeout", "500ms")?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.retry_interval", "30s")?
            .set_default("session.keep_alive_grace", 1.5)?
            .set_default("session.connect_timeout", "10s")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.allow_empty_client_id", true)?
            .set_default("mqtt.username_as_client_id", false)?
            .set_default("mqtt.max_topic_levels", 128)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?
            .set_default("storage.backend", "memory")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("HUBMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.mqtt.max_topic_levels > MAX_TOPIC_LEVELS {
            return Err(ConfigError::Validation(format!(
                "max_topic_levels must not exceed {}",
                MAX_TOPIC_LEVELS
            )));
        }
        if self.session.keep_alive_grace < 1.0 || !self.session.keep_alive_grace.is_finite() {
            return Err(ConfigError::Validation(
                "keep_alive_grace must be at least 1.0".to_string(),
            ));
        }
        if self.limits.outbound_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.storage.backend != "memory" {
            return Err(ConfigError::Validation(format!(
                "unknown storage backend '{}'",
                self.storage.backend
            )));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();
            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            outbound_queue_capacity: self.limits.outbound_queue_capacity,
            overflow_policy: self.limits.overflow_policy,
            block_timeout: self.limits.block_timeout,
            max_queued_messages: self.limits.max_queued_messages,
            retry_interval: self.limits.retry_interval,
            keep_alive_grace: self.session.keep_alive_grace,
            connect_timeout: self.session.connect_timeout,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            allow_empty_client_id: self.mqtt.allow_empty_client_id,
            allow_anonymous: !self.auth.enabled || self.auth.allow_anonymous,
            username_as_client_id: self.mqtt.username_as_client_id,
            max_topic_levels: self.mqtt.max_topic_levels,
        }
    }
}
