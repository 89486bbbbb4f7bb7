//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, an optional YAML file,
//! `TURNSTILE__`-prefixed environment variables, and finally the flat
//! variable names used by older deployments (`RATE_LIMIT_IP`, `REDIS_HOST`, ...).

use config::{Config, Environment, File, FileFormat};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Admission limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter store selection and connection parameters
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Admission limits applied by the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per window for a client IP
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,

    /// Requests allowed per window for an API token without an override
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// How long an identity stays blocked after exceeding its limit
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,

    /// Per-token limit overrides installed at startup
    #[serde(default)]
    pub token_limits: HashMap<String, u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            token_limit: default_token_limit(),
            block_duration_secs: default_block_duration_secs(),
            token_limits: HashMap::new(),
        }
    }
}

impl LimitsConfig {
    /// Block duration as a [`Duration`].
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

fn default_ip_limit() -> u64 {
    10
}

fn default_token_limit() -> u64 {
    100
}

fn default_block_duration_secs() -> u64 {
    300
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process table, state is local to this process
    Memory,
    /// Shared Redis instance, falls back to memory when unreachable
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Interval of the in-process store's expiry sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default)]
    pub redis: RedisSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sweep_interval_ms: default_sweep_interval_ms(),
            redis: RedisSettings::default(),
        }
    }
}

impl StorageConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Full connection URL; when set, host/port/password/db are ignored
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Bound on client setup plus the initial PING
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on every individual command round trip
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisSettings {
    /// Connection parameters: `url` parsed when set, otherwise the individual
    /// fields taken as-is (the password is never URL-encoded).
    pub fn connection_info(&self) -> RedisResult<ConnectionInfo> {
        if let Some(url) = &self.url {
            return url.as_str().into_connection_info();
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    2000
}

/// Flat variable names accepted for compatibility, with the config key they set.
const LEGACY_INT_VARS: &[(&str, &str)] = &[
    ("RATE_LIMIT_IP", "limits.ip_limit"),
    ("RATE_LIMIT_TOKEN", "limits.token_limit"),
    ("BLOCK_DURATION_SECONDS", "limits.block_duration_secs"),
    ("REDIS_PORT", "storage.redis.port"),
    ("REDIS_DB", "storage.redis.db"),
];

const LEGACY_STRING_VARS: &[(&str, &str)] = &[
    ("REDIS_HOST", "storage.redis.host"),
    ("REDIS_PASSWORD", "storage.redis.password"),
];

impl TurnstileConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, std::env::vars().collect())
    }

    /// Load configuration using an explicit set of environment variables.
    pub fn load_from(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TURNSTILE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (var, key) in LEGACY_INT_VARS {
            if let Some(raw) = env.get(*var).filter(|v| !v.is_empty()) {
                let value: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| TurnstileError::Config(format!("invalid {}: {}", var, e)))?;
                builder = builder.set_override(*key, value)?;
            }
        }

        for (var, key) in LEGACY_STRING_VARS {
            if let Some(value) = env.get(*var).filter(|v| !v.is_empty()) {
                builder = builder.set_override(*key, value.clone())?;
            }
        }

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.ip_limit == 0 {
            return Err(TurnstileError::Config("ip_limit must be greater than zero".into()));
        }
        if self.limits.token_limit == 0 {
            return Err(TurnstileError::Config("token_limit must be greater than zero".into()));
        }
        if let Some((token, _)) = self.limits.token_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(TurnstileError::Config(format!(
                "token limit override for {:?} must be greater than zero",
                token
            )));
        }
        if self.storage.sweep_interval_ms == 0 {
            return Err(TurnstileError::Config("sweep_interval_ms must be greater than zero".into()));
        }
        if self.storage.redis.command_timeout_ms == 0 || self.storage.redis.connect_timeout_ms == 0 {
            return Err(TurnstileError::Config("redis timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::load_from(None, HashMap::new()).unwrap();

        assert_eq!(config.limits.ip_limit, 10);
        assert_eq!(config.limits.token_limit, 100);
        assert_eq!(config.limits.block_duration(), Duration::from_secs(300));
        assert!(config.limits.token_limits.is_empty());
        assert_eq!(config.storage.backend, StoreBackend::Redis);
        assert_eq!(config.storage.sweep_interval(), Duration::from_secs(1));

        let info = config.storage.redis.connection_info().unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6379) if host == "localhost"));
        assert_eq!(info.redis.db, 0);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn test_legacy_env_overrides() {
        let config = TurnstileConfig::load_from(
            None,
            env(&[
                ("RATE_LIMIT_IP", "5"),
                ("RATE_LIMIT_TOKEN", "50"),
                ("BLOCK_DURATION_SECONDS", "60"),
                ("REDIS_HOST", "cache.internal"),
                ("REDIS_PORT", "6380"),
                ("REDIS_PASSWORD", "s3cret"),
                ("REDIS_DB", "2"),
            ]),
        )
        .unwrap();

        assert_eq!(config.limits.ip_limit, 5);
        assert_eq!(config.limits.token_limit, 50);
        assert_eq!(config.limits.block_duration_secs, 60);

        let info = config.storage.redis.connection_info().unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6380) if host == "cache.internal"));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_password_with_url_delimiters_kept_verbatim() {
        for password in ["pa/ss#1", "pa?ss", "p@ss:word"] {
            let config =
                TurnstileConfig::load_from(None, env(&[("REDIS_PASSWORD", password)])).unwrap();

            let info = config.storage.redis.connection_info().unwrap();
            assert_eq!(info.redis.password.as_deref(), Some(password));
            assert!(redis::Client::open(info).is_ok());
        }
    }

    #[test]
    fn test_prefixed_env_overrides() {
        let config = TurnstileConfig::load_from(
            None,
            env(&[
                ("TURNSTILE__LIMITS__IP_LIMIT", "42"),
                ("TURNSTILE__STORAGE__BACKEND", "memory"),
            ]),
        )
        .unwrap();

        assert_eq!(config.limits.ip_limit, 42);
        assert_eq!(config.storage.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_invalid_legacy_value_rejected() {
        let result = TurnstileConfig::load_from(None, env(&[("RATE_LIMIT_IP", "ten")]));
        match result {
            Err(TurnstileError::Config(msg)) => assert!(msg.contains("RATE_LIMIT_IP")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_legacy_value_ignored() {
        let config = TurnstileConfig::load_from(None, env(&[("RATE_LIMIT_IP", "")])).unwrap();
        assert_eq!(config.limits.ip_limit, 10);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limits:
  ip_limit: 3
  block_duration_secs: 2
  token_limits:
    premium-token: 1000
storage:
  backend: memory
  sweep_interval_ms: 250
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.ip_limit, 3);
        assert_eq!(config.limits.token_limit, 100);
        assert_eq!(config.limits.token_limits.get("premium-token"), Some(&1000));
        assert_eq!(config.storage.backend, StoreBackend::Memory);
        assert_eq!(config.storage.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_redis_url_takes_precedence() {
        let settings = RedisSettings {
            url: Some("redis://10.0.0.5:7000/1".to_string()),
            password: Some("ignored".to_string()),
            ..Default::default()
        };

        let info = settings.connection_info().unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 7000) if host == "10.0.0.5"));
        assert_eq!(info.redis.db, 1);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = "limits:\n  ip_limit: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));

        let yaml = "limits:\n  token_limits:\n    free: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }
}
