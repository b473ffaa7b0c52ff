//! Configuration management for Clickguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{GuardError, Result};
use crate::ratelimit::RateLimitRules;

/// Environment variable prefix, e.g. `CLICKGUARD__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "CLICKGUARD";

/// Main configuration for the Clickguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Caller identity extraction
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Window store backend
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rules file; replaces the inline rules when set
    pub rules_path: Option<String>,

    /// How often the janitor purges expired windows, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Inline rules
    #[serde(default)]
    pub rules: RateLimitRules,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            sweep_interval_secs: default_sweep_interval(),
            rules: RateLimitRules::default(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

impl RateLimitingConfig {
    /// The rules in effect: the rules file if configured, else the inline rules.
    pub fn effective_rules(&self) -> Result<RateLimitRules> {
        match self.rules_path {
            Some(ref path) => RateLimitRules::from_file(path),
            None => Ok(self.rules.clone()),
        }
    }
}

/// Where caller identities come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Header carrying an authenticated principal; takes precedence when set
    #[serde(default)]
    pub principal_header: Option<String>,

    /// Forwarded-address header; the first comma-separated entry is used
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// Other proxy headers, tried in order after the forwarded header
    #[serde(default = "default_alternate_headers")]
    pub alternate_headers: Vec<String>,

    /// Identity used when nothing else is available; `None` rejects instead
    #[serde(default = "default_fallback")]
    pub fallback: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            principal_header: None,
            forwarded_header: default_forwarded_header(),
            alternate_headers: default_alternate_headers(),
            fallback: default_fallback(),
        }
    }
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_alternate_headers() -> Vec<String> {
    vec!["x-real-ip".to_string(), "x-client-ip".to_string()]
}

fn default_fallback() -> Option<String> {
    Some("unknown".to_string())
}

/// Window store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, one per operation
    #[default]
    Memory,
    /// Shared PostgreSQL table
    Postgres,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend holds the windows
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    /// Pool size for the postgres backend
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a request waits for a pooled connection, in milliseconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    500
}

impl GuardConfig {
    /// Load configuration from an optional YAML file, then overlay
    /// `CLICKGUARD__*` environment variables.
    ///
    /// `CLICKGUARD__IDENTITY__ALTERNATE_HEADERS` takes a comma-separated
    /// list. Operation names in rules are lowercased.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let mut config: GuardConfig = builder.add_source(env).build()?.try_deserialize()?;

        config.rate_limiting.rules = config.rate_limiting.rules.normalized()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file without consulting the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: GuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(e.to_string()))?;
        config.rate_limiting.rules = config.rate_limiting.rules.normalized()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(GuardError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.rate_limiting.rules.validate()?;

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(GuardError::Config(
                "store.database_url is required for the postgres backend".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(GuardError::Config(
                "store.max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("identity.alternate_headers")
}
