use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENDPOINT_DAILY: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const ENDPOINT_AUTOPUSH: &str = "https://autopush-cloudcode-pa.sandbox.googleapis.com";
pub const ENDPOINT_PROD: &str = "https://cloudcode-pa.googleapis.com";

pub const DEFAULT_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Environment variable holding the key inbound callers must present.
    /// Unset means the gateway accepts unauthenticated requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Extra model aliases, applied before the built-in table.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts_file: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_expiry_buffer_secs")]
    pub token_expiry_buffer_secs: u64,
    #[serde(default = "default_max_auto_wait_secs")]
    pub max_auto_wait_secs: u64,
    #[serde(default = "default_max_retry_depth")]
    pub max_retry_depth: u32,
    #[serde(default = "default_rate_limit_secs")]
    pub default_rate_limit_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

/// Pool tuning resolved into durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub cache_ttl: Duration,
    pub expiry_buffer: Duration,
    pub max_auto_wait: Duration,
    pub max_retry_depth: u32,
    pub default_rate_limit: Duration,
}

fn default_port() -> u16 {
    8787
}

fn default_endpoints() -> Vec<String> {
    vec![
        ENDPOINT_DAILY.to_string(),
        ENDPOINT_AUTOPUSH.to_string(),
        ENDPOINT_PROD.to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_expiry_buffer_secs() -> u64 {
    300
}

fn default_max_auto_wait_secs() -> u64 {
    10
}

fn default_max_retry_depth() -> u32 {
    3
}

fn default_rate_limit_secs() -> u64 {
    60
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_client_secret_env() -> String {
    "ANTIGRAVITY_CLIENT_SECRET".to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key_env: None,
            upstream: UpstreamConfig::default(),
            pool: PoolConfig::default(),
            oauth: OAuthConfig::default(),
            models: HashMap::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            accounts_file: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            token_expiry_buffer_secs: default_expiry_buffer_secs(),
            max_auto_wait_secs: default_max_auto_wait_secs(),
            max_retry_depth: default_max_retry_depth(),
            default_rate_limit_secs: default_rate_limit_secs(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_secret_env: default_client_secret_env(),
            token_url: default_token_url(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            expiry_buffer: Duration::from_secs(self.token_expiry_buffer_secs),
            max_auto_wait: Duration::from_secs(self.max_auto_wait_secs),
            max_retry_depth: self.max_retry_depth,
            default_rate_limit: Duration::from_secs(self.default_rate_limit_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolConfig::default().settings()
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. Every field has a
    /// default, so finding nothing yields the built-in configuration.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.endpoints.is_empty() {
            return Err(ProxyError::config("upstream.endpoints must not be empty"));
        }
        if self.pool.max_retry_depth == 0 {
            return Err(ProxyError::config("pool.max_retry_depth must be at least 1"));
        }
        Ok(())
    }

    /// Resolve the inbound API key, if one is configured.
    pub fn resolve_inbound_key(&self) -> Result<Option<String>> {
        match self.api_key_env {
            None => Ok(None),
            Some(ref var) => std::env::var(var).map(Some).map_err(|_| {
                ProxyError::config(format!(
                    "Environment variable '{}' not set. Set it to the key clients must send.",
                    var
                ))
            }),
        }
    }

    /// Resolve the OAuth client secret used for token refresh.
    pub fn resolve_client_secret(&self) -> Result<String> {
        std::env::var(&self.oauth.client_secret_env).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{}' not set. Token refresh needs the OAuth client secret.",
                self.oauth.client_secret_env
            ))
        })
    }

    /// Where account credentials live on disk.
    pub fn accounts_path(&self) -> PathBuf {
        if let Some(ref path) = self.pool.accounts_file {
            return path.clone();
        }
        platform_config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("accounts.json")
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("antigravity-proxy.toml")];

    if let Some(dir) = platform_config_dir() {
        paths.push(dir.join("config.toml"));
    }
    if !cfg!(target_os = "macos") && std::env::var("XDG_CONFIG_HOME").is_ok() {
        if let Some(home) = home_dir() {
            paths.push(
                home.join(".config")
                    .join("antigravity-proxy")
                    .join("config.toml"),
            );
        }
    }

    if let Some(home) = home_dir() {
        paths.push(home.join(".antigravity-proxy.toml"));
    }

    paths
}

fn platform_config_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        return home_dir().map(|h| {
            h.join("Library")
                .join("Application Support")
                .join("antigravity-proxy")
        });
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("antigravity-proxy"));
    }
    home_dir().map(|h| h.join(".config").join("antigravity-proxy"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
