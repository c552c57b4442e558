//! Gateway configuration.
//!
//! Loaded from a YAML file (path from `--config`, `LLMUX_CONFIG`, or
//! `llmux.yaml` in the working directory). Every string value supports
//! `${VAR}` and `${VAR:-default}` environment interpolation, applied to the
//! parsed YAML tree before deserialization so keys are left untouched.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::routing::RoutingStrategy;

/// Base URLs for the provider names the gateway knows out of the box.
/// Other providers must set `base_url` explicitly.
pub const KNOWN_PROVIDERS: &[(&str, &str)] = &[
    ("groq", "https://api.groq.com/openai/v1"),
    ("together", "https://api.together.xyz/v1"),
    ("cerebras", "https://api.cerebras.ai/v1"),
    ("sambanova", "https://api.sambanova.ai/v1"),
    ("openrouter", "https://openrouter.ai/api/v1"),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8088
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Single key shorthand, registered under the label `default`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Label -> key map. Wins over `api_key` for duplicate labels.
    #[serde(default)]
    pub api_keys: Option<HashMap<String, String>>,
}

impl AuthConfig {
    /// Flatten both forms into one `{label: key}` map, dropping empty keys.
    pub fn key_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                map.insert("default".to_string(), key.to_string());
            }
        }
        if let Some(keys) = &self.api_keys {
            for (label, key) in keys {
                if !key.is_empty() {
                    map.insert(label.clone(), key.clone());
                }
            }
        }
        map
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub extra_headers: Option<HashMap<String, String>>,
    /// Accepted for config compatibility; retries happen across providers,
    /// never within one.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: RoutingStrategy,
    #[serde(default)]
    pub fallback_chain: Option<Vec<String>>,
    /// friendly model -> provider -> native model
    #[serde(default)]
    pub model_aliases: HashMap<String, HashMap<String, String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::default(),
            fallback_chain: None,
            model_aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CacheBackendKind,
    #[serde(default)]
    pub memory: MemoryCacheConfig,
    #[serde(default)]
    pub redis: RedisCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            memory: MemoryCacheConfig::default(),
            redis: RedisCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCacheConfig {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            ttl: default_cache_ttl(),
        }
    }
}

fn default_max_items() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisCacheConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            ttl: default_cache_ttl(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "llmux:".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub pretty: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            pretty: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load from a YAML file. A missing file yields the default config so
    /// the gateway can run entirely from environment-backed defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            tracing::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(text).context("invalid YAML in config file")?;
        interpolate_value(&mut value);
        let config: GatewayConfig =
            serde_yaml::from_value(value).context("config file did not match expected schema")?;
        Ok(config)
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex")
    })
}

/// Expand `${VAR}` / `${VAR:-default}` in a single string. Unset variables
/// without a default expand to the empty string.
pub fn interpolate_env(input: &str) -> String {
    env_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(val) => val,
                Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

fn interpolate_value(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = interpolate_env(s);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                interpolate_value(item);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item);
            }
        }
        _ => {}
    }
}
