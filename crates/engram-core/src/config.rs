use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{Importance, IngestMode, ProviderKind};

// Performance envelope defaults
pub const DEFAULT_CHAT_TTL_SECS: u64 = 300; // 5 min
pub const DEFAULT_EMBEDDING_TTL_SECS: u64 = 3600; // 1 h
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_MAX_IDLE_SECS: u64 = 300; // 5 min
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
// Conscious loop default cadence
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 30_000;

/// Top-level config (engram.toml + ENGRAM_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngramConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub conscious: ConsciousConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `file:` URL or bare path; `:memory:` is accepted for tests.
    #[serde(default = "default_db_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Explicit provider selection. When absent the API-key prefix decides.
    pub kind: Option<ProviderKind>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Base URL without trailing slash. Official endpoint when absent.
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: None,
            api_key: None,
            model: None,
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Minimum importance gate for conscious promotion. `All` disables the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MinImportance {
    #[default]
    All,
    Low,
    Medium,
    High,
    Critical,
}

impl MinImportance {
    pub fn threshold(&self) -> Option<Importance> {
        match self {
            Self::All => None,
            Self::Low => Some(Importance::Low),
            Self::Medium => Some(Importance::Medium),
            Self::High => Some(Importance::High),
            Self::Critical => Some(Importance::Critical),
        }
    }
}

impl std::str::FromStr for MinImportance {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown minimum importance: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_mode")]
    pub mode: IngestMode,
    /// Logical partition for all reads/writes. Generated when absent.
    pub namespace: Option<String>,
    #[serde(default)]
    pub min_importance: MinImportance,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            namespace: None,
            min_importance: MinImportance::All,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_chat_ttl")]
    pub chat_ttl_secs: u64,
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    /// Hard cap applied to any per-entry TTL.
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: default_cache_size_mb(),
            chat_ttl_secs: default_chat_ttl(),
            embedding_ttl_secs: default_embedding_ttl(),
            max_ttl_secs: default_max_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: default_max_connections(),
            max_idle_secs: default_max_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Ring-buffer capacity for retained check events.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            history_size: default_history_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsciousConfig {
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ConsciousConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            similarity_threshold: default_similarity_threshold(),
            batch_size: default_batch_size(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_db_url() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("file:{}/.engram/engram.db", home)
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_mode() -> IngestMode {
    IngestMode::Automatic
}
fn default_cache_size_mb() -> u64 {
    100
}
fn default_chat_ttl() -> u64 {
    DEFAULT_CHAT_TTL_SECS
}
fn default_embedding_ttl() -> u64 {
    DEFAULT_EMBEDDING_TTL_SECS
}
fn default_max_ttl() -> u64 {
    7200
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_max_idle() -> u64 {
    DEFAULT_MAX_IDLE_SECS
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_probe_interval() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECS
}
fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}
fn default_history_size() -> usize {
    50
}
fn default_update_interval_ms() -> u64 {
    DEFAULT_UPDATE_INTERVAL_MS
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_batch_size() -> usize {
    10
}

impl EngramConfig {
    /// Load config from a TOML file with ENGRAM_* env var overrides, then
    /// apply the standard provider env fallbacks for fields left empty.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: EngramConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ENGRAM_").split("_"))
            .extract()
            .map_err(|e| crate::error::EngramError::Config(e.to_string()))?;

        config.apply_env_fallbacks();
        Ok(config)
    }

    /// Fill unset fields from the conventional environment variables.
    /// Explicit config always wins over the environment.
    pub fn apply_env_fallbacks(&mut self) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = match self.provider.kind {
                Some(ProviderKind::Anthropic) => std::env::var("ANTHROPIC_API_KEY").ok(),
                Some(ProviderKind::Ollama) => None,
                _ => std::env::var("OPENAI_API_KEY")
                    .ok()
                    .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            };
        }
        if self.provider.base_url.is_none() {
            self.provider.base_url = std::env::var("OPENAI_BASE_URL").ok();
        }
        if self.provider.model.is_none() {
            self.provider.model = std::env::var("OPENAI_MODEL").ok();
        }
        // Kill switch: disabling chat memory demotes any ingesting mode.
        if let Ok(enabled) = std::env::var("ENGRAM_ENABLE_CHAT_MEMORY") {
            if enabled == "false" || enabled == "0" {
                self.ingest.mode = IngestMode::Manual;
            }
        }
        if let Ok(mode) = std::env::var("ENGRAM_PROCESSING_MODE") {
            if let Ok(parsed) = mode.parse() {
                self.ingest.mode = parsed;
            }
        }
        if let Ok(min) = std::env::var("ENGRAM_MIN_IMPORTANCE") {
            if let Ok(parsed) = min.parse() {
                self.ingest.min_importance = parsed;
            }
        }
    }

    /// Resolve the SQLite path from the configured `file:` URL.
    pub fn database_path(&self) -> String {
        strip_file_scheme(&self.database.url)
    }
}

/// Accepts `file:/path/to.db`, `file:///path/to.db`, a bare path, or
/// `:memory:` and returns what `rusqlite::Connection::open` expects.
pub fn strip_file_scheme(url: &str) -> String {
    if url == ":memory:" {
        return url.to_string();
    }
    match url.strip_prefix("file://") {
        Some(rest) => rest.to_string(),
        None => url.strip_prefix("file:").unwrap_or(url).to_string(),
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.engram/engram.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_envelope() {
        let config = EngramConfig::default();
        assert_eq!(config.cache.chat_ttl_secs, 300);
        assert_eq!(config.cache.embedding_ttl_secs, 3600);
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.max_idle_secs, 300);
        assert_eq!(config.health.probe_interval_secs, 60);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.success_threshold, 2);
        assert_eq!(config.conscious.update_interval_ms, 30_000);
        assert_eq!(config.ingest.mode, IngestMode::Automatic);
        assert_eq!(config.provider.request_timeout_secs, 30);
    }

    #[test]
    fn file_scheme_stripping() {
        assert_eq!(strip_file_scheme("file:/tmp/m.db"), "/tmp/m.db");
        assert_eq!(strip_file_scheme("file:///tmp/m.db"), "/tmp/m.db");
        assert_eq!(strip_file_scheme("/tmp/m.db"), "/tmp/m.db");
        assert_eq!(strip_file_scheme(":memory:"), ":memory:");
    }

    #[test]
    fn min_importance_threshold_mapping() {
        assert_eq!(MinImportance::All.threshold(), None);
        assert_eq!(
            MinImportance::High.threshold(),
            Some(Importance::High)
        );
        assert_eq!("all".parse::<MinImportance>().unwrap(), MinImportance::All);
    }
}
