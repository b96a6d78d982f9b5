use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use engram_core::config::PoolConfig;
use engram_core::types::ProviderKind;

use crate::provider::{LlmProvider, ProviderError};

/// How long to wait between polls when the pool is saturated.
const ACQUIRE_POLL_MS: u64 = 50;

struct PoolEntry {
    provider: Arc<dyn LlmProvider>,
    created_at: Instant,
    last_used_at: Instant,
    is_healthy: bool,
    usage_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pools: usize,
    pub connections: usize,
    pub created: u64,
    pub reused: u64,
    pub timeouts: u64,
}

/// Pool of reusable transports keyed by `(provider kind, config hash)`.
///
/// Transports here are HTTP clients, so "connection" means a warm client with
/// its keep-alive sockets. Saturated pools poll until `acquire_timeout_ms`.
pub struct ConnectionPool {
    inner: Mutex<HashMap<String, Vec<PoolEntry>>>,
    config: PoolConfig,
    created: AtomicU64,
    reused: AtomicU64,
    timeouts: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            config,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Check out a transport for `key`, creating one via `factory` when the
    /// pool has room. Blocks (polling) when saturated, up to the configured
    /// acquire timeout.
    pub async fn acquire<F>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError>
    where
        F: Fn() -> Result<Arc<dyn LlmProvider>, ProviderError>,
    {
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        loop {
            {
                let mut pools = self.inner.lock().unwrap();
                let entries = pools.entry(key.to_string()).or_default();

                let max_idle = Duration::from_secs(self.config.max_idle_secs);
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.is_healthy && e.last_used_at.elapsed() < max_idle)
                {
                    entry.last_used_at = Instant::now();
                    entry.usage_count += 1;
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.provider.clone());
                }

                if entries.len() < self.config.max_connections {
                    let provider = factory()?;
                    let now = Instant::now();
                    entries.push(PoolEntry {
                        provider: provider.clone(),
                        created_at: now,
                        last_used_at: now,
                        is_healthy: true,
                        usage_count: 1,
                    });
                    self.created.fetch_add(1, Ordering::Relaxed);
                    debug!(key, total = entries.len(), "pooled new provider transport");
                    return Ok(provider);
                }
            }

            if Instant::now() >= deadline {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ProviderError::Timeout {
                    ms: self.config.acquire_timeout_ms,
                });
            }
            tokio::time::sleep(Duration::from_millis(ACQUIRE_POLL_MS)).await;
        }
    }

    /// Return a transport: bumps `last_used_at` so idle disposal sees it.
    pub fn release(&self, key: &str, provider: &Arc<dyn LlmProvider>) {
        let mut pools = self.inner.lock().unwrap();
        if let Some(entries) = pools.get_mut(key) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| Arc::ptr_eq(&e.provider, provider))
            {
                entry.last_used_at = Instant::now();
            }
        }
    }

    /// Probe every pooled transport and record the outcome. Snapshot first so
    /// no lock is held across the probes.
    pub async fn health_sweep(&self) {
        let snapshot: Vec<(String, Arc<dyn LlmProvider>)> = {
            let pools = self.inner.lock().unwrap();
            pools
                .iter()
                .flat_map(|(key, entries)| {
                    entries
                        .iter()
                        .map(move |e| (key.clone(), e.provider.clone()))
                })
                .collect()
        };

        for (key, provider) in snapshot {
            let healthy = provider.probe().await;
            if !healthy {
                warn!(key, provider = provider.name(), "pooled transport failed health sweep");
            }
            let mut pools = self.inner.lock().unwrap();
            if let Some(entries) = pools.get_mut(&key) {
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| Arc::ptr_eq(&e.provider, &provider))
                {
                    entry.is_healthy = healthy;
                }
            }
        }
    }

    /// Dispose entries idle beyond `max_idle_secs` and anything unhealthy.
    pub fn cleanup(&self) {
        let max_idle = Duration::from_secs(self.config.max_idle_secs);
        let mut pools = self.inner.lock().unwrap();
        for entries in pools.values_mut() {
            entries.retain(|e| e.is_healthy && e.last_used_at.elapsed() < max_idle);
        }
        pools.retain(|_, entries| !entries.is_empty());
    }

    pub fn stats(&self) -> PoolStats {
        let pools = self.inner.lock().unwrap();
        PoolStats {
            pools: pools.len(),
            connections: pools.values().map(|v| v.len()).sum(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Deterministic pool key folding the provider kind, the presence (never the
/// value) of the API key, the base URL, and the model.
pub fn pool_key(
    kind: ProviderKind,
    api_key: Option<&str>,
    base_url: Option<&str>,
    model: Option<&str>,
) -> String {
    let canonical = serde_json::json!({
        "base_url": base_url,
        "has_api_key": api_key.is_some(),
        "kind": kind.to_string(),
        "model": model,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{}:{}", kind, &hex::encode(hasher.finalize())[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    use crate::types::{
        ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
    };

    struct StubProvider {
        healthy: AtomicBool,
    }

    impl StubProvider {
        fn arc() -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                healthy: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }
        fn model(&self) -> &str {
            "stub-model"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "ok".into(),
                model: "stub-model".into(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: Some("stop".into()),
            })
        }
        async fn embed(&self, _req: &EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
            Err(ProviderError::Unsupported("stub".into()))
        }
        async fn probe(&self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn acquire_reuses_existing_entry() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let a = pool.acquire("k", || Ok(StubProvider::arc())).await.unwrap();
        let b = pool.acquire("k", || Ok(StubProvider::arc())).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn saturated_pool_times_out() {
        let config = PoolConfig {
            max_connections: 1,
            max_idle_secs: 0, // every entry is instantly "expired" for reuse
            acquire_timeout_ms: 120,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(config);
        pool.acquire("k", || Ok(StubProvider::arc())).await.unwrap();
        let err = pool.acquire("k", || Ok(StubProvider::arc())).await;
        assert!(matches!(err, Err(ProviderError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cleanup_drops_idle_entries() {
        let config = PoolConfig {
            max_idle_secs: 0,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(config);
        pool.acquire("k", || Ok(StubProvider::arc())).await.unwrap();
        pool.cleanup();
        assert_eq!(pool.stats().connections, 0);
    }

    #[test]
    fn pool_key_folds_config_not_secrets() {
        let with_key = pool_key(ProviderKind::OpenAi, Some("sk-aaa"), None, Some("m"));
        let other_key = pool_key(ProviderKind::OpenAi, Some("sk-bbb"), None, Some("m"));
        // Key *presence* matters, the value does not.
        assert_eq!(with_key, other_key);

        let without = pool_key(ProviderKind::OpenAi, None, None, Some("m"));
        assert_ne!(with_key, without);

        let other_model = pool_key(ProviderKind::OpenAi, Some("sk-aaa"), None, Some("n"));
        assert_ne!(with_key, other_model);
    }
}
