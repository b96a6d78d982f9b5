use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use engram_core::config::{CacheConfig, HealthConfig, PoolConfig};
use engram_core::types::ProviderKind;

use crate::cache::RequestCache;
use crate::factory::{self, ProviderSettings};
use crate::health::HealthMonitor;
use crate::pool::ConnectionPool;
use crate::provider::{LlmProvider, ProviderError};
use crate::types::{
    CallScope, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
};

/// Receives every user-facing conversation exchange for memory recording.
///
/// Implementations must be non-blocking — the envelope calls this on the
/// request path after the response is already in hand.
pub trait MemoryHook: Send + Sync {
    fn on_exchange(&self, user_input: &str, ai_output: &str);
}

/// Performance envelope around one transport: request cache, connection pool,
/// and health monitoring, each independently toggleable.
///
/// The envelope also owns the memory hook and the recursion guard: calls at
/// `CallScope::Internal` (the extractor talking to the provider) bypass the
/// cache and never fire the hook.
pub struct ProviderEnvelope {
    base: Arc<dyn LlmProvider>,
    settings: ProviderSettings,
    cache: Option<Arc<RequestCache>>,
    pool: Option<Arc<ConnectionPool>>,
    health: Arc<HealthMonitor>,
    hook: RwLock<Option<Arc<dyn MemoryHook>>>,
    requests: AtomicU64,
    failures: AtomicU64,
    cache_cleanup_interval: Duration,
    pool_sweep_interval: Duration,
    health_enabled: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl ProviderEnvelope {
    pub fn new(
        settings: ProviderSettings,
        cache_config: &CacheConfig,
        pool_config: &PoolConfig,
        health_config: &HealthConfig,
    ) -> Result<Arc<Self>, ProviderError> {
        let base = factory::build(&settings)?;
        Ok(Self::with_provider(
            base,
            settings,
            cache_config,
            pool_config,
            health_config,
        ))
    }

    /// Wrap an already-built transport. Callers injecting a custom provider
    /// (tests, embedded backends) should disable pooling — pooled checkouts
    /// are rebuilt from `settings` via the factory, not from `base`.
    pub fn with_provider(
        base: Arc<dyn LlmProvider>,
        settings: ProviderSettings,
        cache_config: &CacheConfig,
        pool_config: &PoolConfig,
        health_config: &HealthConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            base,
            settings,
            cache: cache_config
                .enabled
                .then(|| Arc::new(RequestCache::new(cache_config.clone()))),
            pool: pool_config
                .enabled
                .then(|| Arc::new(ConnectionPool::new(pool_config.clone()))),
            health: HealthMonitor::new(health_config.clone()),
            hook: RwLock::new(None),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_cleanup_interval: Duration::from_secs(cache_config.cleanup_interval_secs),
            pool_sweep_interval: Duration::from_secs(pool_config.sweep_interval_secs),
            health_enabled: health_config.enabled,
            shutdown_tx,
        })
    }

    /// Spawn the periodic maintenance workers: cache expiry sweep, pool
    /// health sweep + idle disposal, and the liveness probe loop. All of them
    /// stop when `shutdown()` is called.
    pub fn start_maintenance(self: &Arc<Self>) {
        if let Some(cache) = self.cache.clone() {
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = self.cache_cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cache.cleanup(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        if let Some(pool) = self.pool.clone() {
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = self.pool_sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            pool.health_sweep().await;
                            pool.cleanup();
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        if self.health_enabled {
            self.health
                .spawn_probe_loop(self.base.clone(), self.shutdown_tx.subscribe());
        }

        info!(provider = self.base.name(), "provider envelope maintenance started");
    }

    /// Install the memory-recording hook. Only user-scope chat calls fire it.
    pub fn set_memory_hook(&self, hook: Arc<dyn MemoryHook>) {
        *self.hook.write().unwrap() = Some(hook);
    }

    pub async fn chat(
        &self,
        req: &ChatRequest,
        scope: CallScope,
    ) -> Result<ChatResponse, ProviderError> {
        // Internal calls (extractor) must not see the cache: a stale cached
        // extraction would silently pin old classifications, and the hook
        // firing here would recurse.
        let cache = match scope {
            CallScope::User => self.cache.as_deref(),
            CallScope::Internal => None,
        };

        if let Some(cache) = cache {
            if let Some(hit) = cache.get_chat(req) {
                debug!(provider = self.base.name(), "chat cache hit");
                self.fire_hook(req, &hit);
                return Ok(hit);
            }
        }

        let transport = self.checkout().await?;
        let started = Instant::now();
        let result = self
            .with_deadline(transport.chat(req))
            .await;
        self.record_outcome(&result, started);
        self.checkin(&transport);

        let resp = result?;
        if let Some(cache) = cache {
            cache.put_chat(req, &resp);
        }
        if scope == CallScope::User {
            self.fire_hook(req, &resp);
        }
        Ok(resp)
    }

    pub async fn embed(
        &self,
        req: &EmbeddingRequest,
        scope: CallScope,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let cache = match scope {
            CallScope::User => self.cache.as_deref(),
            CallScope::Internal => None,
        };

        if let Some(cache) = cache {
            if let Some(hit) = cache.get_embedding(req) {
                debug!(provider = self.base.name(), "embedding cache hit");
                return Ok(hit);
            }
        }

        let transport = self.checkout().await?;
        let started = Instant::now();
        let result = self.with_deadline(transport.embed(req)).await;
        self.record_outcome(&result, started);
        self.checkin(&transport);

        let resp = result?;
        if let Some(cache) = cache {
            cache.put_embedding(req, &resp);
        }
        Ok(resp)
    }

    async fn checkout(&self) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        match &self.pool {
            Some(pool) => {
                let settings = self.settings.clone();
                pool.acquire(&self.settings.pool_key(), move || factory::build(&settings))
                    .await
            }
            None => Ok(self.base.clone()),
        }
    }

    fn checkin(&self, transport: &Arc<dyn LlmProvider>) {
        if let Some(pool) = &self.pool {
            pool.release(&self.settings.pool_key(), transport);
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let deadline = self.settings.request_timeout;
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                ms: deadline.as_millis() as u64,
            }),
        }
    }

    fn record_outcome<T>(&self, result: &Result<T, ProviderError>, started: Instant) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let latency = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => self.health.record_success(self.base.name(), latency),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(provider = self.base.name(), error = %e, "provider call failed");
                self.health.record_failure(self.base.name(), &e.to_string());
            }
        }
    }

    fn fire_hook(&self, req: &ChatRequest, resp: &ChatResponse) {
        let hook = self.hook.read().unwrap().clone();
        if let Some(hook) = hook {
            if let Some(user_input) = req.last_user_content() {
                hook.on_exchange(user_input, &resp.content);
            }
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn kind(&self) -> ProviderKind {
        self.base.kind()
    }

    pub fn model(&self) -> String {
        self.settings.resolved_model()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy(self.base.name())
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.as_ref().map(|c| c.hit_count()).unwrap_or(0)
    }

    /// Diagnostics payload combining envelope counters, cache stats, pool
    /// stats, and the health snapshot.
    pub fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": self.base.name(),
            "kind": self.base.kind().to_string(),
            "model": self.model(),
            "healthy": self.is_healthy(),
            "requests": self.requests.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "cache": self.cache.as_ref().map(|c| serde_json::to_value(c.stats()).unwrap_or_default()),
            "pool": self.pool.as_ref().map(|p| serde_json::to_value(p.stats()).unwrap_or_default()),
            "health": self.health.snapshot(self.base.name())
                .map(|s| serde_json::to_value(s).unwrap_or_default()),
        })
    }

    /// Stop all maintenance workers. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ProviderEnvelope {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
