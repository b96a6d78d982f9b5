use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use engram_core::config::CacheConfig;

use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};

/// One cached response plus its bookkeeping.
struct CacheEntry {
    value: CachedValue,
    created: Instant,
    ttl: Duration,
    size_bytes: usize,
    access_count: u64,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

#[derive(Clone)]
enum CachedValue {
    Chat(ChatResponse),
    Embedding(EmbeddingResponse),
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_bytes: usize,
}

/// Snapshot of cache counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Request/response cache for provider calls.
///
/// Keys are sha256 over the canonicalised request; eviction is LRU by
/// `last_accessed` once the byte budget is exceeded. Expiry is lazy on read
/// plus the periodic `cleanup` sweep.
pub struct RequestCache {
    inner: Mutex<CacheState>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                current_bytes: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn get_chat(&self, req: &ChatRequest) -> Option<ChatResponse> {
        match self.get(&chat_key(req)) {
            Some(CachedValue::Chat(resp)) => Some(resp),
            _ => None,
        }
    }

    pub fn put_chat(&self, req: &ChatRequest, resp: &ChatResponse) {
        let ttl = Duration::from_secs(self.config.chat_ttl_secs);
        let size = serde_json::to_vec(resp).map(|v| v.len()).unwrap_or(0);
        self.put(chat_key(req), CachedValue::Chat(resp.clone()), ttl, size);
    }

    pub fn get_embedding(&self, req: &EmbeddingRequest) -> Option<EmbeddingResponse> {
        match self.get(&embedding_key(req)) {
            Some(CachedValue::Embedding(resp)) => Some(resp),
            _ => None,
        }
    }

    pub fn put_embedding(&self, req: &EmbeddingRequest, resp: &EmbeddingResponse) {
        let ttl = Duration::from_secs(self.config.embedding_ttl_secs);
        let size = serde_json::to_vec(resp).map(|v| v.len()).unwrap_or(0);
        self.put(
            embedding_key(req),
            CachedValue::Embedding(resp.clone()),
            ttl,
            size,
        );
    }

    fn get(&self, key: &str) -> Option<CachedValue> {
        let mut state = self.inner.lock().unwrap();
        match state.entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                let size = entry.size_bytes;
                state.entries.remove(key);
                state.current_bytes = state.current_bytes.saturating_sub(size);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: String, value: CachedValue, ttl: Duration, size_bytes: usize) {
        let max_bytes = self.max_bytes();
        if size_bytes > max_bytes {
            debug!(size_bytes, max_bytes, "response larger than cache budget, skipping");
            return;
        }
        let ttl = ttl.min(Duration::from_secs(self.config.max_ttl_secs));

        let mut state = self.inner.lock().unwrap();

        // Replacing an existing entry releases its bytes first.
        if let Some(old) = state.entries.remove(&key) {
            state.current_bytes = state.current_bytes.saturating_sub(old.size_bytes);
        }

        // LRU eviction until the new entry fits.
        while state.current_bytes + size_bytes > max_bytes {
            let lru_key = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            match lru_key {
                Some(k) => {
                    if let Some(evicted) = state.entries.remove(&k) {
                        state.current_bytes =
                            state.current_bytes.saturating_sub(evicted.size_bytes);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }

        let now = Instant::now();
        state.current_bytes += size_bytes;
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created: now,
                ttl,
                size_bytes,
                access_count: 0,
                last_accessed: now,
            },
        );
    }

    /// Drop every expired entry. Called by the periodic maintenance task.
    pub fn cleanup(&self) {
        let mut state = self.inner.lock().unwrap();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                state.current_bytes = state.current_bytes.saturating_sub(entry.size_bytes);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock().unwrap();
        CacheStats {
            entries: state.entries.len(),
            current_bytes: state.current_bytes,
            max_bytes: self.max_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn max_bytes(&self) -> usize {
        (self.config.max_size_mb as usize) * 1024 * 1024
    }
}

/// Deterministic key over the canonicalised chat request. serde_json maps are
/// sorted, so the digest is stable regardless of field construction order.
pub fn chat_key(req: &ChatRequest) -> String {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "content": m.content,
                "role": m.role.as_str(),
            })
        })
        .collect();
    let canonical = serde_json::json!({
        "kind": "chat",
        "max_tokens": req.max_tokens,
        "messages": messages,
        "model": req.model,
        "temperature": req.temperature,
        "top_p": req.top_p,
    });
    digest(&canonical)
}

pub fn embedding_key(req: &EmbeddingRequest) -> String {
    let canonical = serde_json::json!({
        "dimensions": req.dimensions,
        "encoding_format": req.encoding_format,
        "input": req.input,
        "kind": "embedding",
        "model": req.model,
    });
    digest(&canonical)
}

fn digest(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
