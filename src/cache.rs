//! Content-addressed response cache.
//!
//! The key is a SHA-256 digest over exactly the request fields that can
//! change a completion: model, messages, temperature, top_p, max_tokens,
//! stop, presence_penalty, frequency_penalty. Routing hints (`provider`),
//! cache control (`cache`), `stream`, and `user` never contribute, so two
//! requests that differ only in those fields share an entry.
//!
//! Backends sit behind a four-verb contract. Backend failures are logged
//! and swallowed: a broken cache degrades to a slow gateway, not a failing
//! one.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse};

/// Deterministic fingerprint of the cache-relevant request fields.
pub fn cache_key(request: &ChatCompletionRequest) -> String {
    let fingerprint = serde_json::json!([
        request.model,
        request.messages,
        request.temperature,
        request.top_p,
        request.max_tokens,
        request.stop,
        request.presence_penalty,
        request.frequency_penalty,
    ]);
    let canonical = serde_json::to_vec(&fingerprint).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("{digest:x}")
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// In-process LRU backend
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new(max_items: usize) -> Self {
        let capacity = NonZeroUsize::new(max_items.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().expect("cache mutex poisoned").pop(key);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.entries.lock().expect("cache mutex poisoned").clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisCache {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.prefixed(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.prefixed(key), value, ttl_secs)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.prefixed(key)).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.key_prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policy wrapper
// ---------------------------------------------------------------------------

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    backend: Arc<dyn CacheBackend>,
}

impl ResponseCache {
    pub fn new(enabled: bool, ttl: Duration, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            enabled,
            ttl,
            backend,
        }
    }

    pub fn from_config(config: &CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        let ttl = match config.backend {
            crate::config::CacheBackendKind::Memory => config.memory.ttl,
            crate::config::CacheBackendKind::Redis => config.redis.ttl,
        };
        Self::new(config.enabled, Duration::from_secs(ttl), backend)
    }

    /// A disabled cache for configurations without one.
    pub fn disabled() -> Self {
        Self::new(
            false,
            Duration::from_secs(0),
            Arc::new(MemoryCache::new(1)),
        )
    }

    fn applies_to(&self, request: &ChatCompletionRequest) -> bool {
        self.enabled && request.cache != Some(false) && request.stream != Some(true)
    }

    pub async fn get(&self, request: &ChatCompletionRequest) -> Option<ChatCompletionResponse> {
        if !self.applies_to(request) {
            return None;
        }
        let key = cache_key(request);
        let raw = match self.backend.get(&key).await {
            Ok(value) => value?,
            Err(e) => {
                warn!(error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<ChatCompletionResponse>(&raw) {
            Ok(mut response) => {
                debug!(key = %key, "cache hit");
                response.cached = Some(true);
                Some(response)
            }
            Err(e) => {
                warn!(error = %e, "cache entry did not parse, dropping");
                let _ = self.backend.delete(&key).await;
                None
            }
        }
    }

    pub async fn set(&self, request: &ChatCompletionRequest, response: &ChatCompletionResponse) {
        if !self.applies_to(request) {
            return;
        }
        let key = cache_key(request);
        let raw = match serde_json::to_string(response) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "response not serializable for cache");
                return;
            }
        };
        if let Err(e) = self.backend.set(&key, raw, self.ttl).await {
            warn!(error = %e, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    fn base_request() -> serde_json::Value {
        json!({
            "model": "llama-70b",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2
        })
    }

    fn response() -> ChatCompletionResponse {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "llama-3.1-70b-versatile",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "provider": "groq"
        }))
        .unwrap()
    }

    #[test]
    fn ignored_fields_do_not_change_the_key() {
        let plain = request(base_request());

        let mut with_ignored = base_request();
        with_ignored["provider"] = json!("groq");
        with_ignored["cache"] = json!(true);
        with_ignored["stream"] = json!(true);
        with_ignored["user"] = json!("alice");
        let decorated = request(with_ignored);

        assert_eq!(cache_key(&plain), cache_key(&decorated));
    }

    #[test]
    fn relevant_fields_change_the_key() {
        let base = request(base_request());

        let mut different_model = base_request();
        different_model["model"] = json!("other");
        assert_ne!(cache_key(&base), cache_key(&request(different_model)));

        let mut different_temp = base_request();
        different_temp["temperature"] = json!(0.9);
        assert_ne!(cache_key(&base), cache_key(&request(different_temp)));

        let mut different_stop = base_request();
        different_stop["stop"] = json!(["\n"]);
        assert_ne!(cache_key(&base), cache_key(&request(different_stop)));
    }

    #[tokio::test]
    async fn hit_carries_cached_flag() {
        let cache = ResponseCache::new(
            true,
            Duration::from_secs(60),
            Arc::new(MemoryCache::new(10)),
        );
        let req = request(base_request());

        assert!(cache.get(&req).await.is_none());
        cache.set(&req, &response()).await;

        let hit = cache.get(&req).await.expect("expected cache hit");
        assert_eq!(hit.cached, Some(true));
        assert_eq!(hit.provider.as_deref(), Some("groq"));
        assert_eq!(hit.id, "chatcmpl-1");
    }

    #[tokio::test]
    async fn streaming_and_opted_out_requests_bypass_the_cache() {
        let cache = ResponseCache::new(
            true,
            Duration::from_secs(60),
            Arc::new(MemoryCache::new(10)),
        );

        let mut streaming = base_request();
        streaming["stream"] = json!(true);
        let streaming = request(streaming);
        cache.set(&streaming, &response()).await;
        assert!(cache.get(&streaming).await.is_none());

        // The equivalent non-streaming request must also miss: nothing was
        // stored for this key.
        let unary = request(base_request());
        assert!(cache.get(&unary).await.is_none());

        let mut opted_out = base_request();
        opted_out["cache"] = json!(false);
        let opted_out = request(opted_out);
        cache.set(&opted_out, &response()).await;
        assert!(cache.get(&opted_out).await.is_none());
    }

    #[tokio::test]
    async fn memory_backend_expires_entries() {
        let backend = MemoryCache::new(10);
        backend
            .set("k", "v".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_backend_enforces_capacity() {
        let backend = MemoryCache::new(2);
        for key in ["a", "b", "c"] {
            backend
                .set(key, key.to_string(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        // Least-recently-used entry evicted.
        assert!(backend.get("a").await.unwrap().is_none());
        assert!(backend.get("c").await.unwrap().is_some());
    }
}
