//! Worker-side caches: template render data and processed-message markers.
//!
//! These caches are an optimisation. Every failure degrades to a miss (or a
//! skipped write) with a warning; delivery carries on against the live services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use herald_common::types::Template;

#[async_trait]
pub trait WorkerCache: Send + Sync {
    async fn get_template(&self, template_code: &str) -> Option<Template>;

    async fn put_template(&self, template_code: &str, template: &Template, ttl_secs: u64);

    /// Whether `message_id` was already carried to a terminal state.
    async fn is_processed(&self, message_id: &str) -> bool;

    async fn mark_processed(&self, message_id: &str, ttl_secs: u64);
}

/// Redis-backed worker cache.
#[derive(Clone)]
pub struct RedisWorkerCache {
    redis: ConnectionManager,
}

impl RedisWorkerCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn template_key(template_code: &str) -> String {
        format!("template:{}", template_code)
    }

    fn processed_key(message_id: &str) -> String {
        format!("processed:{}", message_id)
    }
}

#[async_trait]
impl WorkerCache for RedisWorkerCache {
    async fn get_template(&self, template_code: &str) -> Option<Template> {
        let mut redis = self.redis.clone();
        let cached: Option<String> = match redis.get(Self::template_key(template_code)).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(template_code, error = %e, "Template cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&cached?) {
            Ok(template) => Some(template),
            Err(e) => {
                tracing::warn!(template_code, error = %e, "Ignoring undecodable cached template");
                None
            }
        }
    }

    async fn put_template(&self, template_code: &str, template: &Template, ttl_secs: u64) {
        let value = match serde_json::to_string(template) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(template_code, error = %e, "Template cache encode failed");
                return;
            }
        };

        let mut redis = self.redis.clone();
        let result: redis::RedisResult<()> = redis
            .set_ex(Self::template_key(template_code), value, ttl_secs)
            .await;
        if let Err(e) = result {
            tracing::warn!(template_code, error = %e, "Template cache write failed");
        }
    }

    async fn is_processed(&self, message_id: &str) -> bool {
        let mut redis = self.redis.clone();
        match redis.exists::<_, bool>(Self::processed_key(message_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(message_id, error = %e, "Processed-marker check failed, allowing message");
                false
            }
        }
    }

    async fn mark_processed(&self, message_id: &str, ttl_secs: u64) {
        let mut redis = self.redis.clone();
        let result: redis::RedisResult<()> = redis
            .set_ex(Self::processed_key(message_id), "processed", ttl_secs)
            .await;
        if let Err(e) = result {
            tracing::warn!(message_id, error = %e, "Processed-marker write failed");
        }
    }
}

#[derive(Default)]
struct MemoryEntries {
    templates: HashMap<String, (Template, Instant)>,
    processed: HashMap<String, Instant>,
}

/// In-process worker cache.
pub struct MemoryWorkerCache {
    entries: Mutex<MemoryEntries>,
    available: AtomicBool,
}

impl MemoryWorkerCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(MemoryEntries::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a cache outage; reads miss and writes are dropped.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn up(&self, op: &str) -> bool {
        let up = self.available.load(Ordering::SeqCst);
        if !up {
            tracing::warn!(op, "Worker cache unavailable, degrading");
        }
        up
    }
}

impl Default for MemoryWorkerCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerCache for MemoryWorkerCache {
    async fn get_template(&self, template_code: &str) -> Option<Template> {
        if !self.up("get_template") {
            return None;
        }
        let now = Instant::now();
        self.entries
            .lock()
            .templates
            .get(template_code)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(template, _)| template.clone())
    }

    async fn put_template(&self, template_code: &str, template: &Template, ttl_secs: u64) {
        if !self.up("put_template") {
            return;
        }
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .templates
            .insert(template_code.to_string(), (template.clone(), expires_at));
    }

    async fn is_processed(&self, message_id: &str) -> bool {
        if !self.up("is_processed") {
            return false;
        }
        let now = Instant::now();
        self.entries
            .lock()
            .processed
            .get(message_id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    async fn mark_processed(&self, message_id: &str, ttl_secs: u64) {
        if !self.up("mark_processed") {
            return;
        }
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .processed
            .insert(message_id.to_string(), expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            subject: "Hi {{name}}".into(),
            body: "Welcome".into(),
        }
    }

    #[test]
    fn test_keys() {
        assert_eq!(RedisWorkerCache::template_key("welcome"), "template:welcome");
        assert_eq!(RedisWorkerCache::processed_key("notif_1"), "processed:notif_1");
    }

    #[tokio::test]
    async fn test_template_round_trip_and_markers() {
        let cache = MemoryWorkerCache::new();
        assert!(cache.get_template("welcome").await.is_none());
        cache.put_template("welcome", &template(), 3600).await;
        assert_eq!(cache.get_template("welcome").await, Some(template()));

        assert!(!cache.is_processed("notif_1").await);
        cache.mark_processed("notif_1", 60).await;
        assert!(cache.is_processed("notif_1").await);
    }

    #[tokio::test]
    async fn test_unavailable_degrades_to_miss() {
        let cache = MemoryWorkerCache::new();
        cache.put_template("welcome", &template(), 3600).await;
        cache.mark_processed("notif_1", 60).await;

        cache.set_available(false);
        assert!(cache.get_template("welcome").await.is_none());
        assert!(!cache.is_processed("notif_1").await);
        cache.put_template("other", &template(), 3600).await;

        cache.set_available(true);
        assert!(cache.get_template("other").await.is_none());
    }
}
