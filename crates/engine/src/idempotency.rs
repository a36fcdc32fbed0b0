//! Idempotency cache: `request_id` → `notification_id`, with expiry.
//!
//! Unlike the worker-side caches this one never degrades: if it cannot be
//! reached the enqueue fails, because skipping deduplication can deliver twice.
//!
//! The Redis implementation uses `SET NX EX` for an atomic create-if-absent with
//! automatic TTL expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;

/// Default entry lifetime (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Create the mapping only if `request_id` is not mapped yet.
    ///
    /// Returns `true` iff this call created it.
    async fn try_set(
        &self,
        request_id: &str,
        notification_id: &str,
        ttl: Duration,
    ) -> Result<bool, AppError>;

    async fn lookup(&self, request_id: &str) -> Result<Option<String>, AppError>;

    /// Round-trip to the backing cache.
    async fn ping(&self) -> Result<(), AppError>;
}

/// Redis-backed idempotency cache.
#[derive(Clone)]
pub struct RedisIdempotencyCache {
    redis: ConnectionManager,
}

impl RedisIdempotencyCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(request_id: &str) -> String {
        format!("idempotency:{}", request_id)
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn try_set(
        &self,
        request_id: &str,
        notification_id: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();

        // SET key notification_id NX EX ttl
        // Some("OK") when the key was created, None when it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(request_id))
            .arg(notification_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut redis)
            .await?;

        Ok(result.is_some())
    }

    async fn lookup(&self, request_id: &str) -> Result<Option<String>, AppError> {
        let mut redis = self.redis.clone();
        let existing: Option<String> = redis.get(Self::key(request_id)).await?;
        Ok(existing)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut redis).await?;
        Ok(())
    }
}

/// In-process idempotency cache for tests and single-node runs.
pub struct MemoryIdempotencyCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl MemoryIdempotencyCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a cache outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::CacheUnavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "idempotency cache unreachable",
            ))))
        }
    }
}

impl Default for MemoryIdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn try_set(
        &self,
        request_id: &str,
        notification_id: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(request_id) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(
                    request_id.to_string(),
                    (notification_id.to_string(), now + ttl),
                );
                Ok(true)
            }
        }
    }

    async fn lookup(&self, request_id: &str) -> Result<Option<String>, AppError> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(request_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(id, _)| id.clone()))
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}
