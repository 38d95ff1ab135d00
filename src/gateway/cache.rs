//! Key/value cache used for replay guards, sliding windows, counters and directives.
//!
//! `MemoryCache` serves single-node deployments and tests; `RedisCache` (feature
//! `gateway-store-redis`) shares state across gateway nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

use super::{Clock, SystemClock};

#[cfg(feature = "gateway-store-redis")]
mod redis_cache;

#[cfg(feature = "gateway-store-redis")]
pub use self::redis_cache::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "gateway-store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// `SET key value NX EX ttl`; true when the key was created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Increments and (re)arms the TTL; returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    /// Sorted-set sliding window: drop members older than `now_ms - window`, count the
    /// rest, add `member` at `now_ms`, refresh the TTL. Returns the count before the add.
    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        member: &str,
    ) -> Result<u64, CacheError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError>;
}

#[derive(Debug)]
enum Slot {
    Value(String),
    Window(Vec<i64>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at_ms: Option<u64>,
}

/// In-process cache with TTLs evaluated against the injected clock.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    next_sweep_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Interval between full scans for expired keys; single keys expire on access.
const SWEEP_INTERVAL_MS: u64 = 60_000;

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_sweep_ms: AtomicU64::new(0),
            clock,
        }
    }

    /// Simulates an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache disabled".to_string()))
        }
    }

    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, u64) -> T,
    ) -> Result<T, CacheError> {
        self.check()?;
        let now_ms = self.clock.now_epoch_millis();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache poisoned".to_string()))?;
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms.is_some_and(|at| at <= now_ms))
        {
            entries.remove(key);
        }
        if now_ms >= self.next_sweep_ms.load(Ordering::Relaxed) {
            self.next_sweep_ms
                .store(now_ms.saturating_add(SWEEP_INTERVAL_MS), Ordering::Relaxed);
            entries.retain(|_, entry| entry.expires_at_ms.is_none_or(|at| at > now_ms));
        }
        Ok(f(&mut entries, now_ms))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender(&self, channel: &str) -> Result<broadcast::Sender<String>, CacheError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache poisoned".to_string()))?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone())
    }
}

fn expiry(now_ms: u64, ttl: Duration) -> Option<u64> {
    Some(now_ms.saturating_add(ttl.as_millis() as u64))
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.with_entry(key, |entries, now_ms| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at_ms: expiry(now_ms, ttl),
                },
            );
            true
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entry(key, |entries, _| match entries.get(key).map(|entry| &entry.slot) {
            Some(Slot::Value(value)) => Some(value.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.with_entry(key, |entries, now_ms| {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at_ms: ttl.and_then(|ttl| expiry(now_ms, ttl)),
                },
            );
        })
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.with_entry(key, |entries, _| {
            entries.remove(key);
        })
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        self.with_entry(key, |entries, now_ms| {
            let current = match entries.get(key).map(|entry| &entry.slot) {
                Some(Slot::Value(value)) => value.parse::<i64>().unwrap_or(0),
                _ => 0,
            };
            let next = current.saturating_add(1);
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(next.to_string()),
                    expires_at_ms: expiry(now_ms, ttl),
                },
            );
            next
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        _member: &str,
    ) -> Result<u64, CacheError> {
        self.with_entry(key, |entries, clock_ms| {
            let cutoff = now_ms.saturating_sub(window.as_millis() as i64);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Window(Vec::new()),
                expires_at_ms: None,
            });
            if !matches!(entry.slot, Slot::Window(_)) {
                entry.slot = Slot::Window(Vec::new());
            }
            let Slot::Window(scores) = &mut entry.slot else {
                return 0;
            };
            scores.retain(|score| *score > cutoff);
            let count = scores.len() as u64;
            scores.push(now_ms);
            entry.expires_at_ms = expiry(clock_ms, window);
            count
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        self.check()?;
        // No subscribers is not an error.
        let _ = self.sender(channel)?.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        self.check()?;
        let rx = self.sender(channel)?.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
