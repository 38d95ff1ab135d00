use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::cache::Cache;
use super::config::RateLimitConfig;
use super::{Clock, GatewayError, RateLimitStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitScope {
    Token,
    Ip,
}

impl LimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Ip => "ip",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_requests: u64,
    pub window: Duration,
}

/// In-process sliding windows used while the shared cache is unreachable.
#[derive(Debug, Default)]
pub struct LocalWindows {
    windows: HashMap<String, VecDeque<i64>>,
    last_gc_ms: i64,
}

impl LocalWindows {
    /// Drops hits older than the window, records `now_ms` and returns the prior count.
    pub fn check_and_record(&mut self, key: &str, now_ms: i64, window: Duration) -> u64 {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);

        if now_ms.saturating_sub(self.last_gc_ms) >= window_ms {
            // Keys with no hit inside the window are stale.
            self.windows
                .retain(|_, hits| hits.back().is_some_and(|last| *last > cutoff));
            self.last_gc_ms = now_ms;
        }

        let hits = self.windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|first| *first <= cutoff) {
            hits.pop_front();
        }
        let count = hits.len() as u64;
        hits.push_back(now_ms);
        count
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    local: Mutex<LocalWindows>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            local: Mutex::new(LocalWindows::default()),
            config,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_limit(&self, scope: LimitScope) -> WindowLimit {
        let max_requests = match scope {
            LimitScope::Token => self.config.token_requests,
            LimitScope::Ip => self.config.ip_requests,
        };
        WindowLimit {
            max_requests,
            window: Duration::from_secs(self.config.window_secs.max(1)),
        }
    }

    /// Sliding-window check over `heimdall:rate:<scope>:<id>:<windowStart>`.
    pub async fn check(
        &self,
        scope: LimitScope,
        id: &str,
        limit: WindowLimit,
    ) -> Result<RateLimitStatus, GatewayError> {
        let now_ms = i64::try_from(self.clock.now_epoch_millis()).unwrap_or(i64::MAX);
        let window_secs = i64::try_from(limit.window.as_secs().max(1)).unwrap_or(i64::MAX);
        let now_secs = now_ms / 1000;
        let window_start = now_secs - now_secs.rem_euclid(window_secs);
        let key = format!("heimdall:rate:{}:{id}:{window_start}", scope.as_str());
        let member = format!("{now_ms}-{}", self.seq.fetch_add(1, Ordering::Relaxed));

        let count = match self
            .cache
            .sliding_window(&key, now_ms, limit.window, &member)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::debug!(key = %key, error = %err, "cache unavailable, using local window");
                match self.local.lock() {
                    Ok(mut local) => local.check_and_record(&key, now_ms, limit.window),
                    Err(_) => 0,
                }
            }
        };

        let status = RateLimitStatus {
            limit_type: scope.as_str().to_string(),
            current_count: count,
            limit: limit.max_requests,
            window_start,
            reset_time: window_start.saturating_add(window_secs),
        };
        if count >= limit.max_requests {
            tracing::info!(
                scope = scope.as_str(),
                id,
                count,
                limit = limit.max_requests,
                "rate limit exceeded"
            );
            return Err(GatewayError::RateLimited { status });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::cache::MemoryCache;

    fn limiter() -> (Arc<ManualClock>, Arc<MemoryCache>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let config = RateLimitConfig {
            enabled: true,
            token_requests: 3,
            ip_requests: 2,
            window_secs: 60,
        };
        let limiter = RateLimiter::new(cache.clone(), config, clock.clone());
        (clock, cache, limiter)
    }

    #[tokio::test]
    async fn rejects_once_limit_reached() {
        let (_clock, _cache, limiter) = limiter();
        let limit = limiter.default_limit(LimitScope::Token);
        for _ in 0..3 {
            limiter.check(LimitScope::Token, "7", limit).await.expect("allowed");
        }
        let err = limiter
            .check(LimitScope::Token, "7", limit)
            .await
            .expect_err("limited");
        let GatewayError::RateLimited { status } = err else {
            panic!("unexpected error");
        };
        assert_eq!(status.limit_type, "token");
        assert_eq!(status.current_count, 3);
        assert_eq!(status.limit, 3);
        assert_eq!(status.reset_time - status.window_start, 60);

        limiter
            .check(LimitScope::Token, "8", limit)
            .await
            .expect("other token unaffected");
    }

    #[tokio::test]
    async fn next_window_allows_again() {
        let (clock, _cache, limiter) = limiter();
        let limit = limiter.default_limit(LimitScope::Ip);
        limiter.check(LimitScope::Ip, "192.0.2.1", limit).await.expect("1");
        limiter.check(LimitScope::Ip, "192.0.2.1", limit).await.expect("2");
        assert!(limiter.check(LimitScope::Ip, "192.0.2.1", limit).await.is_err());
        clock.advance(Duration::from_secs(61));
        assert!(limiter.check(LimitScope::Ip, "192.0.2.1", limit).await.is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_local_windows_when_cache_down() {
        let (_clock, cache, limiter) = limiter();
        cache.set_available(false);
        let limit = limiter.default_limit(LimitScope::Ip);
        limiter.check(LimitScope::Ip, "192.0.2.9", limit).await.expect("1");
        limiter.check(LimitScope::Ip, "192.0.2.9", limit).await.expect("2");
        assert!(limiter.check(LimitScope::Ip, "192.0.2.9", limit).await.is_err());
    }

    #[test]
    fn local_windows_gc_drops_idle_keys() {
        let mut local = LocalWindows::default();
        let window = Duration::from_secs(60);
        assert_eq!(local.check_and_record("a", 1_000, window), 0);
        assert_eq!(local.check_and_record("a", 2_000, window), 1);
        assert_eq!(local.check_and_record("b", 70_000, window), 0);
        assert_eq!(local.len(), 1);
        assert_eq!(local.check_and_record("a", 70_500, window), 0);
    }
}
