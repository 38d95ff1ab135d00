use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;

use super::{Cache, CacheError};

#[derive(Clone, Debug)]
pub struct RedisCache {
    client: redis::Client,
    prefix: String,
}

impl RedisCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: String::new(),
        })
    }

    /// Namespaces every key and channel; empty keeps the bare key layout.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(self.key("__ping__")).await?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(self.key(key), value, ttl_secs(ttl)).await?;
            }
            None => {
                let _: () = conn.set(self.key(key), value).await?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(self.key(key)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        member: &str,
    ) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let cutoff = now_ms.saturating_sub(window.as_millis() as i64);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(&key, "-inf", cutoff)
            .ignore()
            .zcard(&key)
            .zadd(&key, member, now_ms)
            .ignore()
            .expire(&key, ttl_secs(window) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.publish(self.key(channel), message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.key(channel)).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn redis_url() -> Option<String> {
        env_nonempty("HEIMDALL_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
    }

    fn unique_prefix() -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "heimdall-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[tokio::test]
    async fn redis_replay_guard_and_window() {
        let Some(url) = redis_url() else {
            return;
        };
        let cache = RedisCache::new(url).expect("client").with_prefix(unique_prefix());
        cache.ping().await.expect("ping");

        assert!(cache.set_nx("replay:r1", "1", Duration::from_secs(30)).await.expect("nx"));
        assert!(!cache.set_nx("replay:r1", "1", Duration::from_secs(30)).await.expect("nx"));

        let window = Duration::from_secs(60);
        assert_eq!(cache.sliding_window("w", 1_000, window, "a").await.expect("w"), 0);
        assert_eq!(cache.sliding_window("w", 1_001, window, "b").await.expect("w"), 1);
        assert_eq!(cache.incr("c", window).await.expect("incr"), 1);
    }
}
