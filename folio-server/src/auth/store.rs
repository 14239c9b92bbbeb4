// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Counter stores with Redis `INCR` / `EXPIRE` / `TTL` semantics.

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared key/value store holding per-key counters with an optional expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, creating it at 0 first; returns the new value.
    async fn incr(&self, key: &str) -> anyhow::Result<i64>;

    /// Set `key` to expire after `seconds`; false if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<bool>;

    /// Seconds until `key` expires: `-1` without expiry, `-2` when missing.
    async fn ttl(&self, key: &str) -> anyhow::Result<i64>;
}

#[derive(Debug, Default)]
struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Distinct client keys tracked by the in-process store.
pub const DEFAULT_MAX_COUNTER_KEYS: u64 = 100_000;

/// In-process counter store.
///
/// Expiry is evaluated lazily on access. Entries idle for longer than
/// `idle_eviction` are dropped, and at most `max_keys` are tracked, so memory
/// stays bounded no matter how many distinct clients show up. Idle eviction
/// must not be shorter than the rate-limit window or a quiet client regains
/// its allowance early; [`MemoryCounterStore::for_window`] guarantees that.
pub struct MemoryCounterStore {
    counters: Cache<String, Arc<Mutex<Counter>>>,
}

impl MemoryCounterStore {
    pub fn new(max_keys: u64, idle_eviction: Duration) -> Self {
        let counters = Cache::builder()
            .max_capacity(max_keys)
            .time_to_idle(idle_eviction)
            .build();
        Self { counters }
    }

    /// Store whose idle eviction outlasts a window of length `window`.
    ///
    /// A counter idle for longer than the window has already expired, so
    /// evicting it cannot hand out a fresh allowance mid-window.
    pub fn for_window(max_keys: u64, window: Duration) -> Self {
        Self::new(max_keys, window + Duration::from_secs(1))
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.counters.policy().time_to_idle()
    }

    fn live(&self, key: &str, now: Instant) -> Option<Arc<Mutex<Counter>>> {
        let counter = self.counters.get(key)?;
        if counter.lock().is_expired(now) {
            self.counters.invalidate(key);
            return None;
        }
        Some(counter)
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::for_window(DEFAULT_MAX_COUNTER_KEYS, Duration::from_secs(2 * 3600))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        let counter = self
            .counters
            .get_with(key.to_string(), || Arc::new(Mutex::new(Counter::default())));

        let mut counter = counter.lock();
        if counter.is_expired(now) {
            *counter = Counter::default();
        }
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<bool> {
        let now = Instant::now();
        match self.live(key, now) {
            Some(counter) => {
                counter.lock().expires_at = Some(now + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        let Some(counter) = self.live(key, now) else {
            return Ok(-2);
        };
        let expires_at = counter.lock().expires_at;
        match expires_at {
            None => Ok(-1),
            Some(at) => {
                let left = at.saturating_duration_since(now);
                // Round up so a live key never reports 0
                Ok(left.as_millis().div_ceil(1000) as i64)
            }
        }
    }
}

/// Upstash-compatible Redis REST store.
///
/// Each command is a `POST` of a JSON array (`["INCR", "key"]`) to the base
/// URL with a bearer token; replies are `{"result": ...}` or `{"error": ...}`.
pub struct UpstashCounterStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl std::fmt::Debug for UpstashCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashCounterStore")
            .field("url", &self.url)
            .field("token", &"<REDACTED>")
            .finish()
    }
}

impl UpstashCounterStore {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn command(&self, args: &[&str]) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            anyhow::bail!("Upstash {} failed ({}): {}", args[0], status, error);
        }
        if !status.is_success() {
            anyhow::bail!("Upstash {} failed with status {}", args[0], status);
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Upstash {} reply has no result", args[0]))
    }

    async fn integer_command(&self, args: &[&str]) -> anyhow::Result<i64> {
        let result = self.command(args).await?;
        result
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("Upstash {} returned non-integer: {}", args[0], result))
    }
}

#[async_trait]
impl CounterStore for UpstashCounterStore {
    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        self.integer_command(&["INCR", key]).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<bool> {
        let seconds = seconds.to_string();
        Ok(self.integer_command(&["EXPIRE", key, &seconds]).await? == 1)
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        self.integer_command(&["TTL", key]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_redis_semantics() {
        let store = MemoryCounterStore::default();

        assert_eq!(store.ttl("k").await.unwrap(), -2);
        assert!(!store.expire("k", 10).await.unwrap());

        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.ttl("k").await.unwrap(), -1);
        assert!(store.expire("k", 10).await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), 10);
        assert_eq!(store.incr("k").await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert_eq!(store.ttl("k").await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.ttl("k").await.unwrap(), -2);
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.ttl("k").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_counter_survives_idle_gap_within_window() {
        let store = MemoryCounterStore::for_window(100, Duration::from_secs(2));
        assert!(store.idle_eviction().unwrap() >= Duration::from_secs(2));

        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert!(store.expire("k", 2).await.unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert!(store.ttl("k").await.unwrap() > 0);
    }

    #[test]
    fn test_idle_eviction_covers_long_windows() {
        let window = Duration::from_secs(6 * 3600);
        let store = MemoryCounterStore::for_window(10, window);
        assert!(store.idle_eviction().unwrap() >= window);
    }

    #[tokio::test]
    async fn test_memory_store_keys_are_independent() {
        let store = MemoryCounterStore::default();
        store.incr("a").await.unwrap();
        store.incr("a").await.unwrap();
        assert_eq!(store.incr("b").await.unwrap(), 1);
        assert_eq!(store.incr("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upstash_commands() {
        let mut server = mockito::Server::new_async().await;
        let incr = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::Json(json!(["INCR", "chat:ip:1.2.3.4"])))
            .with_status(200)
            .with_body(r#"{"result":1}"#)
            .create_async()
            .await;
        let expire = server
            .mock("POST", "/")
            .match_body(Matcher::Json(json!(["EXPIRE", "chat:ip:1.2.3.4", "3600"])))
            .with_status(200)
            .with_body(r#"{"result":1}"#)
            .create_async()
            .await;
        let ttl = server
            .mock("POST", "/")
            .match_body(Matcher::Json(json!(["TTL", "chat:ip:1.2.3.4"])))
            .with_status(200)
            .with_body(r#"{"result":3599}"#)
            .create_async()
            .await;

        let store = UpstashCounterStore::new(server.url(), "secret").unwrap();
        assert_eq!(store.incr("chat:ip:1.2.3.4").await.unwrap(), 1);
        assert!(store.expire("chat:ip:1.2.3.4", 3600).await.unwrap());
        assert_eq!(store.ttl("chat:ip:1.2.3.4").await.unwrap(), 3599);

        incr.assert_async().await;
        expire.assert_async().await;
        ttl.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstash_error_reply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(401)
            .with_body(r#"{"error":"WRONGPASS invalid password"}"#)
            .create_async()
            .await;

        let store = UpstashCounterStore::new(server.url(), "bad").unwrap();
        let err = store.incr("k").await.unwrap_err();
        assert!(err.to_string().contains("WRONGPASS"));
    }
}
