// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-window IP rate limiting
//!
//! Each client IP gets a counter `<prefix>:ip:<ip>` in the shared store. The
//! first increment in a window arms the key's expiry; the window ends when the
//! key expires. A fixed window lets a client burst up to twice the nominal rate
//! across a window boundary, which is accepted in exchange for two store round
//! trips per request and no per-request bookkeeping.

use super::store::CounterStore;
use crate::config::RateLimitConfig;
use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Seconds until the window resets
    pub reset_in_seconds: u64,
}

/// Rate limiter backed by a shared [`CounterStore`].
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key_for(&self, ip: &str) -> String {
        format!("{}:ip:{}", self.config.key_prefix, ip)
    }

    /// Count one request from `ip` and decide whether it may proceed.
    ///
    /// Store failures are returned to the caller, which owns the fail-open /
    /// fail-closed decision.
    pub async fn check_and_increment(&self, ip: &str) -> anyhow::Result<RateLimitDecision> {
        if !self.config.enabled {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: self.config.max_requests,
                reset_in_seconds: self.config.window_secs,
            });
        }

        let key = self.key_for(ip);
        let count = self.store.incr(&key).await?;
        if count == 1 {
            self.store.expire(&key, self.config.window_secs).await?;
        }

        let mut ttl = self.store.ttl(&key).await?;
        if ttl == -1 {
            // Counter survived without an expiry (e.g. EXPIRE failed after INCR);
            // arm it now or the client would stay locked out forever.
            tracing::warn!(key = %key, "Rate limit counter had no expiry, re-arming");
            self.store.expire(&key, self.config.window_secs).await?;
            ttl = self.config.window_secs as i64;
        }

        let reset_in_seconds = if ttl > 0 {
            ttl as u64
        } else {
            self.config.window_secs
        };
        let max = i64::from(self.config.max_requests);

        Ok(RateLimitDecision {
            allowed: count <= max,
            remaining: (max - count).max(0) as u32,
            reset_in_seconds,
        })
    }
}

/// Extract client IP from request headers
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    // Try X-Forwarded-For first (proxy/load balancer)
    if let Some(forwarded) = headers.get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            // Take first IP (client IP)
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    // Try X-Real-IP (nginx)
    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(ip_str) = real_ip.to_str() {
            let ip_str = ip_str.trim();
            if !ip_str.is_empty() {
                return Some(ip_str.to_string());
            }
        }
    }

    None
}

/// Client IP from proxy headers (when trusted), else the socket peer, else
/// `"unknown"`.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    trust_proxy_headers
        .then(|| extract_client_ip(headers))
        .flatten()
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCounterStore;
    use async_trait::async_trait;
    use axum::http::HeaderValue;

    fn limiter(max_requests: u32) -> RateLimiter {
        let config = RateLimitConfig {
            max_requests,
            ..Default::default()
        };
        RateLimiter::new(config, Arc::new(MemoryCounterStore::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window() {
        let limiter = limiter(15);

        for n in 1..=15u32 {
            let decision = limiter.check_and_increment("1.2.3.4").await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", n);
            assert_eq!(decision.remaining, 15 - n);
            assert_eq!(decision.reset_in_seconds, 3600);
        }

        tokio::time::advance(std::time::Duration::from_secs(600)).await;
        let decision = limiter.check_and_increment("1.2.3.4").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_in_seconds, 3000);

        // Other clients are unaffected
        assert!(limiter.check_and_increment("5.6.7.8").await.unwrap().allowed);

        // A new window starts once the key expires
        tokio::time::advance(std::time::Duration::from_secs(3000)).await;
        let decision = limiter.check_and_increment("1.2.3.4").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 14);
        assert_eq!(decision.reset_in_seconds, 3600);
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled() {
        let config = RateLimitConfig {
            max_requests: 1,
            enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, Arc::new(MemoryCounterStore::default()));

        for _ in 0..100 {
            assert!(limiter.check_and_increment("test_client").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_missing_expiry_is_rearmed() {
        let store = Arc::new(MemoryCounterStore::default());
        store.incr("chat_ratelimit:ip:9.9.9.9").await.unwrap();
        let limiter = RateLimiter::new(RateLimitConfig::default(), store.clone());

        let decision = limiter.check_and_increment("9.9.9.9").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 13);
        assert!(store.ttl("chat_ratelimit:ip:9.9.9.9").await.unwrap() > 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr(&self, _key: &str) -> anyhow::Result<i64> {
            anyhow::bail!("connection refused")
        }
        async fn expire(&self, _key: &str, _seconds: u64) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
        async fn ttl(&self, _key: &str) -> anyhow::Result<i64> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), Arc::new(BrokenStore));
        assert!(limiter.check_and_increment("1.1.1.1").await.is_err());
    }

    #[test]
    fn test_client_ip_resolution() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None, true), "unknown");
        assert_eq!(client_ip(&headers, Some(peer), true), "10.0.0.7");

        headers.insert("X-Real-IP", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, Some(peer), true), "198.51.100.2");

        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.9, 70.41.3.18"),
        );
        assert_eq!(client_ip(&headers, Some(peer), true), "203.0.113.9");
    }

    #[test]
    fn test_untrusted_proxy_headers_use_peer() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9"));
        headers.insert("X-Real-IP", HeaderValue::from_static("198.51.100.2"));

        assert_eq!(client_ip(&headers, Some(peer), false), "10.0.0.7");
        assert_eq!(client_ip(&headers, None, false), "unknown");
    }
}
