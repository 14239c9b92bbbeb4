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

//! Ordered API-key fallback for upstream calls.
//!
//! Keys are tried in configuration order. A key whose call fails with a
//! quota or throttling error is parked in a failed set for the configured
//! reset interval and skipped by later requests until it expires.

use moka::sync::Cache;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Substrings that mark an upstream failure as a quota/throttling problem.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "ratelimit",
    "rate-limit",
    "429",
    "resource_exhausted",
    "too many requests",
];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no upstream API keys configured")]
    NoKeys,

    #[error("all upstream API keys exhausted after {attempts} attempt(s)")]
    AllKeysExhausted {
        attempts: usize,
        #[source]
        last_error: anyhow::Error,
    },

    /// Every key was parked and the retry on the first key was throttled too.
    #[error("upstream provider is throttling requests")]
    Throttled(#[source] anyhow::Error),

    #[error("upstream request failed")]
    Upstream(#[source] anyhow::Error),
}

impl DispatchError {
    /// Message plus the full upstream cause chain, for logs.
    pub fn detail(&self) -> String {
        match self {
            DispatchError::NoKeys => self.to_string(),
            DispatchError::AllKeysExhausted { last_error: cause, .. }
            | DispatchError::Throttled(cause)
            | DispatchError::Upstream(cause) => format!("{}: {:#}", self, cause),
        }
    }
}

/// A single attempt did not finish within the per-attempt deadline.
#[derive(Debug, Error)]
#[error("upstream request timed out after {0:?}")]
pub struct UpstreamTimeout(pub Duration);

pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Whether an attempt error should move on to the next key.
pub fn is_retriable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<UpstreamTimeout>().is_some() {
        return true;
    }
    is_quota_message(&format!("{:#}", err))
}

pub struct KeyDispatcher {
    keys: Vec<String>,
    /// Indices of keys currently parked; entries expire after the reset interval.
    failed: Cache<usize, ()>,
    attempt_timeout: Duration,
}

impl KeyDispatcher {
    pub fn new(keys: Vec<String>, reset_interval: Duration, attempt_timeout: Duration) -> Self {
        let failed = Cache::builder()
            .max_capacity(keys.len().max(1) as u64)
            .time_to_live(reset_interval)
            .build();

        Self {
            keys,
            failed,
            attempt_timeout,
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_failed(&self, index: usize) -> bool {
        self.failed.contains_key(&index)
    }

    pub fn failed_count(&self) -> usize {
        (0..self.keys.len()).filter(|i| self.is_failed(*i)).count()
    }

    pub fn mark_failed(&self, index: usize) {
        self.failed.insert(index, ());
    }

    /// Forget every parked key.
    pub fn reset(&self) {
        self.failed.invalidate_all();
    }

    /// Run `operation` with each usable key in order until one succeeds.
    ///
    /// The operation receives the key to use. Errors that are not quota or
    /// timeout related stop the fallback immediately. Dropping the returned
    /// future abandons the in-flight attempt.
    pub async fn with_fallback<T, F, Fut>(&self, mut operation: F) -> Result<T, DispatchError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.keys.is_empty() {
            return Err(DispatchError::NoKeys);
        }

        if self.failed_count() == self.keys.len() {
            warn!(
                keys = self.keys.len(),
                "All upstream keys are parked; clearing and retrying the first key"
            );
            self.reset();

            return match self.attempt(0, &mut operation).await {
                Ok(value) => Ok(value),
                Err(err) if is_retriable(&err) => {
                    self.mark_failed(0);
                    Err(DispatchError::Throttled(err))
                }
                Err(err) => Err(DispatchError::Upstream(err)),
            };
        }

        let mut attempts = 0;
        let mut last_error = None;

        for index in 0..self.keys.len() {
            if self.is_failed(index) {
                debug!(key_index = index, "Skipping parked upstream key");
                continue;
            }

            attempts += 1;
            match self.attempt(index, &mut operation).await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(
                            key_index = index,
                            attempts, "Upstream call succeeded on fallback key"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if is_retriable(&err) => {
                    warn!(
                        key_index = index,
                        error = %err,
                        "Upstream key throttled; trying next key"
                    );
                    self.mark_failed(index);
                    last_error = Some(err);
                }
                Err(err) => return Err(DispatchError::Upstream(err)),
            }
        }

        Err(DispatchError::AllKeysExhausted {
            attempts,
            last_error: last_error
                .unwrap_or_else(|| anyhow::anyhow!("no usable upstream key was available")),
        })
    }

    async fn attempt<T, F, Fut>(&self, index: usize, operation: &mut F) -> anyhow::Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = self.keys[index].clone();
        match tokio::time::timeout(self.attempt_timeout, operation(key)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamTimeout(self.attempt_timeout).into()),
        }
    }
}

impl std::fmt::Debug for KeyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDispatcher")
            .field("keys", &self.keys.len())
            .field("failed", &self.failed_count())
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn dispatcher(keys: &[&str]) -> KeyDispatcher {
        KeyDispatcher::new(
            keys.iter().map(|k| k.to_string()).collect(),
            Duration::from_secs(300),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_quota_classification() {
        assert!(is_quota_message("Quota exceeded for project"));
        assert!(is_quota_message("Gemini API error (429): slow down"));
        assert!(is_quota_message("Rate limit reached"));
        assert!(is_quota_message("RESOURCE_EXHAUSTED"));
        assert!(!is_quota_message("invalid argument"));
        assert!(is_retriable(&UpstreamTimeout(Duration::from_secs(1)).into()));
        assert!(!is_retriable(&anyhow!("connection refused")));
    }

    #[tokio::test]
    async fn test_falls_back_until_success() {
        let dispatcher = dispatcher(&["k1", "k2", "k3"]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = dispatcher
            .with_fallback(|key| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(key.clone());
                    if key == "k3" {
                        Ok("hello".to_string())
                    } else {
                        Err(anyhow!("quota exceeded"))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "hello");
        assert_eq!(*seen.lock(), vec!["k1", "k2", "k3"]);
        assert!(dispatcher.is_failed(0));
        assert!(dispatcher.is_failed(1));
        assert!(!dispatcher.is_failed(2));

        // Parked keys are skipped on the next request.
        seen.lock().clear();
        dispatcher
            .with_fallback(|key| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(key);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["k3"]);
    }

    #[tokio::test]
    async fn test_all_keys_exhausted() {
        let dispatcher = dispatcher(&["k1", "k2", "k3"]);

        let err = dispatcher
            .with_fallback(|_key| async { Err::<(), _>(anyhow!("429 Too Many Requests")) })
            .await
            .unwrap_err();

        match err {
            DispatchError::AllKeysExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(dispatcher.failed_count(), 3);
    }

    #[tokio::test]
    async fn test_non_quota_error_stops_fallback() {
        let dispatcher = dispatcher(&["k1", "k2"]);
        let calls = Arc::new(Mutex::new(0));

        let err = dispatcher
            .with_fallback(|_key| {
                let calls = calls.clone();
                async move {
                    *calls.lock() += 1;
                    Err::<(), _>(anyhow!("invalid request payload"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Upstream(_)));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(dispatcher.failed_count(), 0);
    }

    #[tokio::test]
    async fn test_all_parked_retries_first_key() {
        let dispatcher = dispatcher(&["k1", "k2"]);
        dispatcher.mark_failed(0);
        dispatcher.mark_failed(1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = dispatcher
            .with_fallback(|key| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(key);
                    Err::<(), _>(anyhow!("quota exceeded"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Throttled(_)));
        assert_eq!(*seen.lock(), vec!["k1"]);
        assert!(dispatcher.is_failed(0));
        assert!(!dispatcher.is_failed(1));

        let ok = dispatcher
            .with_fallback(|key| async move { Ok(key) })
            .await
            .unwrap();
        assert_eq!(ok, "k2");
    }

    #[tokio::test]
    async fn test_timeout_moves_to_next_key() {
        let dispatcher = KeyDispatcher::new(
            vec!["slow".to_string(), "fast".to_string()],
            Duration::from_secs(300),
            Duration::from_millis(50),
        );

        let result = dispatcher
            .with_fallback(|key| async move {
                if key == "slow" {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(key)
            })
            .await
            .unwrap();

        assert_eq!(result, "fast");
        assert!(dispatcher.is_failed(0));
    }

    #[tokio::test]
    async fn test_no_keys() {
        let dispatcher = dispatcher(&[]);
        assert!(!dispatcher.has_keys());
        let err = dispatcher
            .with_fallback(|_key| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoKeys));
    }

    #[test]
    fn test_parked_keys_expire() {
        let dispatcher = KeyDispatcher::new(
            vec!["k1".to_string()],
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        dispatcher.mark_failed(0);
        assert!(dispatcher.is_failed(0));
        std::thread::sleep(Duration::from_millis(120));
        assert!(!dispatcher.is_failed(0));
    }
}
