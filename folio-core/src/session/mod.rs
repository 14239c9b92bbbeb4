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

//! Client-side session guard.
//!
//! A coarse per-client quota plus a minimum spacing between messages, kept in
//! client-local storage. This is a UX throttle: a client can wipe its storage
//! and start over at any time, so the server-side IP rate limiter remains the
//! authoritative control.

mod storage;

pub use storage::{FileStorage, MemoryStorage, SessionStorage};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage key the session blob is kept under.
pub const SESSION_STORAGE_KEY: &str = "chatbot_session";

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Persisted session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Messages sent in the current window.
    pub count: u32,
    /// When the current window ends (epoch millis).
    pub reset_at: i64,
    /// When the last message was sent (epoch millis, 0 if never).
    pub last_message_at: i64,
}

impl ChatSession {
    fn fresh(now: i64, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + window.as_millis() as i64,
            last_message_at: 0,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        now > self.reset_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_messages: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages: 15,
            window: Duration::from_secs(3600),
            cooldown: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimit,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCheck {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
}

impl SendCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn blocked(reason: BlockReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

pub struct SessionGuard<S, C = SystemClock> {
    storage: S,
    limits: SessionLimits,
    clock: C,
}

impl<S: SessionStorage> SessionGuard<S, SystemClock> {
    pub fn new(storage: S, limits: SessionLimits) -> Self {
        Self::with_clock(storage, limits, SystemClock)
    }
}

impl<S: SessionStorage, C: Clock> SessionGuard<S, C> {
    pub fn with_clock(storage: S, limits: SessionLimits, clock: C) -> Self {
        Self {
            storage,
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Current session, replacing a missing, unreadable or expired one with a
    /// fresh record.
    pub fn session(&self) -> ChatSession {
        let now = self.clock.now_millis();
        let stored = match self.storage.get(SESSION_STORAGE_KEY) {
            Ok(blob) => blob.and_then(|b| serde_json::from_str::<ChatSession>(&b).ok()),
            Err(e) => {
                tracing::warn!("Failed to read chat session: {}", e);
                None
            }
        };

        match stored {
            Some(session) if !session.is_expired(now) => session,
            _ => {
                let session = ChatSession::fresh(now, self.limits.window);
                if let Err(e) = self.save(&session) {
                    tracing::warn!("Failed to store fresh chat session: {}", e);
                }
                session
            }
        }
    }

    /// Whether another message may be sent right now.
    pub fn can_send(&self) -> SendCheck {
        let session = self.session();
        if session.count >= self.limits.max_messages {
            return SendCheck::blocked(BlockReason::RateLimit);
        }

        let since_last = self.clock.now_millis() - session.last_message_at;
        if since_last < self.limits.cooldown.as_millis() as i64 {
            return SendCheck::blocked(BlockReason::Cooldown);
        }

        SendCheck::allowed()
    }

    /// Record a successfully sent message.
    pub fn increment(&self) -> Result<ChatSession> {
        let mut session = self.session();
        session.count += 1;
        session.last_message_at = self.clock.now_millis();
        self.save(&session)?;
        Ok(session)
    }

    /// Messages left in the current window.
    pub fn remaining(&self) -> u32 {
        self.limits.max_messages.saturating_sub(self.session().count)
    }

    /// Whole minutes until the window resets, rounded up.
    pub fn minutes_until_reset(&self) -> i64 {
        let remaining_ms = self.session().reset_at - self.clock.now_millis();
        if remaining_ms <= 0 {
            return 0;
        }
        (remaining_ms + 59_999) / 60_000
    }

    /// Forget the stored session entirely.
    pub fn reset(&self) -> Result<()> {
        self.storage.remove(SESSION_STORAGE_KEY)
    }

    fn save(&self, session: &ChatSession) -> Result<()> {
        let blob = serde_json::to_string(session)?;
        self.storage.set(SESSION_STORAGE_KEY, &blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    const START: i64 = 1_700_000_000_000;

    #[derive(Clone)]
    struct ManualClock(Arc<AtomicI64>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(AtomicI64::new(START)))
        }

        fn advance_ms(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn guard(clock: &ManualClock) -> SessionGuard<MemoryStorage, ManualClock> {
        SessionGuard::with_clock(MemoryStorage::new(), SessionLimits::default(), clock.clone())
    }

    #[test]
    fn test_first_use_creates_fresh_session() {
        let clock = ManualClock::new();
        let guard = guard(&clock);

        let session = guard.session();
        assert_eq!(session.count, 0);
        assert_eq!(session.reset_at, START + 3_600_000);
        assert_eq!(session.last_message_at, 0);
        assert_eq!(guard.can_send(), SendCheck::allowed());
        assert_eq!(guard.remaining(), 15);
        assert_eq!(guard.minutes_until_reset(), 60);
    }

    #[test]
    fn test_quota_blocks_after_fifteen_messages() {
        let clock = ManualClock::new();
        let guard = guard(&clock);

        for _ in 0..15 {
            assert!(guard.can_send().allowed);
            guard.increment().unwrap();
            clock.advance_ms(3_000);
        }

        assert_eq!(guard.remaining(), 0);
        assert_eq!(guard.can_send(), SendCheck::blocked(BlockReason::RateLimit));

        // Still blocked right up to the reset instant
        let until_reset = guard.session().reset_at - clock.now_millis();
        clock.advance_ms(until_reset);
        assert_eq!(guard.can_send(), SendCheck::blocked(BlockReason::RateLimit));

        clock.advance_ms(1);
        assert_eq!(guard.can_send(), SendCheck::allowed());
        assert_eq!(guard.remaining(), 15);
    }

    #[test]
    fn test_cooldown_between_messages() {
        let clock = ManualClock::new();
        let guard = guard(&clock);

        guard.increment().unwrap();
        clock.advance_ms(2_999);
        assert_eq!(guard.can_send(), SendCheck::blocked(BlockReason::Cooldown));

        clock.advance_ms(1);
        assert_eq!(guard.can_send(), SendCheck::allowed());
    }

    #[test]
    fn test_minutes_until_reset_rounds_up() {
        let clock = ManualClock::new();
        let guard = guard(&clock);
        guard.session();

        clock.advance_ms(60_000 * 59 + 1);
        assert_eq!(guard.minutes_until_reset(), 1);

        clock.advance_ms(60_000);
        assert_eq!(guard.minutes_until_reset(), 60);
    }

    #[test]
    fn test_corrupt_blob_yields_fresh_session() {
        let clock = ManualClock::new();
        let storage = MemoryStorage::new();
        storage.set(SESSION_STORAGE_KEY, "{not json").unwrap();
        let guard = SessionGuard::with_clock(storage, SessionLimits::default(), clock);

        assert_eq!(guard.session().count, 0);
        assert_eq!(guard.remaining(), 15);
    }

    #[test]
    fn test_reset_clears_stored_session() {
        let clock = ManualClock::new();
        let guard = guard(&clock);
        guard.increment().unwrap();
        assert_eq!(guard.remaining(), 14);

        guard.reset().unwrap();
        assert_eq!(guard.remaining(), 15);
    }

    #[test]
    fn test_session_blob_uses_camel_case() {
        let session = ChatSession {
            count: 2,
            reset_at: 10,
            last_message_at: 5,
        };
        let json = serde_json::to_value(session).unwrap();
        assert_eq!(json["resetAt"], 10);
        assert_eq!(json["lastMessageAt"], 5);
    }
}
