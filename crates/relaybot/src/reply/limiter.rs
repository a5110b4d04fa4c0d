//! Sliding quota on passive replies, keyed by inbound message id.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Records are swept once the tracked-id count passes this mark.
const SWEEP_HIGH_WATER: usize = 512;

// ============================================================================
// Clock
// ============================================================================

/// Injectable time source so window math is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Why a denied caller must fall back to a proactive send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The reply window for this message id has closed for good.
    Expired,
    /// The quota inside the window is used up.
    LimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    Allowed { remaining: u32 },
    Denied { reason: FallbackReason },
}

impl ReplyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

// ============================================================================
// ReplyRateLimiter
// ============================================================================

struct QuotaRecord {
    count: u32,
    first_reply_at: Instant,
}

/// At most `max_replies` passive replies per inbound id, within `window`
/// of the first reply. Once the window elapses the passive channel for
/// that id is closed permanently — a later check reports `Expired`, never
/// a fresh allowance.
pub struct ReplyRateLimiter<C: Clock = SystemClock> {
    records: DashMap<String, QuotaRecord>,
    max_replies: u32,
    window: Duration,
    clock: C,
}

impl ReplyRateLimiter<SystemClock> {
    pub fn new(max_replies: u32, window: Duration) -> Self {
        Self::with_clock(max_replies, window, SystemClock)
    }
}

impl<C: Clock> ReplyRateLimiter<C> {
    pub fn with_clock(max_replies: u32, window: Duration, clock: C) -> Self {
        Self {
            records: DashMap::new(),
            max_replies,
            window,
            clock,
        }
    }

    /// Decide whether another passive reply to `id` is allowed right now.
    pub fn check(&self, id: &str) -> ReplyDecision {
        let Some(record) = self.records.get(id) else {
            return ReplyDecision::Allowed {
                remaining: self.max_replies,
            };
        };

        if self.clock.now().duration_since(record.first_reply_at) >= self.window {
            return ReplyDecision::Denied {
                reason: FallbackReason::Expired,
            };
        }

        if record.count >= self.max_replies {
            return ReplyDecision::Denied {
                reason: FallbackReason::LimitExceeded,
            };
        }

        ReplyDecision::Allowed {
            remaining: self.max_replies - record.count,
        }
    }

    /// Count one passive reply against `id`.
    pub fn record(&self, id: &str) {
        let now = self.clock.now();
        let mut entry = self.records.entry(id.to_string()).or_insert(QuotaRecord {
            count: 0,
            first_reply_at: now,
        });
        if now.duration_since(entry.first_reply_at) >= self.window {
            // The old window is gone; this reply opens a fresh one.
            entry.count = 0;
            entry.first_reply_at = now;
        }
        entry.count += 1;
        drop(entry);

        self.sweep_if_crowded(now);
    }

    /// Number of ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    fn sweep_if_crowded(&self, now: Instant) {
        if self.records.len() <= SWEEP_HIGH_WATER {
            return;
        }
        let window = self.window;
        let before = self.records.len();
        self.records
            .retain(|_, record| now.duration_since(record.first_reply_at) < window);
        debug!(
            before,
            after = self.records.len(),
            "Swept expired reply-quota records"
        );
    }
}
