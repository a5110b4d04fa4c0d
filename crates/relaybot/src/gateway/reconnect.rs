//! Reconnect pacing: delay table, attempt budget, quick-disconnect guard.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Delay per consecutive failed attempt; past the end, the last entry holds.
const DELAY_TABLE: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Delay applied when the server signals a rate-limit condition, and by the
/// quick-disconnect guard. Overrides the table.
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// A connection that lived shorter than this counts as a quick disconnect.
const QUICK_DISCONNECT_THRESHOLD: Duration = Duration::from_secs(10);

/// Consecutive quick disconnects before the guard trips.
const QUICK_DISCONNECT_CAP: u32 = 3;

/// Per-supervisor reconnect state. Not persisted; reset on a successful
/// handshake.
pub(crate) struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    last_connect_at: Option<Instant>,
    quick_disconnects: u32,
    /// Set when capability negotiation bottoms out; the next connect must
    /// re-exchange credentials before identifying.
    pub refresh_token_on_next_connect: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            last_connect_at: None,
            quick_disconnects: 0,
            refresh_token_on_next_connect: false,
        }
    }

    /// Note that a socket just connected.
    pub fn on_connect(&mut self) {
        self.last_connect_at = Some(Instant::now());
    }

    /// Note a completed handshake: the connection is good, all failure
    /// accounting resets.
    pub fn on_handshake_complete(&mut self) {
        self.attempts = 0;
        self.quick_disconnects = 0;
        self.refresh_token_on_next_connect = false;
    }

    /// Account for a dropped connection and pick the delay before the next
    /// attempt. Returns `None` when the attempt budget is spent.
    ///
    /// The quick-disconnect guard watches for a run of connections that die
    /// almost immediately — the signature of a rejected credential or a
    /// misconfigured account — and stretches one delay to the rate-limit
    /// value instead of hammering the gateway.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            return None;
        }

        // Only an actual connection updates the run; a failed connect
        // attempt neither extends nor clears it.
        if let Some(connected_at) = self.last_connect_at.take() {
            if connected_at.elapsed() < QUICK_DISCONNECT_THRESHOLD {
                self.quick_disconnects += 1;
                if self.quick_disconnects >= QUICK_DISCONNECT_CAP {
                    warn!(
                        run = self.quick_disconnects,
                        delay_secs = RATE_LIMIT_DELAY.as_secs(),
                        "Quick-disconnect run detected, applying long delay"
                    );
                    self.quick_disconnects = 0;
                    return Some(RATE_LIMIT_DELAY);
                }
            } else {
                self.quick_disconnects = 0;
            }
        }

        let index = (self.attempts as usize - 1).min(DELAY_TABLE.len() - 1);
        Some(DELAY_TABLE[index])
    }

    /// The fixed long delay for a server-signaled rate-limit condition.
    /// Still consumes an attempt from the budget.
    pub fn rate_limited_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        (self.attempts <= self.max_attempts).then_some(RATE_LIMIT_DELAY)
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn delay_table_walks_then_caps() {
        let mut policy = ReconnectPolicy::new(100);
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(policy.next_delay().unwrap());
        }
        assert_eq!(&delays[..6], DELAY_TABLE);
        assert_eq!(delays[6], *DELAY_TABLE.last().unwrap());
        assert_eq!(delays[7], *DELAY_TABLE.last().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_exhausts() {
        let mut policy = ReconnectPolicy::new(2);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_resets_attempt_accounting() {
        let mut policy = ReconnectPolicy::new(100);
        for _ in 0..5 {
            policy.next_delay();
        }
        policy.on_handshake_complete();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay().unwrap(), DELAY_TABLE[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn three_quick_disconnects_trip_the_guard_once() {
        let mut policy = ReconnectPolicy::new(100);
        let mut long_delays = 0;

        for _ in 0..3 {
            policy.on_connect();
            advance(Duration::from_secs(1)).await; // dies well under threshold
            if policy.next_delay().unwrap() == RATE_LIMIT_DELAY {
                long_delays += 1;
            }
        }
        assert_eq!(long_delays, 1, "the guard trips exactly once for the run");

        // Counter was reset: the next quick disconnect starts a fresh run.
        policy.on_connect();
        advance(Duration::from_secs(1)).await;
        assert_ne!(policy.next_delay().unwrap(), RATE_LIMIT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_connection_clears_the_run() {
        let mut policy = ReconnectPolicy::new(100);

        policy.on_connect();
        advance(Duration::from_secs(1)).await;
        policy.next_delay();

        policy.on_connect();
        advance(Duration::from_secs(1)).await;
        policy.next_delay();

        // A healthy connection lifetime breaks the streak.
        policy.on_connect();
        advance(Duration::from_secs(60)).await;
        policy.next_delay();

        policy.on_connect();
        advance(Duration::from_secs(1)).await;
        assert_ne!(
            policy.next_delay().unwrap(),
            RATE_LIMIT_DELAY,
            "streak restarted from zero"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delay_is_long_and_budgeted() {
        let mut policy = ReconnectPolicy::new(1);
        assert_eq!(policy.rate_limited_delay(), Some(RATE_LIMIT_DELAY));
        assert_eq!(policy.rate_limited_delay(), None);
    }
}
