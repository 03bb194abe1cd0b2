//! Reconnect coordination
//!
//! Exponential backoff with a hard attempt limit. A successful connection
//! resets the attempt counter, so a long-lived session that drops once
//! gets the full retry budget again.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; no further attempts are scheduled
    GaveUp,
}

#[derive(Debug)]
pub struct ReconnectCoordinator {
    base: Duration,
    growth: f64,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
    state: ReconnectState,
}

impl ReconnectCoordinator {
    pub fn new(base: Duration, growth: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            growth,
            cap,
            max_attempts,
            attempt: 0,
            state: ReconnectState::Disconnected,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// delay(k) = min(base * growth^k, cap)
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.growth.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    /// Schedule the next attempt after a connection loss.
    ///
    /// Returns the backoff delay to sleep before dialing, or None when the
    /// budget is exhausted (state moves to GaveUp).
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            self.state = ReconnectState::GaveUp;
            return None;
        }
        let delay = self.delay(self.attempt);
        self.attempt += 1;
        self.state = ReconnectState::Connecting;
        Some(delay)
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.state = ReconnectState::Connected;
    }

    pub fn on_disconnected(&mut self) {
        if self.state != ReconnectState::GaveUp {
            self.state = ReconnectState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ReconnectCoordinator {
        ReconnectCoordinator::new(Duration::from_secs(1), 2.0, Duration::from_secs(15), 5)
    }

    #[test]
    fn test_delay_table() {
        let c = coordinator();
        assert_eq!(c.delay(0), Duration::from_secs(1));
        assert_eq!(c.delay(1), Duration::from_secs(2));
        assert_eq!(c.delay(2), Duration::from_secs(4));
        assert_eq!(c.delay(3), Duration::from_secs(8));
        // capped
        assert_eq!(c.delay(4), Duration::from_secs(15));
        assert_eq!(c.delay(10), Duration::from_secs(15));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut c = coordinator();
        for _ in 0..5 {
            assert!(c.next_attempt().is_some());
        }
        assert!(c.next_attempt().is_none());
        assert_eq!(c.state(), ReconnectState::GaveUp);
        // stays exhausted
        assert!(c.next_attempt().is_none());
    }

    #[test]
    fn test_connected_resets_budget() {
        let mut c = coordinator();
        for _ in 0..4 {
            c.next_attempt().unwrap();
        }
        c.on_connected();
        assert_eq!(c.state(), ReconnectState::Connected);
        assert_eq!(c.attempt(), 0);

        // full budget available again
        c.on_disconnected();
        for _ in 0..5 {
            assert!(c.next_attempt().is_some());
        }
        assert!(c.next_attempt().is_none());
    }

    #[test]
    fn test_backoff_grows_across_attempts() {
        let mut c = coordinator();
        let first = c.next_attempt().unwrap();
        let second = c.next_attempt().unwrap();
        assert!(second > first);
    }
}
