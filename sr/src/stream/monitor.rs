//! Idle/completion monitor
//!
//! `Active` moves to exactly one of `Completed`, `TimedOut` or `Errored`, and
//! terminal states never change again. Every inbound event resets the idle
//! clock.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Completed,
    TimedOut,
    Errored,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Idle watchdog for one stream
#[derive(Debug)]
pub struct IdleMonitor {
    state: StreamState,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl IdleMonitor {
    pub fn new(idle_timeout: Duration, now: Instant) -> Self {
        debug!(?idle_timeout, "IdleMonitor::new: called");
        Self {
            state: StreamState::Active,
            idle_timeout,
            last_activity: now,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record inbound activity
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Explicit end marker; returns whether the state changed
    pub fn complete(&mut self) -> bool {
        self.transition(StreamState::Completed)
    }

    /// Explicit error marker; returns whether the state changed
    pub fn fail(&mut self) -> bool {
        self.transition(StreamState::Errored)
    }

    /// Evaluate the idle threshold, moving `Active` to `TimedOut` once exceeded
    pub fn check(&mut self, now: Instant) -> StreamState {
        if self.state == StreamState::Active && now.saturating_duration_since(self.last_activity) > self.idle_timeout {
            debug!(idle = ?now.saturating_duration_since(self.last_activity), "IdleMonitor::check: timed out");
            self.state = StreamState::TimedOut;
        }
        self.state
    }

    /// Time left before the idle threshold trips
    pub fn remaining(&self, now: Instant) -> Duration {
        self.idle_timeout
            .saturating_sub(now.saturating_duration_since(self.last_activity))
    }

    fn transition(&mut self, to: StreamState) -> bool {
        if self.state.is_terminal() {
            debug!(from = %self.state, %to, "IdleMonitor::transition: already terminal");
            return false;
        }
        self.state = to;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn test_times_out_after_threshold() {
        let start = Instant::now();
        let mut monitor = IdleMonitor::new(TIMEOUT, start);
        assert_eq!(monitor.check(start + TIMEOUT), StreamState::Active);
        assert_eq!(monitor.check(start + TIMEOUT + Duration::from_millis(1)), StreamState::TimedOut);
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let start = Instant::now();
        let mut monitor = IdleMonitor::new(TIMEOUT, start);
        monitor.touch(start + Duration::from_secs(50));
        assert_eq!(monitor.check(start + Duration::from_secs(100)), StreamState::Active);
        assert_eq!(
            monitor.remaining(start + Duration::from_secs(100)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let start = Instant::now();
        let mut monitor = IdleMonitor::new(TIMEOUT, start);
        assert!(monitor.complete());
        assert!(!monitor.fail());
        assert_eq!(monitor.check(start + TIMEOUT * 2), StreamState::Completed);

        let mut errored = IdleMonitor::new(TIMEOUT, start);
        assert!(errored.fail());
        assert!(!errored.complete());
        assert_eq!(errored.state(), StreamState::Errored);
    }

    #[test]
    fn test_timed_out_cannot_complete() {
        let start = Instant::now();
        let mut monitor = IdleMonitor::new(TIMEOUT, start);
        monitor.check(start + TIMEOUT * 2);
        assert!(!monitor.complete());
        assert_eq!(monitor.state(), StreamState::TimedOut);
    }
}
