//! Heartbeat liveness bookkeeping for the client link.
//!
//! Two checks run side by side: time since the last pong must stay within
//! `interval + timeout`, and every ping must be answered within `timeout`.
//! The monitor is plain state; the link's session loop drives it.

use std::time::Duration;

use tokio::time::Instant;

/// Why the heartbeat declared the peer dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// No pong for longer than `interval + timeout`.
    Silent {
        /// Time since the last pong (or since connecting).
        since_pong: Duration,
    },
    /// The outstanding ping was not answered within `timeout`.
    PingUnanswered,
}

impl std::fmt::Display for HeartbeatFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Silent { since_pong } => write!(f, "no pong for {}ms", since_pong.as_millis()),
            Self::PingUnanswered => f.write_str("ping unanswered"),
        }
    }
}

/// Heartbeat state for one connected session.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_pong: Instant,
    ping_deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start monitoring at `now`, which counts as the last pong.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_pong: now,
            ping_deadline: None,
        }
    }

    /// Interval between pings.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A ping went out at `now`. An earlier unanswered ping keeps its deadline.
    pub fn on_ping_sent(&mut self, now: Instant) {
        if self.ping_deadline.is_none() {
            self.ping_deadline = Some(now + self.timeout);
        }
    }

    /// A pong arrived at `now`.
    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.ping_deadline = None;
    }

    /// Deadline of the outstanding ping, if any.
    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_deadline
    }

    /// Time since the last pong.
    pub fn since_pong(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_pong)
    }

    /// Evaluate both checks at `now`.
    pub fn check(&self, now: Instant) -> Result<(), HeartbeatFailure> {
        let since_pong = self.since_pong(now);
        if since_pong > self.interval + self.timeout {
            return Err(HeartbeatFailure::Silent { since_pong });
        }
        if self.ping_deadline.is_some_and(|deadline| now >= deadline) {
            return Err(HeartbeatFailure::PingUnanswered);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_millis(50);

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(INTERVAL, TIMEOUT, now)
    }

    #[test]
    fn fresh_monitor_is_alive() {
        let now = Instant::now();
        assert_eq!(monitor(now).check(now), Ok(()));
    }

    #[test]
    fn unanswered_ping_fails_at_deadline() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.on_ping_sent(t0 + INTERVAL);
        assert_eq!(m.check(t0 + INTERVAL + TIMEOUT - Duration::from_millis(1)), Ok(()));
        assert_eq!(
            m.check(t0 + INTERVAL + TIMEOUT),
            Err(HeartbeatFailure::PingUnanswered)
        );
    }

    #[test]
    fn pong_clears_outstanding_ping() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.on_ping_sent(t0 + INTERVAL);
        m.on_pong(t0 + INTERVAL + Duration::from_millis(10));
        assert!(m.ping_deadline().is_none());
        assert_eq!(m.check(t0 + INTERVAL + TIMEOUT * 2), Ok(()));
    }

    #[test]
    fn silence_beyond_interval_plus_timeout_fails() {
        let t0 = Instant::now();
        let m = monitor(t0);
        let late = t0 + INTERVAL + TIMEOUT + Duration::from_millis(1);
        assert_matches::assert_matches!(m.check(late), Err(HeartbeatFailure::Silent { .. }));
    }

    #[test]
    fn repeated_pings_keep_first_deadline() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.on_ping_sent(t0);
        m.on_ping_sent(t0 + Duration::from_millis(40));
        assert_eq!(m.ping_deadline(), Some(t0 + TIMEOUT));
    }

    #[test]
    fn steady_pongs_stay_alive() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        for i in 1..=10u32 {
            let tick = t0 + INTERVAL * i;
            assert_eq!(m.check(tick), Ok(()));
            m.on_ping_sent(tick);
            m.on_pong(tick + Duration::from_millis(5));
        }
    }

    #[test]
    fn failure_display() {
        let silent = HeartbeatFailure::Silent {
            since_pong: Duration::from_millis(150),
        };
        assert_eq!(silent.to_string(), "no pong for 150ms");
        assert_eq!(HeartbeatFailure::PingUnanswered.to_string(), "ping unanswered");
    }
}
