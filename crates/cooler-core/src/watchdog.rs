//! Liveness watchdog: forces SAFE mode when no control message has arrived
//! within `timeout`.
//!
//! A `tokio::time::interval`-driven ticker comparing "time since last seen"
//! against a timeout, rather than a one-shot sleep that would need
//! rearming on every message.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks the last time a fresh control message was observed and reports
/// whether the subscriber should be considered live.
#[derive(Debug, Clone)]
pub struct LivenessWatchdog {
    timeout: Duration,
    last_seen: Instant,
    tripped: bool,
}

impl LivenessWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: Instant::now(),
            tripped: false,
        }
    }

    /// Call whenever a fresh (not stale-discarded) message is received.
    pub fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
        self.tripped = false;
    }

    /// Call on each watchdog tick. Returns `true` the instant the watchdog
    /// transitions from live to tripped (i.e. "just went stale" — the
    /// caller should emit a FAULT event and demote to SAFE exactly once).
    pub fn check(&mut self) -> bool {
        if self.tripped {
            return false;
        }
        if self.last_seen.elapsed() >= self.timeout {
            self.tripped = true;
            true
        } else {
            false
        }
    }

    pub fn is_live(&self) -> bool {
        !self.tripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn starts_live() {
        let wd = LivenessWatchdog::new(Duration::from_secs(30));
        assert!(wd.is_live());
    }

    #[test]
    fn trips_once_after_timeout() {
        let mut wd = LivenessWatchdog::new(Duration::from_millis(10));
        sleep(Duration::from_millis(20));
        assert!(wd.check(), "first check past timeout should trip");
        assert!(!wd.is_live());
        assert!(!wd.check(), "second check should not re-report the trip");
    }

    #[test]
    fn mark_seen_resets_trip() {
        let mut wd = LivenessWatchdog::new(Duration::from_millis(10));
        sleep(Duration::from_millis(20));
        assert!(wd.check());
        wd.mark_seen();
        assert!(wd.is_live());
    }
}
