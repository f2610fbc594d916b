//! Fault Detector: combines commanded valve state and
//! smoothed flow samples into a [`FaultState`], with hysteretic recovery.
//!
//! Guard durations (grace periods, recover hold) are tracked as explicit
//! state plus threshold checks rather than nested conditionals, so each
//! transition's timing rule reads as one `if`.

use std::time::{Duration, Instant};

use crate::config::FaultConfig;
use crate::model::{FaultState, FlowEstimate};

/// How long the opposing condition must hold before a transition (into or
/// out of a fault) is confirmed.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    state: FaultState,
    since: Instant,
}

/// Hysteretic fault state machine.
pub struct FaultDetector {
    config: FaultConfig,
    current: FaultState,
    /// When the valve was last commanded open/closed (for grace periods).
    valve_open_since: Option<Instant>,
    valve_closed_since: Option<Instant>,
    /// Since when `stddev/mean > noise_ratio` has held continuously.
    unstable_since: Option<Instant>,
    /// A candidate transition awaiting its hold duration.
    candidate: Option<Candidate>,
}

impl FaultDetector {
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            current: FaultState::Ok,
            valve_open_since: None,
            valve_closed_since: None,
            unstable_since: None,
            candidate: None,
        }
    }

    pub fn state(&self) -> FaultState {
        self.current
    }

    /// Call whenever the commanded valve state changes, so grace periods
    /// are measured from the correct edge.
    pub fn on_valve_command(&mut self, open: bool, now: Instant) {
        if open {
            self.valve_open_since.get_or_insert(now);
            self.valve_closed_since = None;
        } else {
            self.valve_closed_since.get_or_insert(now);
            self.valve_open_since = None;
        }
    }

    /// Feed one flow estimate tick; returns `Some(new_state)` only on the
    /// tick the state actually transitions (so callers emit exactly one
    /// FAULT/RECOVER event per transition).
    pub fn step(&mut self, estimate: FlowEstimate, now: Instant) -> Option<FaultState> {
        let desired = self.classify(estimate, now);

        // FLOW_WHILE_CLOSED is a suspected stuck-open valve or leak — per
        // the resolved open question it does not clear on its own unless an
        // operator has opted into `auto_recover_sec`; flow reading clean is
        // not by itself proof the valve seated.
        if self.current == FaultState::FlowWhileClosed
            && desired == FaultState::Ok
            && self.config.auto_recover_sec.is_none()
        {
            self.candidate = None;
            return None;
        }

        if desired == self.current {
            self.candidate = None;
            return None;
        }

        let hold = if desired == FaultState::Ok && self.current == FaultState::FlowWhileClosed {
            Duration::from_secs(self.config.auto_recover_sec.unwrap_or(self.config.recover_hold_sec))
        } else if desired == FaultState::Ok {
            Duration::from_secs(self.config.recover_hold_sec)
        } else {
            Duration::ZERO
        };

        match self.candidate {
            Some(c) if c.state == desired => {
                if now.duration_since(c.since) >= hold {
                    self.current = desired;
                    self.candidate = None;
                    return Some(desired);
                }
            }
            _ => {
                self.candidate = Some(Candidate {
                    state: desired,
                    since: now,
                });
                if hold == Duration::ZERO {
                    self.current = desired;
                    self.candidate = None;
                    return Some(desired);
                }
            }
        }
        None
    }

    fn classify(&mut self, estimate: FlowEstimate, now: Instant) -> FaultState {
        // An empty window (no samples at all) is an immediate boundary
        // case per the sampler's contract, not subject to the noise-ratio
        // hold below — a real flow window never goes empty in steady
        // state, so this only fires on outright sensor dropout.
        if estimate.n == 0 {
            return FaultState::Unstable;
        }

        if let Some(since) = self.valid_unstable_edge(estimate, now) {
            if now.duration_since(since) >= Duration::from_secs(self.config.unstable_window_sec) {
                return FaultState::Unstable;
            }
        }

        if let Some(open_since) = self.valve_open_since {
            if now.duration_since(open_since) >= Duration::from_secs(self.config.grace_open_sec)
                && estimate.mean < self.config.min_flow_lpm
            {
                return FaultState::NoFlowWhileOpen;
            }
        }

        if let Some(closed_since) = self.valve_closed_since {
            if now.duration_since(closed_since) >= Duration::from_secs(self.config.grace_close_sec)
                && estimate.mean > self.config.leak_threshold_lpm
            {
                return FaultState::FlowWhileClosed;
            }
        }

        FaultState::Ok
    }

    fn valid_unstable_edge(&mut self, estimate: FlowEstimate, now: Instant) -> Option<Instant> {
        if estimate.noise_ratio() > self.config.noise_ratio {
            Some(*self.unstable_since.get_or_insert(now))
        } else {
            self.unstable_since = None;
            None
        }
    }

    /// Whether `FLOW_WHILE_CLOSED` should clear automatically after
    /// `auto_recover_sec` rather than requiring a manual reset.
    pub fn auto_recover_duration(&self) -> Option<Duration> {
        self.config.auto_recover_sec.map(Duration::from_secs)
    }

    /// Operator-initiated clear of a `FLOW_WHILE_CLOSED` fault that isn't
    /// configured to auto-recover. A no-op for any other current state.
    pub fn manual_reset(&mut self) -> Option<FaultState> {
        if self.current == FaultState::FlowWhileClosed {
            self.current = FaultState::Ok;
            self.candidate = None;
            Some(FaultState::Ok)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn est(mean: f64, stddev: f64, n: usize) -> FlowEstimate {
        FlowEstimate { mean, stddev, n }
    }

    fn config() -> FaultConfig {
        FaultConfig {
            flow_window_sec: 3,
            grace_open_sec: 5,
            grace_close_sec: 3,
            min_flow_lpm: 0.5,
            leak_threshold_lpm: 0.3,
            noise_ratio: 0.5,
            unstable_window_sec: 10,
            recover_hold_sec: 15,
            auto_recover_sec: None,
        }
    }

    #[test]
    fn starts_ok() {
        let detector = FaultDetector::new(config());
        assert_eq!(detector.state(), FaultState::Ok);
    }

    #[test]
    fn no_flow_while_open_after_grace_period() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        d.on_valve_command(true, t0);
        assert!(d.step(est(0.0, 0.0, 5), t0 + Duration::from_secs(1)).is_none());
        let transition = d.step(est(0.0, 0.0, 5), t0 + Duration::from_secs(6));
        assert_eq!(transition, Some(FaultState::NoFlowWhileOpen));
        assert_eq!(d.state(), FaultState::NoFlowWhileOpen);
    }

    #[test]
    fn flow_while_closed_after_grace_period() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        d.on_valve_command(false, t0);
        assert!(d.step(est(1.0, 0.0, 5), t0 + Duration::from_secs(1)).is_none());
        let transition = d.step(est(1.0, 0.0, 5), t0 + Duration::from_secs(4));
        assert_eq!(transition, Some(FaultState::FlowWhileClosed));
    }

    #[test]
    fn flow_while_closed_never_auto_clears_without_auto_recover_configured() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        d.on_valve_command(false, t0);
        d.step(est(1.0, 0.0, 5), t0 + Duration::from_secs(4));
        assert_eq!(d.state(), FaultState::FlowWhileClosed);

        // Flow drops back to nothing for a very long time — with
        // auto_recover_sec unset this must never clear on its own.
        let far_future = t0 + Duration::from_secs(3600);
        assert!(d.step(est(0.0, 0.0, 5), far_future).is_none());
        assert_eq!(d.state(), FaultState::FlowWhileClosed);
    }

    #[test]
    fn flow_while_closed_clears_via_manual_reset() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        d.on_valve_command(false, t0);
        d.step(est(1.0, 0.0, 5), t0 + Duration::from_secs(4));
        assert_eq!(d.state(), FaultState::FlowWhileClosed);

        let transition = d.manual_reset();
        assert_eq!(transition, Some(FaultState::Ok));
        assert_eq!(d.state(), FaultState::Ok);
    }

    #[test]
    fn manual_reset_is_noop_for_other_states() {
        let mut d = FaultDetector::new(config());
        assert_eq!(d.state(), FaultState::Ok);
        assert!(d.manual_reset().is_none());
    }

    #[test]
    fn flow_while_closed_auto_recovers_when_configured() {
        let mut cfg = config();
        cfg.auto_recover_sec = Some(5);
        let mut d = FaultDetector::new(cfg);
        let t0 = Instant::now();
        d.on_valve_command(false, t0);
        d.step(est(1.0, 0.0, 5), t0 + Duration::from_secs(4));
        assert_eq!(d.state(), FaultState::FlowWhileClosed);

        // Flow clears, but the configured auto_recover_sec hold must still
        // be satisfied before it clears automatically.
        let clear_seen = t0 + Duration::from_secs(10);
        assert!(d.step(est(0.0, 0.0, 5), clear_seen).is_none());
        assert_eq!(d.state(), FaultState::FlowWhileClosed);

        let transition = d.step(est(0.0, 0.0, 5), clear_seen + Duration::from_secs(5));
        assert_eq!(transition, Some(FaultState::Ok));
    }

    #[test]
    fn recovery_requires_sustained_hold() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        d.on_valve_command(true, t0);
        d.step(est(0.0, 0.0, 5), t0 + Duration::from_secs(6));
        assert_eq!(d.state(), FaultState::NoFlowWhileOpen);

        // Flow resumes, but recovery should not be instant.
        let mid = t0 + Duration::from_secs(10);
        assert!(d.step(est(2.0, 0.1, 5), mid).is_none());
        assert_eq!(d.state(), FaultState::NoFlowWhileOpen);

        // After recover_hold_sec of sustained good flow, it clears.
        let after_hold = mid + Duration::from_secs(15);
        let transition = d.step(est(2.0, 0.1, 5), after_hold);
        assert_eq!(transition, Some(FaultState::Ok));
    }

    #[test]
    fn unstable_requires_sustained_high_noise_ratio() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        assert!(d
            .step(est(1.0, 2.0, 5), t0 + Duration::from_secs(1))
            .is_none());
        let transition = d.step(est(1.0, 2.0, 5), t0 + Duration::from_secs(11));
        assert_eq!(transition, Some(FaultState::Unstable));
    }

    #[test]
    fn empty_window_is_unstable_boundary_case() {
        let mut d = FaultDetector::new(config());
        let t0 = Instant::now();
        let transition = d.step(est(0.0, 0.0, 0), t0);
        assert_eq!(transition, Some(FaultState::Unstable));
    }

    #[test]
    fn auto_recover_duration_defaults_to_manual_clear() {
        let d = FaultDetector::new(config());
        assert!(d.auto_recover_duration().is_none());
    }

    #[test]
    fn auto_recover_duration_honors_configured_value() {
        let mut cfg = config();
        cfg.auto_recover_sec = Some(600);
        let d = FaultDetector::new(cfg);
        assert_eq!(d.auto_recover_duration(), Some(Duration::from_secs(600)));
    }
}
