//! Wire and domain types shared by every component: sensor windows, control
//! messages, valve commands, flow samples, fault states, and event records.
//!
//! Everything here is a plain owned value (`Clone`, `Serialize`,
//! `Deserialize`) — no shared-mutable handle ever crosses a component
//! boundary.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How many past samples each metric's history retains.
pub const METRIC_HISTORY_LEN: usize = 16;

/// A single metric's current value plus a short trend history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(skip)]
    pub history: VecDeque<(i64, f64)>,
}

impl MetricSample {
    pub fn new(value: f64, ts: OffsetDateTime) -> Self {
        Self {
            value,
            ts,
            history: VecDeque::with_capacity(METRIC_HISTORY_LEN),
        }
    }

    /// Push a new observation, evicting the oldest once `METRIC_HISTORY_LEN`
    /// is exceeded.
    pub fn push(&mut self, value: f64, ts: OffsetDateTime) {
        if self.history.len() == METRIC_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((ts.unix_timestamp(), value));
        self.value = value;
        self.ts = ts;
    }

    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.ts
    }
}

/// Snapshot of all metrics the mode decider needs, at one point in time.
///
/// `None` means the metric was never observed or its window has no required
/// reading; per the validity invariant, a decider must treat this as
/// "absent", never as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorWindow {
    pub power: Option<MetricSample>,
    pub temperature: Option<MetricSample>,
    pub humidity: Option<MetricSample>,
    pub lux: Option<MetricSample>,
    pub solar_radiation: Option<MetricSample>,
    pub rainfall: Option<MetricSample>,
}

impl SensorWindow {
    /// A window is valid only if every metric required by `required` is
    /// present and fresher than `stale_threshold`.
    pub fn is_valid(
        &self,
        now: OffsetDateTime,
        stale_threshold: time::Duration,
        required: &[RequiredMetric],
    ) -> bool {
        required.iter().all(|m| {
            self.get(*m)
                .map(|sample| sample.age(now) <= stale_threshold)
                .unwrap_or(false)
        })
    }

    pub fn get(&self, metric: RequiredMetric) -> Option<&MetricSample> {
        match metric {
            RequiredMetric::Power => self.power.as_ref(),
            RequiredMetric::Temperature => self.temperature.as_ref(),
            RequiredMetric::Humidity => self.humidity.as_ref(),
            RequiredMetric::Lux => self.lux.as_ref(),
            RequiredMetric::SolarRadiation => self.solar_radiation.as_ref(),
            RequiredMetric::Rainfall => self.rainfall.as_ref(),
        }
    }
}

/// Which metric a rule or validity check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredMetric {
    Power,
    Temperature,
    Humidity,
    Lux,
    SolarRadiation,
    Rainfall,
}

/// Square-wave valve drive derived from a [`Mode`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Duty {
    pub enable: bool,
    pub on_sec: u32,
    pub off_sec: u32,
}

impl Duty {
    pub const OFF: Duty = Duty {
        enable: false,
        on_sec: 0,
        off_sec: 0,
    };

    /// Same `(on_sec, off_sec)` tuple — used by the scheduler to decide
    /// whether to preserve cycle phase across messages.
    pub fn same_cycle(&self, other: &Duty) -> bool {
        self.on_sec == other.on_sec && self.off_sec == other.off_sec
    }
}

/// A quantized cooling-aggressiveness level, totally ordered by `mode_index`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub mode_index: u16,
    pub duty: Duty,
}

impl Mode {
    pub const IDLE: Mode = Mode {
        mode_index: 0,
        duty: Duty::OFF,
    };
}

/// The run/stop/fault posture a [`ControlMessage`] advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    Running,
    Stopping,
    Fault,
}

/// The message published by the controller, relayed by the proxy, and
/// consumed by the actuator's scheduler.
///
/// `message_id` is monotonically non-decreasing per publisher; receivers
/// must discard any message whose id is not strictly newer than the last one
/// they applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub message_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub mode_index: u16,
    pub state: ControlState,
    pub duty: Duty,
}

impl ControlMessage {
    pub fn is_newer_than(&self, last_id: u64) -> bool {
        self.message_id > last_id
    }
}

/// A command to the valve driver, retired automatically at `deadline`.
#[derive(Debug, Clone)]
pub struct ValveCommand {
    pub open: bool,
    pub deadline: Instant,
}

/// A single flow-rate reading.
#[derive(Debug, Clone, Copy)]
pub struct FlowSample {
    pub value_lpm: f64,
    pub t: Instant,
}

/// Mean/stddev/count over a trailing window of [`FlowSample`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowEstimate {
    pub mean: f64,
    pub stddev: f64,
    pub n: usize,
}

impl FlowEstimate {
    pub fn noise_ratio(&self) -> f64 {
        if self.mean.abs() < f64::EPSILON {
            0.0
        } else {
            self.stddev / self.mean
        }
    }
}

/// Hardware fault classification, hysteretic (see `cooler_core::fault`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    Ok,
    NoFlowWhileOpen,
    FlowWhileClosed,
    Unstable,
}

impl Default for FaultState {
    fn default() -> Self {
        FaultState::Ok
    }
}

/// Severity of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Err,
}

/// What kind of transition an [`EventRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModeChange,
    DutyOn,
    DutyOff,
    Fault,
    Recover,
    Start,
    Stop,
}

/// An append-only event. `id` is assigned by the event log on write and is
/// strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub level: EventLevel,
    pub kind: EventKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_ordering_guard() {
        let msg = ControlMessage {
            message_id: 5,
            ts: OffsetDateTime::now_utc(),
            mode_index: 1,
            state: ControlState::Running,
            duty: Duty::OFF,
        };
        assert!(msg.is_newer_than(4));
        assert!(!msg.is_newer_than(5));
        assert!(!msg.is_newer_than(6));
    }

    #[test]
    fn duty_same_cycle() {
        let a = Duty {
            enable: true,
            on_sec: 60,
            off_sec: 120,
        };
        let b = Duty {
            enable: false,
            on_sec: 60,
            off_sec: 120,
        };
        let c = Duty {
            enable: true,
            on_sec: 30,
            off_sec: 120,
        };
        assert!(a.same_cycle(&b));
        assert!(!a.same_cycle(&c));
    }

    #[test]
    fn sensor_window_invalid_when_metric_missing() {
        let window = SensorWindow::default();
        let now = OffsetDateTime::now_utc();
        assert!(!window.is_valid(now, time::Duration::minutes(5), &[RequiredMetric::Power]));
    }

    #[test]
    fn sensor_window_valid_when_fresh() {
        let now = OffsetDateTime::now_utc();
        let mut window = SensorWindow::default();
        window.power = Some(MetricSample::new(800.0, now));
        assert!(window.is_valid(now, time::Duration::minutes(5), &[RequiredMetric::Power]));
    }

    #[test]
    fn sensor_window_invalid_when_stale() {
        let now = OffsetDateTime::now_utc();
        let mut window = SensorWindow::default();
        window.power = Some(MetricSample::new(800.0, now - time::Duration::minutes(10)));
        assert!(!window.is_valid(now, time::Duration::minutes(5), &[RequiredMetric::Power]));
    }

    #[test]
    fn metric_sample_push_evicts_oldest() {
        let mut sample = MetricSample::new(0.0, OffsetDateTime::now_utc());
        for i in 0..(METRIC_HISTORY_LEN + 5) {
            sample.push(i as f64, OffsetDateTime::now_utc());
        }
        assert_eq!(sample.history.len(), METRIC_HISTORY_LEN);
    }

    #[test]
    fn flow_estimate_noise_ratio_zero_mean() {
        let est = FlowEstimate {
            mean: 0.0,
            stddev: 1.0,
            n: 10,
        };
        assert_eq!(est.noise_ratio(), 0.0);
    }

    #[test]
    fn control_message_serializes_expected_shape() {
        let msg = ControlMessage {
            message_id: 1,
            ts: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            mode_index: 2,
            state: ControlState::Running,
            duty: Duty {
                enable: true,
                on_sec: 60,
                off_sec: 120,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message_id"], 1);
        assert_eq!(json["mode_index"], 2);
        assert_eq!(json["state"], "running");
        assert_eq!(json["duty"]["on_sec"], 60);
    }
}
