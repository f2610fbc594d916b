//! Flow sampler: reads the flow-rate sensor and smooths
//! samples into a trailing-window [`FlowEstimate`].
//!
//! `FlowSource` abstracts the physical sensor behind a trait, with a real
//! source for production and a deterministic simulator for dummy mode and
//! tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::model::{FlowEstimate, FlowSample};

/// Abstracts the physical (or simulated) flow sensor.
pub trait FlowSource: Send {
    /// Read the current instantaneous flow rate in liters/minute.
    fn read(&mut self) -> f64;
}

/// Trailing-window mean/stddev accumulator, fed at a fixed sample rate.
pub struct FlowSampler {
    window: Duration,
    samples: VecDeque<FlowSample>,
}

impl FlowSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record one sample and evict anything older than `window`.
    pub fn push(&mut self, value_lpm: f64, t: Instant) {
        self.samples.push_back(FlowSample { value_lpm, t });
        while let Some(front) = self.samples.front() {
            if t.duration_since(front.t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Compute the current trailing-window estimate. `n == 0` (no samples
    /// in the window) is a valid, representable result — callers treat it
    /// as the `UNSTABLE` boundary case.
    pub fn estimate(&self) -> FlowEstimate {
        let n = self.samples.len();
        if n == 0 {
            return FlowEstimate::default();
        }
        let sum: f64 = self.samples.iter().map(|s| s.value_lpm).sum();
        let mean = sum / n as f64;
        let variance = self
            .samples
            .iter()
            .map(|s| (s.value_lpm - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        FlowEstimate {
            mean,
            stddev: variance.sqrt(),
            n,
        }
    }
}

/// Deterministic flow simulator for `-d`/dummy mode and tests. Produces a
/// flat baseline with small Gaussian-ish noise while the valve is
/// commanded open, and near-zero (with occasional leak noise) while closed
/// — using an Irwin-Hall approximation for cheap Gaussian noise instead of
/// a full normal-distribution sampler.
#[cfg(feature = "sim-flow")]
pub struct SimFlowSource {
    open: bool,
    base_lpm: f64,
    noise_sigma: f64,
    leak_lpm: f64,
}

#[cfg(feature = "sim-flow")]
impl SimFlowSource {
    pub fn new(base_lpm: f64, noise_sigma: f64, leak_lpm: f64) -> Self {
        Self {
            open: false,
            base_lpm,
            noise_sigma,
            leak_lpm,
        }
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    fn approx_std_normal() -> f64 {
        // Irwin-Hall approximation: sum of 12 uniforms minus 6 has mean 0,
        // variance 1, close enough to Gaussian for simulation noise.
        let sum: f64 = (0..12).map(|_| fastrand::f64()).sum();
        sum - 6.0
    }
}

#[cfg(feature = "sim-flow")]
impl FlowSource for SimFlowSource {
    fn read(&mut self) -> f64 {
        let noise = Self::approx_std_normal() * self.noise_sigma;
        if self.open {
            (self.base_lpm + noise).max(0.0)
        } else {
            (self.leak_lpm + noise * 0.1).max(0.0)
        }
    }
}

/// Real hall-effect flow sensor on a GPIO pin, grounded on the pack's
/// `ZanzyTHEbar-pet-filter` YF-S201 driver: an interrupt handler increments
/// a shared pulse counter on each rising edge, and `read()` drains it into
/// an instantaneous rate. `rppal`'s async interrupt callback stands in for
/// that driver's ISR — same atomic-counter handoff, no `unsafe`/`no_mangle`
/// required on Linux.
#[cfg(feature = "gpio")]
pub mod gpio {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use rppal::gpio::{Gpio, InputPin, Trigger};

    use crate::error::CoolerError;

    /// YF-S201 calibration: frequency (Hz) = 7.5 x flow_rate (L/min), i.e.
    /// 450 pulses per litre.
    const PULSES_PER_LITRE: f64 = 450.0;

    pub struct GpioFlowSource {
        // Held only to keep the interrupt registration alive; pulses are
        // read through `count`.
        _pin: InputPin,
        count: Arc<AtomicU32>,
        last_read: Instant,
    }

    impl GpioFlowSource {
        pub fn new(pin_num: u8) -> Result<Self, CoolerError> {
            let gpio = Gpio::new()
                .map_err(|e| CoolerError::hardware_fault(format!("gpio init: {e}")))?;
            let mut pin = gpio
                .get(pin_num)
                .map_err(|e| CoolerError::hardware_fault(format!("gpio pin {pin_num}: {e}")))?
                .into_input_pullup();

            let count = Arc::new(AtomicU32::new(0));
            let isr_count = count.clone();
            pin.set_async_interrupt(Trigger::RisingEdge, move |_| {
                isr_count.fetch_add(1, Ordering::Relaxed);
            })
            .map_err(|e| CoolerError::hardware_fault(format!("gpio interrupt: {e}")))?;

            Ok(Self {
                _pin: pin,
                count,
                last_read: Instant::now(),
            })
        }
    }

    impl FlowSource for GpioFlowSource {
        fn read(&mut self) -> f64 {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_read).as_secs_f64();
            self.last_read = now;

            let pulses = self.count.swap(0, Ordering::Relaxed) as f64;
            if elapsed <= 0.0 {
                return 0.0;
            }
            (pulses / elapsed * 60.0) / PULSES_PER_LITRE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_yields_zero_n() {
        let sampler = FlowSampler::new(Duration::from_secs(3));
        let est = sampler.estimate();
        assert_eq!(est.n, 0);
    }

    #[test]
    fn mean_of_constant_samples() {
        let mut sampler = FlowSampler::new(Duration::from_secs(3));
        let t0 = Instant::now();
        for i in 0..5 {
            sampler.push(2.0, t0 + Duration::from_millis(i * 10));
        }
        let est = sampler.estimate();
        assert_eq!(est.n, 5);
        assert!((est.mean - 2.0).abs() < 1e-9);
        assert!(est.stddev < 1e-9);
    }

    #[test]
    fn old_samples_are_evicted() {
        let mut sampler = FlowSampler::new(Duration::from_secs(3));
        let t0 = Instant::now();
        sampler.push(5.0, t0);
        sampler.push(1.0, t0 + Duration::from_secs(4));
        let est = sampler.estimate();
        assert_eq!(est.n, 1);
        assert!((est.mean - 1.0).abs() < 1e-9);
    }

    #[test]
    fn noise_ratio_reflects_variance() {
        let mut sampler = FlowSampler::new(Duration::from_secs(3));
        let t0 = Instant::now();
        sampler.push(0.0, t0);
        sampler.push(10.0, t0 + Duration::from_millis(1));
        let est = sampler.estimate();
        assert!(est.noise_ratio() > 0.0);
    }
}
