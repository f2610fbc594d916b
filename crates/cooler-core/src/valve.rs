//! Bit-level valve GPIO driver.
//!
//! A real `rppal`-backed driver lives behind the `gpio` feature; a
//! mock/logging driver is the default for dev and test. `open`/`close` are
//! idempotent; write failures retry up to 3 times at 100ms before
//! escalating to `HardwareFault`.

use std::time::Duration;

use crate::error::CoolerError;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long after a write to sample the echo (sense) pin.
pub const ECHO_SAMPLE_DELAY: Duration = Duration::from_millis(50);

/// A single solenoid valve, written exclusively by the scheduler's command
/// consumer.
#[async_trait::async_trait]
pub trait ValveDriver: Send {
    /// Drive the valve open. Idempotent.
    async fn open(&mut self) -> Result<(), CoolerError>;
    /// Drive the valve closed. Idempotent.
    async fn close(&mut self) -> Result<(), CoolerError>;
    /// Sample the echo/sense line, if one is wired. `None` means no echo pin
    /// is configured.
    fn read_echo(&self) -> Option<bool>;
    /// Last commanded state (`true` = open).
    fn commanded(&self) -> bool;
}

/// Write `commanded` with up to [`WRITE_RETRIES`] retries, escalating to
/// `HardwareFault` on exhaustion — shared by both driver implementations so
/// retry policy lives in one place.
pub async fn write_with_retry<F>(mut write_once: F) -> Result<(), CoolerError>
where
    F: FnMut() -> Result<(), CoolerError>,
{
    let mut attempt = 0;
    loop {
        match write_once() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_RETRIES => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "valve write failed, retrying");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(CoolerError::hardware_fault(format!(
                    "valve write failed after {WRITE_RETRIES} retries: {e}"
                )));
            }
        }
    }
}

/// Default driver: logs commands instead of touching hardware. Used in
/// `-d`/dummy mode and in tests.
pub struct MockValveDriver {
    open: bool,
    echo: Option<bool>,
    echo_forced: bool,
}

impl MockValveDriver {
    pub fn new() -> Self {
        Self {
            open: false,
            echo: None,
            echo_forced: false,
        }
    }

    /// Test/sim hook: force the echo line to read back a particular value,
    /// independent of the commanded state, to exercise mismatch detection.
    pub fn set_echo(&mut self, value: Option<bool>) {
        self.echo = value;
        self.echo_forced = true;
    }
}

impl Default for MockValveDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ValveDriver for MockValveDriver {
    async fn open(&mut self) -> Result<(), CoolerError> {
        if !self.open {
            tracing::info!("mock valve: open");
        }
        self.open = true;
        if !self.echo_forced {
            self.echo = Some(true);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CoolerError> {
        if self.open {
            tracing::info!("mock valve: close");
        }
        self.open = false;
        if !self.echo_forced {
            self.echo = Some(false);
        }
        Ok(())
    }

    fn read_echo(&self) -> Option<bool> {
        self.echo
    }

    fn commanded(&self) -> bool {
        self.open
    }
}

#[cfg(feature = "gpio")]
pub mod gpio {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};

    /// Real GPIO-backed valve driver. Active-low: the solenoid's relay
    /// board energizes on a logic-low output.
    pub struct GpioValveDriver {
        pin: OutputPin,
        echo_pin: Option<rppal::gpio::InputPin>,
        open: bool,
    }

    impl GpioValveDriver {
        pub fn new(pin_num: u8, echo_pin_num: Option<u8>) -> Result<Self, CoolerError> {
            let gpio = Gpio::new()
                .map_err(|e| CoolerError::hardware_fault(format!("gpio init: {e}")))?;
            let mut pin = gpio
                .get(pin_num)
                .map_err(|e| CoolerError::hardware_fault(format!("gpio pin {pin_num}: {e}")))?
                .into_output();
            pin.set_high(); // active-low: high = closed

            let echo_pin = echo_pin_num
                .map(|n| {
                    gpio.get(n)
                        .map(|p| p.into_input())
                        .map_err(|e| CoolerError::hardware_fault(format!("echo pin {n}: {e}")))
                })
                .transpose()?;

            Ok(Self {
                pin,
                echo_pin,
                open: false,
            })
        }
    }

    #[async_trait::async_trait]
    impl ValveDriver for GpioValveDriver {
        async fn open(&mut self) -> Result<(), CoolerError> {
            write_with_retry(|| {
                self.pin.set_low(); // active-low: low = open
                Ok(())
            })
            .await?;
            self.open = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), CoolerError> {
            write_with_retry(|| {
                self.pin.set_high();
                Ok(())
            })
            .await?;
            self.open = false;
            Ok(())
        }

        fn read_echo(&self) -> Option<bool> {
            self.echo_pin.as_ref().map(|p| p.is_high())
        }

        fn commanded(&self) -> bool {
            self.open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_driver_open_close_idempotent() {
        let mut valve = MockValveDriver::new();
        valve.open().await.unwrap();
        valve.open().await.unwrap();
        assert!(valve.commanded());
        valve.close().await.unwrap();
        valve.close().await.unwrap();
        assert!(!valve.commanded());
    }

    #[tokio::test]
    async fn mock_driver_echo_follows_commanded_by_default() {
        let mut valve = MockValveDriver::new();
        valve.open().await.unwrap();
        assert_eq!(valve.read_echo(), Some(true));
        valve.close().await.unwrap();
        assert_eq!(valve.read_echo(), Some(false));
    }

    #[tokio::test]
    async fn mock_driver_echo_mismatch_can_be_forced() {
        let mut valve = MockValveDriver::new();
        valve.open().await.unwrap();
        valve.set_echo(Some(false));
        assert_ne!(valve.read_echo(), Some(valve.commanded()));
    }

    #[tokio::test]
    async fn write_with_retry_succeeds_first_try() {
        let result = write_with_retry(|| Ok(())).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn write_with_retry_escalates_to_hardware_fault() {
        let result: Result<(), CoolerError> =
            write_with_retry(|| Err(CoolerError::transient_io("stuck"))).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::HardwareFault);
    }
}
