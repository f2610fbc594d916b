//! Error taxonomy shared across all four binaries.
//!
//! Mirrors the kinds from the error-handling design: each carries enough
//! data for the caller to decide retry vs. fail-fast vs. escalate, rather
//! than branching on a formatted message string.

use std::fmt;

/// Broad classification of a failure, independent of where it occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/TSDB/pub-sub I/O that is expected to clear on retry.
    TransientIo,
    /// A startup configuration problem. Always fatal (exit code 1).
    ConfigInvalid,
    /// Sensor window missing or stale beyond `stale_threshold`.
    StaleSensor,
    /// Actuator's subscriber has not seen a message within `liveness_timeout`.
    PublisherDown,
    /// Flow/valve mismatch or GPIO write failure after retries.
    HardwareFault,
    /// SQL storage exhausted; INFO events are being dropped.
    StorageFull,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::StaleSensor => "stale_sensor",
            ErrorKind::PublisherDown => "publisher_down",
            ErrorKind::HardwareFault => "hardware_fault",
            ErrorKind::StorageFull => "storage_full",
        };
        f.write_str(s)
    }
}

/// A classified error carrying its [`ErrorKind`] plus a human-readable cause.
///
/// Binaries propagate this (or `anyhow::Error` wrapping it) with `.context()`
/// at I/O boundaries; pure logic in `cooler-core` returns it directly so
/// callers can match on `kind()` to decide retry policy.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoolerError {
    kind: ErrorKind,
    message: String,
}

impl CoolerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn stale_sensor(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StaleSensor, message)
    }

    pub fn hardware_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HardwareFault, message)
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIo, message)
    }
}
