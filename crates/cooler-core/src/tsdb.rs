//! Time-series database client used by the controller's sensor-query loop.
//!
//! The TSDB itself is an external collaborator; this module only needs a
//! trait boundary plus one concrete HTTP adapter generic enough to speak to
//! an InfluxDB/Prometheus-style tagged range-read API.

use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::CoolerError;
use crate::model::{MetricSample, RequiredMetric, SensorWindow};

/// Per-attempt timeout for a single TSDB query.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Total budget for all retries within one controller tick.
pub const TICK_BUDGET: Duration = Duration::from_secs(30);
/// Maximum retry attempts per tick.
pub const MAX_ATTEMPTS: u32 = 5;

/// Queries a time-series database for the metrics in a [`SensorWindow`].
#[async_trait::async_trait]
pub trait TsdbClient: Send + Sync {
    async fn query_window(&self, lookback: Duration) -> Result<SensorWindow, CoolerError>;
}

/// Backoff-as-data: plain struct fields rather than nested try/catch, so
/// retry policy is inspectable and testable without mocking a clock.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempt: u32,
    pub delay: Duration,
}

impl Backoff {
    pub fn start() -> Self {
        Self {
            attempt: 0,
            delay: Duration::from_millis(100),
        }
    }

    /// Double the delay, capped at 10s, and bump the attempt counter.
    pub fn advance(&mut self) {
        self.attempt += 1;
        self.delay = (self.delay * 2).min(Duration::from_secs(10));
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= MAX_ATTEMPTS
    }
}

/// Drive `query` through up to [`MAX_ATTEMPTS`] retries with exponential
/// backoff, bounded by [`TICK_BUDGET`]. Returns `Ok(None)` (an absent
/// window) on exhaustion rather than synthesizing zeros.
pub async fn query_with_retry<F, Fut>(query: F) -> Option<SensorWindow>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<SensorWindow, CoolerError>>,
{
    let mut backoff = Backoff::start();
    let tick_deadline = tokio::time::Instant::now() + TICK_BUDGET;

    loop {
        if tokio::time::Instant::now() >= tick_deadline {
            return None;
        }
        match tokio::time::timeout(ATTEMPT_TIMEOUT, query()).await {
            Ok(Ok(window)) => return Some(window),
            Ok(Err(e)) => {
                tracing::warn!(attempt = backoff.attempt, error = %e, "tsdb query failed");
            }
            Err(_) => {
                tracing::warn!(attempt = backoff.attempt, "tsdb query timed out");
            }
        }
        backoff.advance();
        if backoff.exhausted() {
            return None;
        }
        tokio::time::sleep(backoff.delay).await;
    }
}

/// Range-read HTTP client for a tagged-series TSDB.
///
/// Expects a JSON body shaped `{"series": {"<metric>": [{"ts": <rfc3339>,
/// "value": <f64>}, ...]}}`, taking the most recent point per metric.
pub struct HttpTsdbClient {
    http: reqwest::Client,
    base_url: String,
    host_label: String,
}

#[derive(Debug, Deserialize)]
struct SeriesPoint {
    ts: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    series: std::collections::HashMap<String, Vec<SeriesPoint>>,
}

impl HttpTsdbClient {
    pub fn new(base_url: impl Into<String>, host_label: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            host_label: host_label.into(),
        }
    }
}

#[async_trait::async_trait]
impl TsdbClient for HttpTsdbClient {
    async fn query_window(&self, lookback: Duration) -> Result<SensorWindow, CoolerError> {
        let url = format!(
            "{}/query?host={}&lookback_sec={}",
            self.base_url,
            self.host_label,
            lookback.as_secs()
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoolerError::transient_io(format!("tsdb request: {e}")))?;
        let body: SeriesResponse = resp
            .json()
            .await
            .map_err(|e| CoolerError::transient_io(format!("tsdb decode: {e}")))?;

        let mut window = SensorWindow::default();
        for (metric, points) in body.series {
            let Some(latest) = points.last() else {
                continue;
            };
            let ts = OffsetDateTime::parse(&latest.ts, &time::format_description::well_known::Rfc3339)
                .map_err(|e| CoolerError::transient_io(format!("tsdb timestamp: {e}")))?;
            let sample = MetricSample::new(latest.value, ts);
            match metric.as_str() {
                "power" => window.power = Some(sample),
                "temperature" => window.temperature = Some(sample),
                "humidity" => window.humidity = Some(sample),
                "lux" => window.lux = Some(sample),
                "solar_radiation" => window.solar_radiation = Some(sample),
                "rainfall" => window.rainfall = Some(sample),
                other => tracing::debug!(metric = other, "ignoring unknown series"),
            }
        }
        Ok(window)
    }
}

/// Reference for `RequiredMetric` so sensor-query callers can build the
/// `required` slice `SensorWindow::is_valid` expects without importing both
/// modules separately.
pub const ALL_METRICS: [RequiredMetric; 6] = [
    RequiredMetric::Power,
    RequiredMetric::Temperature,
    RequiredMetric::Humidity,
    RequiredMetric::Lux,
    RequiredMetric::SolarRadiation,
    RequiredMetric::Rainfall,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn query_with_retry_returns_first_success() {
        let result = query_with_retry(|| async { Ok(SensorWindow::default()) }).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn query_with_retry_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = query_with_retry(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Err(CoolerError::transient_io("boom")) }
        })
        .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::start();
        assert_eq!(b.delay, Duration::from_millis(100));
        for _ in 0..10 {
            b.advance();
        }
        assert_eq!(b.delay, Duration::from_secs(10));
    }

    #[test]
    fn backoff_exhausted_after_max_attempts() {
        let mut b = Backoff::start();
        for _ in 0..MAX_ATTEMPTS {
            assert!(!b.exhausted());
            b.advance();
        }
        assert!(b.exhausted());
    }
}
