//! REST + SSE surface: `/api/stat`, `/api/watering`, `/api/log_view`,
//! `/api/event`, `/api/sysinfo`, `/api/healthz`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use cooler_core::eventlog::{EventLog, SseNotice};
use cooler_core::metrics::MetricsStore;
use cooler_core::model::ControlMessage;
use cooler_core::watchdog::LivenessWatchdog;

/// One sensor poll's worth of per-metric values, kept as a short trailing
/// history for `/api/stat`'s "last N samples" contract — unrelated to
/// `MetricSample::history`, which is never populated by the TSDB adapter.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub power: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub lux: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub rainfall: Option<f64>,
}

/// How many past polls `/api/stat` reports.
pub const SENSOR_HISTORY_LEN: usize = cooler_core::model::METRIC_HISTORY_LEN;

#[derive(Clone)]
pub struct AppState {
    pub event_log: Arc<EventLog>,
    pub metrics: Arc<MetricsStore>,
    pub latest: Arc<RwLock<Option<ControlMessage>>>,
    pub sensor_history: Arc<RwLock<std::collections::VecDeque<SensorSnapshot>>>,
    pub watchdog: Arc<Mutex<LivenessWatchdog>>,
    pub sse_tx: broadcast::Sender<SseNotice>,
    pub started_at: tokio::time::Instant,
    pub water_cost_per_liter: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stat", get(api_stat))
        .route("/api/watering", get(api_watering))
        .route("/api/log_view", get(api_log_view))
        .route("/api/event", get(api_event))
        .route("/api/sysinfo", get(api_sysinfo))
        .route("/api/healthz", get(api_healthz))
        .with_state(state)
}

async fn api_stat(State(state): State<AppState>) -> impl IntoResponse {
    let latest = state.latest.read().await.clone();
    let samples: Vec<SensorSnapshot> = state.sensor_history.read().await.iter().cloned().collect();
    let ts = latest
        .as_ref()
        .and_then(|m| m.ts.format(&time::format_description::well_known::Rfc3339).ok());

    Json(serde_json::json!({
        "mode_index": latest.as_ref().map(|m| m.mode_index),
        "state": latest.as_ref().map(|m| m.state),
        "duty": latest.as_ref().map(|m| m.duty),
        "message_id": latest.as_ref().map(|m| m.message_id),
        "ts": ts,
        "sensor_samples": samples,
    }))
}

#[derive(Debug, Serialize)]
struct WateringDay {
    date: String,
    volume_l: f64,
    cost: f64,
}

async fn api_watering(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.recent_volume(10).await {
        Ok(rows) => {
            let days: Vec<WateringDay> = rows
                .into_iter()
                .map(|(date, volume_l)| WateringDay {
                    date: date
                        .format(&time::format_description::well_known::Iso8601::DATE)
                        .unwrap_or_default(),
                    volume_l,
                    cost: volume_l * state.water_cost_per_liter,
                })
                .collect();
            Json(serde_json::json!({ "days": days })).into_response()
        }
        Err(e) => {
            tracing::warn!("api_watering: {e}");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn api_log_view(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    match state.event_log.read_page(params.offset, params.limit).await {
        Ok(records) => Json(serde_json::json!({ "events": records })).into_response(),
        Err(e) => {
            tracing::warn!("api_log_view: {e}");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// SSE stream: each notice's `data` is `log` or `stat`, telling the UI which
/// resource to re-fetch — the event body itself never carries the payload.
async fn api_event(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse_tx.subscribe();
    let stream = async_stream::stream! {
        let mut notices = BroadcastStream::new(rx);
        while let Some(item) = notices.next().await {
            match item {
                Ok(SseNotice::Log) => yield Ok(Event::default().data("log")),
                Ok(SseNotice::Stat) => yield Ok(Event::default().data("stat")),
                // A slow client lags behind the broadcast buffer
                // (`sse_queue_max`) and is treated as a dropped connection
                // rather than replayed from a backlog.
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn api_sysinfo(State(state): State<AppState>) -> impl IntoResponse {
    let build_epoch: i64 = env!("COOLER_BUILD_EPOCH").parse().unwrap_or(0);
    let build_date = OffsetDateTime::from_unix_timestamp(build_epoch)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();

    Json(serde_json::json!({
        "build_date": build_date,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "load_average": load_average(),
    }))
}

#[cfg(unix)]
fn load_average() -> [f64; 3] {
    let mut loads: [f64; 3] = [0.0; 3];
    // SAFETY: `loads` is a valid 3-element buffer, matching getloadavg(3)'s
    // contract; a negative return leaves it untouched and we fall back to
    // zeros.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n < 0 {
        [0.0; 3]
    } else {
        loads
    }
}

#[cfg(not(unix))]
fn load_average() -> [f64; 3] {
    [0.0; 3]
}

async fn api_healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.watchdog.lock().await.is_live() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use cooler_core::model::{EventKind, EventLevel};
    use http_body_util::BodyExt;
    use std::collections::VecDeque;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let event_log = EventLog::connect("sqlite::memory:", 1000, 64).await.unwrap();
        let metrics = Arc::new(MetricsStore::connect("sqlite::memory:").await.unwrap());
        let (sse_tx, _) = broadcast::channel(64);
        AppState {
            event_log,
            metrics,
            latest: Arc::new(RwLock::new(None)),
            sensor_history: Arc::new(RwLock::new(VecDeque::new())),
            watchdog: Arc::new(Mutex::new(LivenessWatchdog::new(Duration::from_secs(30)))),
            sse_tx,
            started_at: tokio::time::Instant::now(),
            water_cost_per_liter: 0.01,
        }
    }

    #[tokio::test]
    async fn stat_with_no_messages_yet_reports_nulls() {
        let app = router(test_state().await);
        let req = Request::builder().uri("/api/stat").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["mode_index"].is_null());
        assert!(json["sensor_samples"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stat_reflects_latest_control_message() {
        let state = test_state().await;
        *state.latest.write().await = Some(ControlMessage {
            message_id: 7,
            ts: OffsetDateTime::now_utc(),
            mode_index: 2,
            state: cooler_core::model::ControlState::Running,
            duty: cooler_core::model::Duty {
                enable: true,
                on_sec: 60,
                off_sec: 120,
            },
        });
        let app = router(state);
        let req = Request::builder().uri("/api/stat").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mode_index"], 2);
        assert_eq!(json["message_id"], 7);
    }

    #[tokio::test]
    async fn watering_reports_empty_days_with_no_volume() {
        let app = router(test_state().await);
        let req = Request::builder().uri("/api/watering").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["days"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watering_applies_cost_per_liter() {
        let state = test_state().await;
        let today = MetricsStore::today_local();
        state.metrics.add_volume(today, 1, 10.0).await.unwrap();
        let app = router(state);
        let req = Request::builder().uri("/api/watering").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let days = json["days"].as_array().unwrap();
        assert_eq!(days.len(), 1);
        assert!((days[0]["volume_l"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert!((days[0]["cost"].as_f64().unwrap() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn log_view_pages_newest_first() {
        let state = test_state().await;
        state
            .event_log
            .append(EventLevel::Info, EventKind::Start, "one")
            .await
            .unwrap();
        state
            .event_log
            .append(EventLevel::Info, EventKind::Stop, "two")
            .await
            .unwrap();
        let app = router(state);
        let req = Request::builder()
            .uri("/api/log_view?offset=0&limit=10")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let events = json["events"].as_array().unwrap();
        assert_eq!(events[0]["message"], "two");
    }

    #[tokio::test]
    async fn healthz_ok_when_watchdog_live() {
        let app = router(test_state().await);
        let req = Request::builder().uri("/api/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_503_when_watchdog_tripped() {
        let state = test_state().await;
        {
            let mut wd = state.watchdog.lock().await;
            *wd = LivenessWatchdog::new(Duration::from_millis(1));
            std::thread::sleep(Duration::from_millis(5));
            wd.check();
        }
        let app = router(state);
        let req = Request::builder().uri("/api/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sysinfo_reports_nonnegative_uptime() {
        let app = router(test_state().await);
        let req = Request::builder().uri("/api/sysinfo").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["uptime_secs"].is_u64());
        assert!(json["load_average"].is_array());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = router(test_state().await);
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
