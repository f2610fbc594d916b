//! Web-UI: the REST + SSE surface. Runs its own MQTT subscriber (for
//! `/api/stat` and `/api/healthz`'s liveness check) and reads the
//! actuator's event-log/metrics SQLite file read-alongside-writer (WAL mode
//! tolerates one writer plus any number of readers).

mod cli;
mod web;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use cooler_core::config::Config;
use cooler_core::envelope;
use cooler_core::eventlog::{EventLog, SseNotice};
use cooler_core::metrics::MetricsStore;
use cooler_core::model::ControlMessage;
use cooler_core::tsdb::{self, HttpTsdbClient, TsdbClient};
use cooler_core::watchdog::LivenessWatchdog;

use web::{AppState, SensorSnapshot, SENSOR_HISTORY_LEN};

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = cli::Cli::parse();
    init_tracing(cli.debug);

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    match run(config, cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("unrecoverable error: {e}");
            std::process::ExitCode::from(2)
        }
    }
}

async fn run(config: Config, cli: cli::Cli) -> anyhow::Result<()> {
    let host = std::env::var("HEMS_SERVER_HOST").unwrap_or_else(|_| config.mqtt.host.clone());
    let node_name = std::env::var("NODE_HOSTNAME").unwrap_or_else(|_| "webui".to_string());
    // TEST is a bare test-hook flag; treated as an alias for
    // DUMMY_MODE since both mean "no real hardware/network side effects".
    let dummy = cli.dummy || std::env::var("DUMMY_MODE").is_ok() || std::env::var("TEST").is_ok();

    let event_log = EventLog::connect(
        &config.storage.db_path,
        config.storage.ring_size,
        config.storage.sse_queue_max,
    )
    .await?;
    let metrics = Arc::new(MetricsStore::connect(&config.storage.db_path).await?);

    let shutdown = CancellationToken::new();
    let (sse_tx, _) = broadcast::channel::<SseNotice>(config.storage.sse_queue_max);

    let liveness_timeout = Duration::from_secs(config.pubsub.liveness_timeout_sec());
    let latest: Arc<RwLock<Option<ControlMessage>>> = Arc::new(RwLock::new(None));
    let watchdog = Arc::new(Mutex::new(LivenessWatchdog::new(liveness_timeout)));
    let sensor_history: Arc<RwLock<VecDeque<SensorSnapshot>>> =
        Arc::new(RwLock::new(VecDeque::with_capacity(SENSOR_HISTORY_LEN)));

    let mut mqttoptions = MqttOptions::new(format!("cooler-webui-{node_name}"), host, config.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        mqttoptions.set_credentials(user, pass);
    }
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
    client.subscribe(&config.mqtt.relay_topic, QoS::AtLeastOnce).await?;

    let subscriber_task = tokio::spawn(run_subscriber_loop(
        eventloop,
        latest.clone(),
        watchdog.clone(),
        sse_tx.clone(),
        liveness_timeout,
        shutdown.clone(),
    ));

    let log_poll_task = tokio::spawn(run_log_poll_loop(
        event_log.clone(),
        Duration::from_secs(2),
        sse_tx.clone(),
        shutdown.clone(),
    ));

    let tsdb_task = if dummy {
        None
    } else {
        let tsdb: Arc<dyn TsdbClient> = Arc::new(HttpTsdbClient::new(
            std::env::var("TSDB_URL").unwrap_or_else(|_| "http://localhost:8086".to_string()),
            node_name,
        ));
        Some(tokio::spawn(run_sensor_poll_loop(
            tsdb,
            Duration::from_secs(config.decider.lookback_sec),
            Duration::from_secs(config.pubsub.pub_interval_sec),
            sensor_history.clone(),
            sse_tx.clone(),
            shutdown.clone(),
        )))
    };

    let port = cli.port.unwrap_or(config.web.port);
    let state = AppState {
        event_log,
        metrics,
        latest,
        sensor_history,
        watchdog,
        sse_tx,
        started_at: tokio::time::Instant::now(),
        water_cost_per_liter: config.web.water_cost_per_liter,
    };
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        serve(port, state, server_shutdown).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl_c received, shutting down");
        }
        _ = terminate_signal() => {
            tracing::info!("sigterm received, shutting down");
        }
    }
    shutdown.cancel();

    let _ = tokio::join!(subscriber_task, server_task, log_poll_task);
    if let Some(t) = tsdb_task {
        let _ = t.await;
    }
    Ok(())
}

async fn serve(port: u16, state: AppState, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind web port {port}: {e}");
            return;
        }
    };
    tracing::info!("webui listening on http://{addr}");

    axum::serve(listener, web::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .ok();
}

/// MQTT subscriber + liveness watchdog, mirroring the actuator's
/// subscriber loop but feeding `/api/stat`'s cache instead of the scheduler.
async fn run_subscriber_loop(
    mut eventloop: rumqttc::EventLoop,
    latest: Arc<RwLock<Option<ControlMessage>>>,
    watchdog: Arc<Mutex<LivenessWatchdog>>,
    sse_tx: broadcast::Sender<SseNotice>,
    liveness_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut last_seen_id: u64 = 0;
    let mut watchdog_interval = tokio::time::interval(liveness_timeout.min(Duration::from_secs(5)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = watchdog_interval.tick() => {
                if watchdog.lock().await.check() {
                    tracing::warn!("webui liveness watchdog tripped");
                    let _ = sse_tx.send(SseNotice::Stat);
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match envelope::decode(&publish.payload) {
                        Ok(msg) => {
                            watchdog.lock().await.mark_seen();
                            // Ordering guard: ignore any message whose id
                            // is not strictly newer than the last one we
                            // displayed.
                            if msg.is_newer_than(last_seen_id) || latest.read().await.is_none() {
                                last_seen_id = msg.message_id;
                                *latest.write().await = Some(msg);
                                let _ = sse_tx.send(SseNotice::Stat);
                            }
                        }
                        Err(e) => tracing::warn!("dropping undecodable control message: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
        }
    }
}

/// Periodically polls the TSDB directly (same endpoint the controller
/// reads) so `/api/stat` can show recent sensor values without depending on
/// the controller to ever put them on the wire.
async fn run_sensor_poll_loop(
    tsdb: Arc<dyn TsdbClient>,
    lookback: Duration,
    poll_interval: Duration,
    sensor_history: Arc<RwLock<VecDeque<SensorSnapshot>>>,
    sse_tx: broadcast::Sender<SseNotice>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let Some(window) = tsdb::query_with_retry(|| tsdb.query_window(lookback)).await else {
            continue;
        };

        let snapshot = SensorSnapshot {
            ts: time::OffsetDateTime::now_utc(),
            power: window.power.as_ref().map(|s| s.value),
            temperature: window.temperature.as_ref().map(|s| s.value),
            humidity: window.humidity.as_ref().map(|s| s.value),
            lux: window.lux.as_ref().map(|s| s.value),
            solar_radiation: window.solar_radiation.as_ref().map(|s| s.value),
            rainfall: window.rainfall.as_ref().map(|s| s.value),
        };

        let mut history = sensor_history.write().await;
        if history.len() == SENSOR_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(snapshot);
        drop(history);

        let _ = sse_tx.send(SseNotice::Stat);
    }
}

/// Polls the event log's own latest id (webui never calls `EventLog::append`
/// itself, so nothing else would ever notice a new row landing) and fans a
/// `SseNotice::Log` out to `/api/event` subscribers whenever it advances.
async fn run_log_poll_loop(
    event_log: Arc<EventLog>,
    poll_interval: Duration,
    sse_tx: broadcast::Sender<SseNotice>,
    shutdown: CancellationToken,
) {
    let mut last_seen_id: i64 = match event_log.read_page(0, 1).await {
        Ok(page) => page.first().map(|r| r.id).unwrap_or(0),
        Err(_) => 0,
    };
    let mut interval = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        match event_log.read_page(0, 1).await {
            Ok(page) => {
                if let Some(newest) = page.first() {
                    if newest.id > last_seen_id {
                        last_seen_id = newest.id;
                        let _ = sse_tx.send(SseNotice::Log);
                    }
                }
            }
            Err(e) => tracing::warn!("log poll: {e}"),
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}
