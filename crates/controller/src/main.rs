//! Controller: queries the TSDB, runs the mode decider, and publishes
//! control messages on every tick.

mod cli;
mod healthz;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cooler_core::config::Config;
use cooler_core::decider::Decider;
use cooler_core::envelope;
use cooler_core::model::{ControlMessage, ControlState, FaultState};
use cooler_core::tsdb::{self, HttpTsdbClient, TsdbClient};

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
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    init_tracing(cli.debug);

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(config, cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("unrecoverable error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config, cli: cli::Cli) -> anyhow::Result<()> {
    let host = std::env::var("HEMS_SERVER_HOST").unwrap_or_else(|_| config.mqtt.host.clone());
    let node_name = std::env::var("NODE_HOSTNAME").unwrap_or_else(|_| "controller".to_string());
    // TEST is a bare test-hook flag; treated as an alias for
    // DUMMY_MODE since both mean "no real hardware/network side effects".
    let dummy = cli.dummy || std::env::var("DUMMY_MODE").is_ok() || std::env::var("TEST").is_ok();

    let mut mqttoptions = rumqttc::MqttOptions::new(
        format!("cooler-controller-{node_name}"),
        host.clone(),
        config.mqtt.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    client
        .subscribe(&config.mqtt.fault_topic, QoS::AtLeastOnce)
        .await?;

    let shutdown = CancellationToken::new();
    // Starts at 1, not 0: a fresh subscriber's `last_applied_id` is 0 and
    // `is_newer_than` is a strict `>`, so an id of 0 would never be applied.
    let message_id = Arc::new(AtomicU64::new(1));
    let last_seen_healthy = Arc::new(RwLock::new(true));
    // Set from the actuator's retained fault-status topic; overrides the
    // published ControlState regardless of what the decider computed.
    let hardware_fault = Arc::new(AtomicBool::new(false));

    let tsdb: Arc<dyn TsdbClient> = Arc::new(HttpTsdbClient::new(
        std::env::var("TSDB_URL").unwrap_or_else(|_| "http://localhost:8086".to_string()),
        node_name.clone(),
    ));

    // MQTT background pump — also the only place the actuator's fault
    // status ever reaches this process, since the fault is detected there.
    let mqtt_shutdown = shutdown.clone();
    let mqtt_hardware_fault = hardware_fault.clone();
    let mqtt_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = mqtt_shutdown.cancelled() => return,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("controller connected to mqtt");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match envelope::decode_fault_state(&publish.payload) {
                            Ok(state) => {
                                mqtt_hardware_fault.store(state != FaultState::Ok, Ordering::Relaxed);
                            }
                            Err(e) => tracing::warn!("dropping undecodable fault status: {e}"),
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
    });

    // Healthz server.
    let port = cli.port.unwrap_or(config.web.port);
    let healthz_healthy = last_seen_healthy.clone();
    let healthz_shutdown = shutdown.clone();
    let healthz_task = tokio::spawn(async move {
        healthz::serve(port, healthz_healthy, healthz_shutdown).await;
    });

    // Sensor-query + decide + publish tick loop.
    let tick_shutdown = shutdown.clone();
    let tick_task = tokio::spawn(tick_loop(
        config,
        tsdb,
        client,
        message_id,
        last_seen_healthy,
        hardware_fault,
        dummy,
        tick_shutdown,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl_c received, shutting down");
        }
        _ = terminate_signal() => {
            tracing::info!("sigterm received, shutting down");
        }
    }
    shutdown.cancel();

    let _ = tokio::join!(mqtt_task, healthz_task, tick_task);
    Ok(())
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

#[allow(clippy::too_many_arguments)]
async fn tick_loop(
    config: Config,
    tsdb: Arc<dyn TsdbClient>,
    client: AsyncClient,
    message_id: Arc<AtomicU64>,
    healthy: Arc<RwLock<bool>>,
    hardware_fault: Arc<AtomicBool>,
    dummy: bool,
    shutdown: CancellationToken,
) {
    let mut decider = Decider::new(&config.decider);
    let mut consecutive_absent: u32 = 0;
    let lookback = Duration::from_secs(config.decider.lookback_sec);
    let mut interval = tokio::time::interval(Duration::from_secs(config.pubsub.pub_interval_sec));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let window = if dummy {
            Some(cooler_core::model::SensorWindow::default())
        } else {
            tsdb::query_with_retry(|| tsdb.query_window(lookback)).await
        };

        // A present-but-stale window must be treated the same as an absent
        // one: the decider never sees samples older than `stale_threshold`.
        let stale_threshold = time::Duration::seconds(config.decider.stale_threshold_sec as i64);
        let window = window.filter(|w| {
            dummy || w.is_valid(time::OffsetDateTime::now_utc(), stale_threshold, &tsdb::ALL_METRICS)
        });

        let mode = match &window {
            Some(w) => {
                consecutive_absent = 0;
                decider.step(w)
            }
            None => {
                consecutive_absent += 1;
                if consecutive_absent == 2 {
                    tracing::warn!("sensor window absent for 2 consecutive ticks");
                } else if consecutive_absent >= 5 {
                    tracing::error!("sensor window absent for {consecutive_absent} consecutive ticks");
                }
                // No synthesized zeros: reuse the previously emitted mode
                // only within `stale_keep_ticks`, else force mode 0.
                if consecutive_absent <= config.decider.stale_keep_ticks {
                    cooler_core::model::Mode {
                        mode_index: decider.last_mode_index(),
                        duty: config
                            .decider
                            .modes
                            .get(decider.last_mode_index() as usize)
                            .copied()
                            .unwrap_or(cooler_core::model::Duty::OFF),
                    }
                } else {
                    cooler_core::model::Mode::IDLE
                }
            }
        };

        *healthy.write().await = true;

        let id = message_id.fetch_add(1, Ordering::Relaxed);
        let state = if hardware_fault.load(Ordering::Relaxed) {
            ControlState::Fault
        } else if mode.mode_index == 0 {
            ControlState::Idle
        } else {
            ControlState::Running
        };
        let msg = ControlMessage {
            message_id: id,
            ts: time::OffsetDateTime::now_utc(),
            mode_index: mode.mode_index,
            state,
            duty: mode.duty,
        };

        match envelope::encode(&msg) {
            Ok(payload) => {
                if let Err(e) = client
                    .publish(&config.mqtt.control_topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    tracing::warn!("publish failed: {e}");
                }
            }
            Err(e) => tracing::error!("encode failed: {e}"),
        }
    }
}
