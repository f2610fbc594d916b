//! Actuator: the duty scheduler, valve driver, flow sampler, fault
//! detector, event log, and metrics store all live in this one process.

mod cli;
mod slack;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use cooler_core::config::Config;
use cooler_core::envelope;
use cooler_core::eventlog::EventLog;
use cooler_core::fault::FaultDetector;
use cooler_core::flow::{FlowSampler, FlowSource};
use cooler_core::metrics::MetricsStore;
use cooler_core::model::{ControlMessage, ControlState, Duty, EventKind, EventLevel};
use cooler_core::scheduler;
use cooler_core::valve::{MockValveDriver, ValveDriver};

use slack::{NoopNotifier, SlackNotifier, WebhookNotifier};

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

/// Restore the working database from `backup_path` if the working copy is
/// missing or empty (tmpfs-reboot / SD-wear mitigation). Must run before
/// anything connects to `working_path`.
fn restore_from_backup(working_path: &str, backup_path: &str) -> anyhow::Result<bool> {
    let backup = std::path::Path::new(backup_path);
    if !backup.exists() {
        tracing::info!(backup_path, "no backup file found — starting fresh");
        return Ok(false);
    }

    let working = std::path::Path::new(working_path);
    let needs_restore =
        !working.exists() || working.metadata().map(|m| m.len() == 0).unwrap_or(true);

    if needs_restore {
        if let Some(parent) = working.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(backup, working)?;
        tracing::info!(backup_path, working_path, "database restored from backup");
        Ok(true)
    } else {
        tracing::debug!(working_path, "working database exists, skipping restore");
        Ok(false)
    }
}

async fn run(config: Config, cli: cli::Cli) -> anyhow::Result<()> {
    let host = std::env::var("HEMS_SERVER_HOST").unwrap_or_else(|_| config.mqtt.host.clone());
    let node_name = std::env::var("NODE_HOSTNAME").unwrap_or_else(|_| "actuator".to_string());
    // TEST is a bare test-hook flag; treated as an alias for
    // DUMMY_MODE since both mean "no real hardware/network side effects".
    let dummy = cli.dummy || std::env::var("DUMMY_MODE").is_ok() || std::env::var("TEST").is_ok();

    if let Some(backup_path) = &config.storage.backup_path {
        if let Err(e) = restore_from_backup(&config.storage.db_path, backup_path) {
            tracing::warn!("database restore failed: {e}");
        }
    }

    let event_log = EventLog::connect(
        &config.storage.db_path,
        config.storage.ring_size,
        config.storage.sse_queue_max,
    )
    .await?;
    let metrics = Arc::new(MetricsStore::connect(&config.storage.db_path).await?);

    event_log
        .append(EventLevel::Info, EventKind::Start, "actuator starting")
        .await
        .ok();

    let slack: Arc<dyn SlackNotifier> = match (&config.slack, dummy) {
        (Some(slack_cfg), false) => match &slack_cfg.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(slack_cfg.rate_limit_sec),
            )),
            None => Arc::new(NoopNotifier),
        },
        _ => Arc::new(NoopNotifier),
    };

    let use_gpio = !dummy && config.hardware.is_some() && cfg!(feature = "gpio");
    let hardware = config.hardware.clone();

    let valve: Box<dyn ValveDriver> = if use_gpio {
        #[cfg(feature = "gpio")]
        {
            let hw = hardware.as_ref().expect("checked above");
            match cooler_core::valve::gpio::GpioValveDriver::new(hw.valve_pin, hw.echo_pin) {
                Ok(driver) => Box::new(driver),
                Err(e) => {
                    tracing::error!("gpio valve init failed, falling back to mock: {e}");
                    Box::new(MockValveDriver::new())
                }
            }
        }
        #[cfg(not(feature = "gpio"))]
        {
            Box::new(MockValveDriver::new())
        }
    } else {
        Box::new(MockValveDriver::new())
    };

    let flow_source: Box<dyn FlowSource> = if use_gpio {
        #[cfg(feature = "gpio")]
        {
            let hw = hardware.as_ref().expect("checked above");
            match cooler_core::flow::gpio::GpioFlowSource::new(hw.flow_pin) {
                Ok(source) => Box::new(source),
                Err(e) => {
                    tracing::error!("gpio flow source init failed, falling back to sim: {e}");
                    default_flow_source(&hardware)
                }
            }
        }
        #[cfg(not(feature = "gpio"))]
        {
            default_flow_source(&hardware)
        }
    } else {
        default_flow_source(&hardware)
    };

    let flow_sample_hz = hardware.as_ref().map(|h| h.flow_sample_hz).unwrap_or(10.0);

    let mode_index = Arc::new(AtomicU16::new(0));
    let fault_detector = Arc::new(Mutex::new(FaultDetector::new(config.fault.clone())));

    let shutdown = CancellationToken::new();

    // Scheduler <-> valve wiring: the scheduler is the channel's sole
    // producer, so nothing else can ever reach the valve directly.
    let (control_tx, control_rx) = watch::channel::<Option<ControlMessage>>(None);
    let (valve_tx, valve_rx) = mpsc::channel(8);
    // Fault detector -> scheduler SAFE demotion: entering SAFE forces
    // an immediate close independent of whatever ControlMessage was last
    // accepted; leaving it only clears the block, it does not itself resume
    // duty.
    let (safe_tx, safe_rx) = watch::channel(false);

    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(scheduler::run(control_rx, safe_rx, valve_tx, scheduler_shutdown));

    let valve_task = tokio::spawn(run_valve_loop(
        valve,
        valve_rx,
        fault_detector.clone(),
        mode_index.clone(),
        metrics.clone(),
        event_log.clone(),
    ));

    let mut mqttoptions = MqttOptions::new(
        format!("cooler-actuator-{node_name}"),
        host,
        config.mqtt.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        mqttoptions.set_credentials(user, pass);
    }
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
    client
        .subscribe(&config.mqtt.relay_topic, QoS::AtLeastOnce)
        .await?;

    let fault_client = client.clone();
    let fault_topic = config.mqtt.fault_topic.clone();

    let flow_task = tokio::spawn(run_flow_loop(
        flow_source,
        flow_sample_hz,
        Duration::from_secs(config.fault.flow_window_sec),
        fault_detector.clone(),
        mode_index.clone(),
        metrics.clone(),
        event_log.clone(),
        slack.clone(),
        safe_tx,
        fault_client,
        fault_topic,
        shutdown.clone(),
    ));

    let liveness_timeout = Duration::from_secs(config.pubsub.liveness_timeout_sec());
    let subscriber_shutdown = shutdown.clone();
    let subscriber_mode_index = mode_index.clone();
    let subscriber_event_log = event_log.clone();
    let subscriber_task = tokio::spawn(run_subscriber_loop(
        client,
        eventloop,
        control_tx,
        liveness_timeout,
        subscriber_mode_index,
        subscriber_event_log,
        subscriber_shutdown,
    ));

    // Periodic retention prune + SQLite backup.
    let prune_shutdown = shutdown.clone();
    let prune_event_log = event_log.clone();
    let prune_metrics = metrics.clone();
    let retention_days = config.storage.retention_days;
    let prune_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(6 * 3600));
        loop {
            tokio::select! {
                _ = prune_shutdown.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = prune_event_log.prune(retention_days).await {
                        tracing::warn!("event log prune failed: {e}");
                    }
                    if let Err(e) = prune_metrics.prune().await {
                        tracing::warn!("metrics prune failed: {e}");
                    }
                }
            }
        }
    });

    let backup_shutdown = shutdown.clone();
    let backup_metrics = metrics.clone();
    let backup_path = config.storage.backup_path.clone();
    let backup_interval_hours = config.storage.backup_interval_hours;
    let backup_task = tokio::spawn(async move {
        let Some(backup_path) = backup_path else {
            return;
        };
        let mut interval =
            tokio::time::interval(Duration::from_secs(backup_interval_hours * 3600));
        loop {
            tokio::select! {
                _ = backup_shutdown.cancelled() => {
                    if let Err(e) = backup_metrics.backup(&backup_path).await {
                        tracing::warn!("final backup failed: {e}");
                    }
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = backup_metrics.backup(&backup_path).await {
                        tracing::warn!("periodic backup failed: {e}");
                    }
                }
            }
        }
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

    let _ = tokio::join!(
        scheduler_task,
        valve_task,
        flow_task,
        subscriber_task,
        prune_task,
        backup_task,
    );

    event_log
        .append(EventLevel::Info, EventKind::Stop, "actuator stopped")
        .await
        .ok();
    Ok(())
}

#[cfg(feature = "sim-flow")]
fn default_flow_source(
    hardware: &Option<cooler_core::config::HardwareConfig>,
) -> Box<dyn FlowSource> {
    let (base, sigma, leak) = hardware
        .as_ref()
        .map(|h| (h.sim_base_lpm, h.sim_noise_sigma, h.sim_leak_lpm))
        .unwrap_or((3.0, 0.1, 0.0));
    Box::new(cooler_core::flow::SimFlowSource::new(base, sigma, leak))
}

#[cfg(not(feature = "sim-flow"))]
fn default_flow_source(
    _hardware: &Option<cooler_core::config::HardwareConfig>,
) -> Box<dyn FlowSource> {
    Box::new(NoFlow)
}

#[cfg(not(feature = "sim-flow"))]
struct NoFlow;

#[cfg(not(feature = "sim-flow"))]
impl FlowSource for NoFlow {
    fn read(&mut self) -> f64 {
        0.0
    }
}

/// Subscriber + liveness watchdog, combined in one task so both can share
/// the watchdog struct without a lock — a single `tokio::select!` loop over
/// the MQTT event loop plus an interval ticker.
async fn run_subscriber_loop(
    _client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    control_tx: watch::Sender<Option<ControlMessage>>,
    liveness_timeout: Duration,
    mode_index: Arc<AtomicU16>,
    event_log: Arc<EventLog>,
    shutdown: CancellationToken,
) {
    let mut watchdog = cooler_core::watchdog::LivenessWatchdog::new(liveness_timeout);
    let mut last_seen_id: u64 = 0;
    let mut watchdog_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = watchdog_interval.tick() => {
                if watchdog.check() {
                    tracing::warn!("liveness watchdog tripped, forcing SAFE mode");
                    event_log
                        .append(EventLevel::Warn, EventKind::Fault, "no control message received within liveness timeout")
                        .await
                        .ok();
                    last_seen_id += 1;
                    let synthetic = ControlMessage {
                        message_id: last_seen_id,
                        ts: time::OffsetDateTime::now_utc(),
                        mode_index: 0,
                        state: ControlState::Stopping,
                        duty: Duty::OFF,
                    };
                    let _ = control_tx.send(Some(synthetic));
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match envelope::decode(&publish.payload) {
                        Ok(msg) => {
                            if msg.message_id > last_seen_id {
                                last_seen_id = msg.message_id;
                            }
                            watchdog.mark_seen();
                            mode_index.store(msg.mode_index, Ordering::Relaxed);
                            let _ = control_tx.send(Some(msg));
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

/// Sole consumer of the scheduler's valve commands, per the single-writer
/// discipline — ends naturally once the scheduler task exits and drops its
/// sender half, closing this channel.
async fn run_valve_loop(
    mut valve: Box<dyn ValveDriver>,
    mut valve_rx: mpsc::Receiver<cooler_core::model::ValveCommand>,
    fault_detector: Arc<Mutex<FaultDetector>>,
    mode_index: Arc<AtomicU16>,
    metrics: Arc<MetricsStore>,
    event_log: Arc<EventLog>,
) {
    let mut open_since: Option<tokio::time::Instant> = None;

    while let Some(cmd) = valve_rx.recv().await {
        let now = std::time::Instant::now();
        let result = if cmd.open {
            valve.open().await
        } else {
            valve.close().await
        };

        if let Err(e) = result {
            tracing::error!("valve write failed: {e}");
            event_log
                .append(EventLevel::Err, EventKind::Fault, format!("valve write failed: {e}"))
                .await
                .ok();
        }

        tokio::time::sleep(cooler_core::valve::ECHO_SAMPLE_DELAY).await;
        if let Some(echo) = valve.read_echo() {
            if echo != cmd.open {
                tracing::warn!("valve echo mismatch: commanded {}, echoed {}", cmd.open, echo);
            }
        }

        fault_detector.lock().await.on_valve_command(cmd.open, now);

        let mode = mode_index.load(Ordering::Relaxed);
        if cmd.open {
            open_since = Some(tokio::time::Instant::now());
            event_log
                .append(EventLevel::Info, EventKind::DutyOn, "valve opened")
                .await
                .ok();
        } else {
            if let Some(since) = open_since.take() {
                let open_sec = since.elapsed().as_secs() as i64;
                if let Err(e) = metrics
                    .add_open_seconds(MetricsStore::today_local(), mode, open_sec)
                    .await
                {
                    tracing::warn!("metrics add_open_seconds failed: {e}");
                }
            }
            event_log
                .append(EventLevel::Info, EventKind::DutyOff, "valve closed")
                .await
                .ok();
        }
    }
}

/// Samples the flow source at a fixed rate, feeding the trailing-window
/// estimate into the fault detector and accumulating integrated volume.
#[allow(clippy::too_many_arguments)]
async fn run_flow_loop(
    mut flow_source: Box<dyn FlowSource>,
    sample_hz: f64,
    window: Duration,
    fault_detector: Arc<Mutex<FaultDetector>>,
    mode_index: Arc<AtomicU16>,
    metrics: Arc<MetricsStore>,
    event_log: Arc<EventLog>,
    slack: Arc<dyn SlackNotifier>,
    safe_tx: watch::Sender<bool>,
    fault_client: AsyncClient,
    fault_topic: String,
    shutdown: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / sample_hz.max(0.1));
    let mut interval = tokio::time::interval(period);
    let mut sampler = FlowSampler::new(window);
    let mut last_sample_at = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let now = std::time::Instant::now();
                let elapsed = now.duration_since(last_sample_at).as_secs_f64();
                last_sample_at = now;

                let value_lpm = flow_source.read();
                sampler.push(value_lpm, now);
                let estimate = sampler.estimate();

                let mode = mode_index.load(Ordering::Relaxed);
                let liters = value_lpm * (elapsed / 60.0);
                if liters > 0.0 {
                    if let Err(e) = metrics.add_volume(MetricsStore::today_local(), mode, liters).await {
                        tracing::warn!("metrics add_volume failed: {e}");
                    }
                }

                let transition = fault_detector.lock().await.step(estimate, now);
                if let Some(new_state) = transition {
                    use cooler_core::model::FaultState;
                    match envelope::encode_fault_state(new_state) {
                        Ok(payload) => {
                            if let Err(e) = fault_client
                                .publish(&fault_topic, QoS::AtLeastOnce, true, payload)
                                .await
                            {
                                tracing::warn!("fault status publish failed: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("fault status encode failed: {e}"),
                    }
                    if new_state == FaultState::Ok {
                        event_log
                            .append(EventLevel::Info, EventKind::Recover, "fault condition cleared")
                            .await
                            .ok();
                        let _ = safe_tx.send(false);
                    } else {
                        let message = format!("fault detected: {new_state:?}");
                        tracing::error!("{message}");
                        event_log
                            .append(EventLevel::Err, EventKind::Fault, message.clone())
                            .await
                            .ok();
                        if let Err(e) = metrics.add_fault(MetricsStore::today_local(), mode).await {
                            tracing::warn!("metrics add_fault failed: {e}");
                        }
                        slack.notify(&message).await;
                        // Only a confirmed no-water/leak fault demotes the
                        // scheduler to SAFE — UNSTABLE is reported but
                        // does not itself block duty.
                        if matches!(new_state, FaultState::NoFlowWhileOpen | FaultState::FlowWhileClosed) {
                            let _ = safe_tx.send(true);
                        }
                    }
                }
            }
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
