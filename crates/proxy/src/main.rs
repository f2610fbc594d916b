//! Cache-Proxy: relays the controller's published control messages to
//! downstream subscribers, replaying the last message to late joiners
//! within `replay_deadline`.

mod cache;
mod cli;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;

use cache::LastValueCache;
use cooler_core::config::Config;
use cooler_core::envelope;

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

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("unrecoverable error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let host = std::env::var("HEMS_SERVER_HOST").unwrap_or_else(|_| config.mqtt.host.clone());

    // Upstream connection: subscribes to the controller's publish topic.
    let mut up_opts = MqttOptions::new("cooler-proxy-upstream", host.clone(), config.mqtt.port);
    up_opts.set_keep_alive(Duration::from_secs(30));
    let (up_client, mut up_eventloop) = AsyncClient::new(up_opts, 10);
    up_client
        .subscribe(&config.mqtt.control_topic, QoS::AtLeastOnce)
        .await?;

    // Downstream connection: re-publishes with retain=true so a freshly
    // (re)connected subscriber gets the cached message on subscribe, well
    // within `replay_deadline`.
    let mut down_opts = MqttOptions::new("cooler-proxy-downstream", host, config.mqtt.port);
    down_opts.set_keep_alive(Duration::from_secs(30));
    let (down_client, mut down_eventloop) = AsyncClient::new(down_opts, 10);

    let shutdown = CancellationToken::new();
    let mut cache = LastValueCache::new();

    let down_shutdown = shutdown.clone();
    let down_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = down_shutdown.cancelled() => return,
                event = down_eventloop.poll() => {
                    if let Err(e) = event {
                        tracing::warn!("downstream mqtt error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });

    let relay_topic = config.mqtt.relay_topic.clone();
    let relay_shutdown = shutdown.clone();
    let relay_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = relay_shutdown.cancelled() => return,
                event = up_eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(msg) = envelope::decode(&publish.payload) else {
                            tracing::warn!("dropping undecodable upstream message");
                            continue;
                        };
                        let Some(forward) = cache.offer(msg) else {
                            continue;
                        };
                        match envelope::encode(&forward) {
                            Ok(payload) => {
                                if let Err(e) = down_client
                                    .publish(&relay_topic, QoS::AtLeastOnce, true, payload)
                                    .await
                                {
                                    tracing::warn!("downstream publish failed: {e}");
                                }
                            }
                            Err(e) => tracing::error!("re-encode failed: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("upstream mqtt error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
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
    let _ = tokio::join!(down_task, relay_task);
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
