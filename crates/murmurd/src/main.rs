//! murmurd: the murmur peer-to-peer daemon.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use murmur_core::config::MurmurConfig;
use murmur_core::Ports;
use murmur_transport::MessageStreams;
use murmurd::Instance;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = MurmurConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MurmurConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MurmurConfig::default()
    });
    config.validate().context("invalid configuration")?;

    let ports = Ports {
        secure: config.network.secure_port,
        greet: config.network.greet_port,
        health: config.network.health_port,
    };

    let cancel = CancellationToken::new();
    let mut rng = StdRng::from_entropy();
    let (mut instance, streams) = Instance::bind(config.bind_ip()?, ports, &mut rng, cancel.clone()).await?;
    instance.configure_discovery(&config)?;

    tokio::spawn(log_messages(streams));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    instance.run().await
}

/// Nothing consumes messages in the daemon itself; log them.
async fn log_messages(mut streams: MessageStreams) {
    loop {
        tokio::select! {
            Some(m) = streams.received.recv() => {
                tracing::info!(from = %m.from.name, peer = %m.from.id, message = %m.id, text = %m.text, "received");
            }
            Some(m) = streams.sent.recv() => {
                tracing::debug!(to = %m.to.name, message = %m.id, "sent");
            }
            else => break,
        }
    }
}
