//! # Roster Sync Agent
//!
//! Follows a visitor roster on an MQTT broker and logs every change.
//!
//! Configuration comes from `ROSTERSYNC_*` environment variables; logging is
//! controlled with `RUST_LOG`. The agent exits when interrupted or once the
//! session gives up reconnecting.

use anyhow::Result;
use rostersync_client::{connect, MqttTransport, MqttTransportConfig, RosterUpdate};
use rostersync_proto::Roster;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;

pub use config::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting roster sync agent"
    );

    let config = AgentConfig::from_env()?;

    tracing::info!(
        client_id = %config.client_id,
        broker = %config.roster.broker_url,
        snapshot = %config.destinations().snapshot,
        delta = %config.destinations().delta,
        "Agent configured"
    );

    let transport = MqttTransport::new(MqttTransportConfig {
        client_id: config.client_id.clone(),
        ..MqttTransportConfig::default()
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = connect(transport, config.roster, tx);
    let mut roster = Roster::new();

    tracing::info!("Agent running, press Ctrl+C to stop");

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => apply_update(&mut roster, update),
                // The session dropped its consumer: it has stopped on its own.
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                handle.close().await?;
                return Ok(());
            }
        }
    }

    handle.join().await?;
    Ok(())
}

/// Fold one update into the local roster.
fn apply_update(roster: &mut Roster, update: RosterUpdate) {
    match update {
        RosterUpdate::Connected => {
            tracing::info!("Connected, waiting for roster snapshot");
        }
        RosterUpdate::Initial(snapshot) => {
            *roster = Roster::from_snapshot(&snapshot);
            tracing::info!(visitors = roster.len(), "Roster loaded");
        }
        RosterUpdate::Delta(batch) => {
            for entry in &batch {
                tracing::info!(
                    id = %entry.id,
                    role = %entry.role,
                    change = ?entry.kind(),
                    "Roster change"
                );
            }
            roster.apply(&batch);
            tracing::debug!(visitors = roster.len(), "Roster updated");
        }
    }
}
