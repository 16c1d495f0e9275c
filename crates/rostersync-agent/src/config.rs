//! Agent configuration.

use anyhow::{bail, Context, Result};
use rostersync_client::RosterConfig;
use rostersync_proto::Destinations;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// MQTT client identifier
    pub client_id: String,

    /// Session configuration handed to the client
    pub roster: RosterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: format!("rostersync-{}", Uuid::new_v4()),
            roster: RosterConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ROSTERSYNC_BROKER_URL`: Broker URL
    /// - `ROSTERSYNC_SNAPSHOT_DESTINATION`: Snapshot destination
    /// - `ROSTERSYNC_DELTA_DESTINATION`: Delta topic
    /// - `ROSTERSYNC_TOKEN`: Bearer token
    /// - `ROSTERSYNC_CLIENT_ID`: MQTT client ID
    /// - `ROSTERSYNC_MAX_RETRIES`: Retries before giving up
    /// - `ROSTERSYNC_SNAPSHOT_TIMEOUT_SECS`: Snapshot wait before re-subscribing
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the destinations are
    /// unusable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("ROSTERSYNC_BROKER_URL") {
            config.roster.broker_url = url;
        }

        if let Some(snapshot) = lookup("ROSTERSYNC_SNAPSHOT_DESTINATION") {
            config.roster.destinations.snapshot = snapshot;
        }

        if let Some(delta) = lookup("ROSTERSYNC_DELTA_DESTINATION") {
            config.roster.destinations.delta = delta;
        }

        config
            .roster
            .destinations
            .validate()
            .context("Invalid roster destinations")?;

        if let Some(token) = lookup("ROSTERSYNC_TOKEN") {
            config.roster.auth_token = Some(token);
        }

        if let Some(client_id) = lookup("ROSTERSYNC_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Some(retries) = lookup("ROSTERSYNC_MAX_RETRIES") {
            config.roster.retry.max_retries = retries
                .parse()
                .context("Invalid ROSTERSYNC_MAX_RETRIES")?;
        }

        if let Some(secs) = lookup("ROSTERSYNC_SNAPSHOT_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid ROSTERSYNC_SNAPSHOT_TIMEOUT_SECS")?;
            if secs == 0 {
                bail!("ROSTERSYNC_SNAPSHOT_TIMEOUT_SECS must be at least 1; unset it to wait forever");
            }
            config.roster.snapshot_timeout = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// The destinations this agent follows.
    #[must_use]
    pub fn destinations(&self) -> &Destinations {
        &self.roster.destinations
    }
}
