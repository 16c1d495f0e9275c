//! Session configuration.

use crate::retry::RetryPolicy;
use rostersync_proto::Destinations;
use std::time::Duration;

/// Configuration for one roster session.
#[derive(Debug, Clone)]
pub struct RosterConfig {
    /// Broker URL
    pub broker_url: String,
    /// Snapshot and delta destinations
    pub destinations: Destinations,
    /// Bearer token attached when connecting
    pub auth_token: Option<String>,
    /// Reconnection policy
    pub retry: RetryPolicy,
    /// How long to wait for a snapshot before re-subscribing; `None` or zero
    /// waits forever
    pub snapshot_timeout: Option<Duration>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            destinations: Destinations::default(),
            auth_token: None,
            retry: RetryPolicy::default(),
            snapshot_timeout: None,
        }
    }
}

impl RosterConfig {
    /// Configuration for a broker and destination pair, other fields default.
    #[must_use]
    pub fn new(broker_url: impl Into<String>, destinations: Destinations) -> Self {
        Self {
            broker_url: broker_url.into(),
            destinations,
            ..Self::default()
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Replace the reconnection policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Re-subscribe to the snapshot destination if it stays silent this long.
    ///
    /// A zero timeout disables the limit.
    #[must_use]
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = Some(timeout).filter(|timeout| !timeout.is_zero());
        self
    }
}
