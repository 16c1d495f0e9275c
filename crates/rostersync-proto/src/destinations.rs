//! Broker destinations for a roster.
//!
//! A roster is served on two destinations:
//! - the snapshot destination, point-to-point, answered once per subscriber
//! - the delta destination, a broadcast topic carrying incremental changes

use serde::{Deserialize, Serialize};

/// Default snapshot destination.
pub const DEFAULT_SNAPSHOT: &str = "visitors/list";

/// Default delta destination.
pub const DEFAULT_DELTA: &str = "visitors/updates";

/// Characters that turn a topic name into a subscription filter.
const WILDCARDS: [char; 2] = ['+', '#'];

/// The destination pair a roster session subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destinations {
    /// Queue answering with the full roster
    pub snapshot: String,
    /// Topic carrying delta batches
    pub delta: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            snapshot: DEFAULT_SNAPSHOT.to_string(),
            delta: DEFAULT_DELTA.to_string(),
        }
    }
}

impl Destinations {
    /// Create a validated destination pair.
    ///
    /// # Errors
    ///
    /// Returns error if either destination is empty or a wildcard filter,
    /// or both are the same.
    pub fn new(
        snapshot: impl Into<String>,
        delta: impl Into<String>,
    ) -> Result<Self, DestinationError> {
        let destinations = Self {
            snapshot: snapshot.into(),
            delta: delta.into(),
        };
        destinations.validate()?;
        Ok(destinations)
    }

    /// Check that both destinations are usable.
    ///
    /// # Errors
    ///
    /// Returns error if either destination is empty or a wildcard filter,
    /// or both are the same.
    pub fn validate(&self) -> Result<(), DestinationError> {
        if self.snapshot.trim().is_empty() {
            return Err(DestinationError::Empty("snapshot"));
        }
        if self.delta.trim().is_empty() {
            return Err(DestinationError::Empty("delta"));
        }
        for name in [&self.snapshot, &self.delta] {
            if name.contains(WILDCARDS) {
                return Err(DestinationError::Wildcard(name.clone()));
            }
        }
        if self.snapshot == self.delta {
            return Err(DestinationError::Same(self.snapshot.clone()));
        }
        Ok(())
    }
}

/// Errors for destination configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DestinationError {
    /// A destination is blank
    #[error("{0} destination is empty")]
    Empty(&'static str),
    /// Snapshot and delta share a destination
    #[error("snapshot and delta destinations are both '{0}'")]
    Same(String),
    /// Destinations must be literal names; frames are routed by exact match
    #[error("destination '{0}' contains a wildcard")]
    Wildcard(String),
}
