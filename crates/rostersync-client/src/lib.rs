//! # Roster Sync Client
//!
//! Keeps a consumer's view of a visitor roster in step with a broker that
//! serves the roster as a one-shot snapshot plus a live stream of deltas.
//!
//! ## Reconciliation cycle
//!
//! On every successful connection the session:
//! 1. Subscribes to the delta topic and starts buffering batches
//! 2. Subscribes to the snapshot destination
//! 3. Delivers the snapshot once, unsubscribes the snapshot destination and
//!    flushes buffered batches in arrival order
//! 4. Forwards every later batch as it arrives
//!
//! Connection failures are retried immediately up to a fixed cap, after which
//! the session is permanently failed.
//!
//! ```ignore
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let config = RosterConfig::new("tcp://localhost:1883", Destinations::default());
//! let handle = connect(MqttTransport::default(), config, tx);
//! while let Some(update) = rx.recv().await {
//!     println!("{update:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod transport;

pub use config::RosterConfig;
pub use consumer::{Callbacks, RosterConsumer, RosterUpdate};
pub use error::SessionError;
pub use reconciler::{Reconciler, SessionState, SnapshotOutcome};
pub use retry::{RetryCounter, RetryDecision, RetryPolicy};
pub use rostersync_proto::{DeltaEntry, DeltaKind, Destinations, Roster, RosterEntry};
pub use session::{connect, RosterHandle};
pub use transport::{
    MockTransport, MqttTransport, MqttTransportConfig, Subscription, SubscriptionHandle,
    Transport, TransportError, TransportSession,
};
