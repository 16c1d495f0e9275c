//! Broker transport abstraction.
//!
//! A [`Transport`] opens one physical connection per call and hands back a
//! [`TransportSession`] plus a receiver for asynchronous session failures.
//! Frames for each subscription arrive on that subscription's own bounded
//! channel. Sessions never reconnect on their own; the owner decides.

mod mock;
mod mqtt;

pub use mock::{MockCall, MockTransport};
pub use mqtt::{MqttSession, MqttTransport, MqttTransportConfig};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Network or handshake failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker-level fault (refused CONNACK, bad frame, protocol violation).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Broker URL cannot be used.
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Session already closed.
    #[error("session closed")]
    Closed,
}

/// Identifies one subscription within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    destination: String,
}

impl SubscriptionHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(id: u64, destination: impl Into<String>) -> Self {
        Self {
            id,
            destination: destination.into(),
        }
    }

    /// Session-local subscription id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed destination.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// An active subscription and its frame stream.
#[derive(Debug)]
pub struct Subscription {
    /// Handle used to unsubscribe
    pub handle: SubscriptionHandle,
    /// Raw frames in broker delivery order
    pub messages: mpsc::Receiver<Vec<u8>>,
}

/// Asynchronous failures reported by an open session.
pub type SessionErrors = mpsc::Receiver<TransportError>;

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by [`Transport::open`].
    type Session: TransportSession;

    /// Open one connection, attaching `auth_token` as a bearer credential
    /// when supplied.
    ///
    /// Resolves once the broker accepted the connection.
    async fn open(
        &self,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<(Self::Session, SessionErrors), TransportError>;
}

/// One logical broker connection.
#[async_trait]
pub trait TransportSession: Send + 'static {
    /// Subscribe to a destination.
    ///
    /// The route is in place before the subscription request reaches the
    /// broker, so no frame answering it is missed.
    async fn subscribe(&mut self, destination: &str) -> Result<Subscription, TransportError>;

    /// Stop delivery for a subscription. Frames still in flight are dropped.
    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    /// Tear down every subscription and disconnect.
    ///
    /// Nothing new is routed to the session's channels afterwards; frames
    /// already queued stay in their receivers until those are dropped.
    async fn close(&mut self);
}
