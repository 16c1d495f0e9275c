//! Consumer contracts.

use rostersync_proto::{DeltaEntry, RosterEntry};
use tokio::sync::mpsc;

/// Receives roster updates from a session.
///
/// Called only from the session's dispatcher task, one call at a time.
/// Implementations must hand work off rather than block.
pub trait RosterConsumer: Send + 'static {
    /// Full roster, once per synchronization cycle.
    fn on_initial(&mut self, roster: Vec<RosterEntry>);

    /// One ordered delta batch.
    fn on_delta(&mut self, batch: Vec<DeltaEntry>);

    /// The broker accepted a connection.
    fn on_connected(&mut self) {}
}

/// Update forwarded by the channel consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterUpdate {
    /// The broker accepted a connection
    Connected,
    /// Full roster for a new cycle
    Initial(Vec<RosterEntry>),
    /// Delta batch
    Delta(Vec<DeltaEntry>),
}

impl RosterConsumer for mpsc::UnboundedSender<RosterUpdate> {
    fn on_initial(&mut self, roster: Vec<RosterEntry>) {
        if self.send(RosterUpdate::Initial(roster)).is_err() {
            tracing::debug!("Roster update receiver dropped");
        }
    }

    fn on_delta(&mut self, batch: Vec<DeltaEntry>) {
        if self.send(RosterUpdate::Delta(batch)).is_err() {
            tracing::debug!("Roster update receiver dropped");
        }
    }

    fn on_connected(&mut self) {
        if self.send(RosterUpdate::Connected).is_err() {
            tracing::debug!("Roster update receiver dropped");
        }
    }
}

type ConnectedFn = Box<dyn FnMut() + Send>;

/// Closure-based consumer.
pub struct Callbacks<I, D> {
    initial: I,
    delta: D,
    connected: Option<ConnectedFn>,
}

impl<I, D> Callbacks<I, D>
where
    I: FnMut(Vec<RosterEntry>) + Send + 'static,
    D: FnMut(Vec<DeltaEntry>) + Send + 'static,
{
    /// Consumer from an initial-roster closure and a delta closure.
    pub fn new(initial: I, delta: D) -> Self {
        Self {
            initial,
            delta,
            connected: None,
        }
    }

    /// Also run `connected` whenever the broker accepts a connection.
    #[must_use]
    pub fn with_connected(mut self, connected: impl FnMut() + Send + 'static) -> Self {
        self.connected = Some(Box::new(connected));
        self
    }
}

impl<I, D> RosterConsumer for Callbacks<I, D>
where
    I: FnMut(Vec<RosterEntry>) + Send + 'static,
    D: FnMut(Vec<DeltaEntry>) + Send + 'static,
{
    fn on_initial(&mut self, roster: Vec<RosterEntry>) {
        (self.initial)(roster);
    }

    fn on_delta(&mut self, batch: Vec<DeltaEntry>) {
        (self.delta)(batch);
    }

    fn on_connected(&mut self) {
        if let Some(connected) = self.connected.as_mut() {
            connected();
        }
    }
}
