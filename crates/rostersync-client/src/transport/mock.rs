//! In-memory broker for testing.
//!
//! Records every open, subscribe, unsubscribe and close, lets tests publish
//! frames to whatever subscriptions are live, and can fail opens or drop
//! connections on demand.

use super::{SessionErrors, Subscription, SubscriptionHandle, Transport, TransportError, TransportSession};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

/// A call observed by the mock broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// Connection opened (or attempted)
    Open {
        /// Broker URL
        url: String,
        /// Bearer token, if supplied
        auth_token: Option<String>,
    },
    /// Subscription created
    Subscribe {
        /// Session that subscribed
        session: u64,
        /// Destination
        destination: String,
    },
    /// Subscription removed
    Unsubscribe {
        /// Session that unsubscribed
        session: u64,
        /// Destination
        destination: String,
    },
    /// Session closed by its owner
    Close {
        /// Session closed
        session: u64,
    },
}

/// Mock transport for testing.
///
/// Clones share the same broker state.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockBroker>>,
    changed: Arc<Notify>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct MockBroker {
    calls: Vec<MockCall>,
    open_failures: VecDeque<TransportError>,
    subscriptions: Vec<LiveSubscription>,
    sessions: Vec<LiveSession>,
    next_session: u64,
    next_subscription: u64,
}

#[derive(Debug)]
struct LiveSubscription {
    session: u64,
    id: u64,
    destination: String,
    frames: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug)]
struct LiveSession {
    id: u64,
    errors: mpsc::Sender<TransportError>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock broker with roomy subscription channels.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a mock broker with the given subscription channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockBroker::default())),
            changed: Arc::new(Notify::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockBroker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` opens with a connection error.
    pub fn fail_next_opens(&self, count: usize, error: &str) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner
                .open_failures
                .push_back(TransportError::Connection(error.to_string()));
        }
    }

    /// Fail the next open with the given error.
    pub fn fail_next_open_with(&self, error: TransportError) {
        self.lock().open_failures.push_back(error);
    }

    /// Every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of open attempts, failed ones included.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Open { .. }))
            .count()
    }

    /// Destinations with a live subscription, in subscription order.
    #[must_use]
    pub fn active_destinations(&self) -> Vec<String> {
        self.lock()
            .subscriptions
            .iter()
            .map(|sub| sub.destination.clone())
            .collect()
    }

    /// Deliver a frame to every live subscription on `destination`.
    ///
    /// Returns the number of subscriptions that received it.
    pub async fn publish(&self, destination: &str, frame: impl Into<Vec<u8>>) -> usize {
        let frame = frame.into();
        let targets: Vec<mpsc::Sender<Vec<u8>>> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.destination == destination)
            .map(|sub| sub.frames.clone())
            .collect();

        let mut delivered = 0;
        for target in targets {
            if target.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Break every live session with a connection error.
    ///
    /// Each session gets the error before its subscription channels close.
    pub fn drop_connections(&self, error: &str) {
        let subscriptions = {
            let mut inner = self.lock();
            for session in std::mem::take(&mut inner.sessions) {
                let _ = session
                    .errors
                    .try_send(TransportError::Connection(error.to_string()));
            }
            std::mem::take(&mut inner.subscriptions)
        };

        drop(subscriptions);
        self.changed.notify_waiters();
    }

    /// Wait until `destination` has at least `count` live subscriptions.
    pub async fn wait_for_subscribers(&self, destination: &str, count: usize) {
        loop {
            let changed = self.changed.notified();
            let live = self
                .lock()
                .subscriptions
                .iter()
                .filter(|sub| sub.destination == destination)
                .count();
            if live >= count {
                return;
            }
            changed.await;
        }
    }

    /// Wait until `destination` has no live subscription.
    pub async fn wait_for_no_subscribers(&self, destination: &str) {
        loop {
            let changed = self.changed.notified();
            if !self
                .lock()
                .subscriptions
                .iter()
                .any(|sub| sub.destination == destination)
            {
                return;
            }
            changed.await;
        }
    }

    /// Wait until at least `count` opens were attempted.
    pub async fn wait_for_opens(&self, count: usize) {
        loop {
            let changed = self.changed.notified();
            if self.open_count() >= count {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Session = MockSession;

    async fn open(
        &self,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<(MockSession, SessionErrors), TransportError> {
        let result = {
            let mut inner = self.lock();
            inner.calls.push(MockCall::Open {
                url: url.to_string(),
                auth_token: auth_token.map(str::to_string),
            });

            match inner.open_failures.pop_front() {
                Some(error) => Err(error),
                None => {
                    let id = inner.next_session;
                    inner.next_session += 1;

                    let (errors_tx, errors_rx) = mpsc::channel(1);
                    inner.sessions.push(LiveSession {
                        id,
                        errors: errors_tx,
                    });

                    Ok((
                        MockSession {
                            id,
                            transport: self.clone(),
                            closed: false,
                        },
                        errors_rx,
                    ))
                }
            }
        };

        self.changed.notify_waiters();
        result
    }
}

/// Session handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockSession {
    id: u64,
    transport: MockTransport,
    closed: bool,
}

impl MockSession {
    fn is_live(&self) -> bool {
        !self.closed
            && self
                .transport
                .lock()
                .sessions
                .iter()
                .any(|session| session.id == self.id)
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut inner = self.transport.lock();
            inner.subscriptions.retain(|sub| sub.session != self.id);
            inner.sessions.retain(|session| session.id != self.id);
        }
        self.transport.changed.notify_waiters();
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn subscribe(&mut self, destination: &str) -> Result<Subscription, TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closed);
        }

        let (frames_tx, frames_rx) = mpsc::channel(self.transport.capacity);
        let id = {
            let mut inner = self.transport.lock();
            let id = inner.next_subscription;
            inner.next_subscription += 1;
            inner.subscriptions.push(LiveSubscription {
                session: self.id,
                id,
                destination: destination.to_string(),
                frames: frames_tx,
            });
            inner.calls.push(MockCall::Subscribe {
                session: self.id,
                destination: destination.to_string(),
            });
            id
        };
        self.transport.changed.notify_waiters();

        Ok(Subscription {
            handle: SubscriptionHandle::new(id, destination),
            messages: frames_rx,
        })
    }

    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closed);
        }

        {
            let mut inner = self.transport.lock();
            inner
                .subscriptions
                .retain(|sub| !(sub.session == self.id && sub.id == handle.id()));
            inner.calls.push(MockCall::Unsubscribe {
                session: self.id,
                destination: handle.destination().to_string(),
            });
        }
        self.transport.changed.notify_waiters();

        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.transport
                .lock()
                .calls
                .push(MockCall::Close { session: self.id });
        }
        self.teardown();
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
