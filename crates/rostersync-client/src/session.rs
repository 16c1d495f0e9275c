//! Roster session runtime.
//!
//! [`connect`] spawns one dispatcher task per session. The dispatcher owns
//! the transport session, the reconciler and the retry counter, and consumes
//! the delta channel, the snapshot channel and the session error channel in a
//! single `select!` loop, so every state transition happens on one task.

use crate::config::RosterConfig;
use crate::consumer::RosterConsumer;
use crate::error::SessionError;
use crate::reconciler::{Reconciler, SessionState, SnapshotOutcome};
use crate::retry::{RetryCounter, RetryDecision};
use crate::transport::{SessionErrors, Subscription, Transport, TransportError, TransportSession};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Parked duration for the snapshot timer when no timeout is configured.
const NO_DEADLINE: Duration = Duration::from_secs(86_400);

/// Start synchronizing a roster.
///
/// Returns immediately; connection, retries and delivery run on a spawned
/// task. Failures are never returned from here: they are logged and, once
/// retries are exhausted, reported through the handle. Must be called from
/// within a Tokio runtime.
pub fn connect<T, C>(transport: T, config: RosterConfig, consumer: C) -> RosterHandle
where
    T: Transport,
    C: RosterConsumer,
{
    let (reconciler, state) = Reconciler::new(consumer);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let dispatcher = Dispatcher {
        retry: RetryCounter::new(config.retry),
        transport,
        config,
        reconciler,
        shutdown: shutdown_rx,
    };

    RosterHandle {
        state,
        shutdown: Some(shutdown_tx),
        task: tokio::spawn(dispatcher.run()),
    }
}

/// Owner's handle on a running roster session.
///
/// Dropping the handle stops the session.
pub struct RosterHandle {
    state: watch::Receiver<SessionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl RosterHandle {
    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait for the session to stop on its own.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::RetryExhausted`] once the session is
    /// permanently failed.
    pub async fn join(self) -> Result<(), SessionError> {
        let Self { task, shutdown, .. } = self;
        // Keep the shutdown sender alive; dropping it would stop the session.
        let _shutdown = shutdown;
        task.await.map_err(|e| SessionError::Task(e.to_string()))?
    }

    /// Stop the session: unsubscribe, disconnect, and silence the consumer.
    ///
    /// # Errors
    ///
    /// Returns the session's own error if it had already failed.
    pub async fn close(mut self) -> Result<(), SessionError> {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already have finished.
            let _ = shutdown.send(());
        }
        self.task
            .await
            .map_err(|e| SessionError::Task(e.to_string()))?
    }
}

enum CycleEnd {
    Shutdown,
    Failed(TransportError),
}

struct Dispatcher<T, C> {
    transport: T,
    config: RosterConfig,
    reconciler: Reconciler<C>,
    retry: RetryCounter,
    shutdown: oneshot::Receiver<()>,
}

impl<T, C> Dispatcher<T, C>
where
    T: Transport,
    C: RosterConsumer,
{
    async fn run(mut self) -> Result<(), SessionError> {
        tracing::info!(
            broker = %self.config.broker_url,
            snapshot = %self.config.destinations.snapshot,
            delta = %self.config.destinations.delta,
            authenticated = self.config.auth_token.is_some(),
            "Starting roster session"
        );

        loop {
            self.reconciler.begin_connecting();

            let error = match self.cycle().await {
                CycleEnd::Shutdown => {
                    self.stop();
                    return Ok(());
                }
                CycleEnd::Failed(error) => error,
            };

            tracing::error!(
                broker = %self.config.broker_url,
                error = ?error,
                "Error connecting to roster broker"
            );

            match self.retry.record_failure() {
                RetryDecision::Retry { attempt } => {
                    tracing::info!(
                        attempt,
                        max_retries = self.config.retry.max_retries,
                        "Retrying roster connection"
                    );

                    let delay = self.retry.delay();
                    if !delay.is_zero() {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            _ = &mut self.shutdown => {
                                self.stop();
                                return Ok(());
                            }
                        }
                    }
                }
                RetryDecision::GiveUp { failures } => {
                    tracing::error!(
                        broker = %self.config.broker_url,
                        failures,
                        "Giving up on roster broker"
                    );
                    self.reconciler.fail_permanently();
                    return Err(SessionError::RetryExhausted {
                        failures,
                        last_error: error,
                    });
                }
            }
        }
    }

    fn stop(&mut self) {
        self.reconciler.deactivate();
        tracing::info!(broker = %self.config.broker_url, "Roster session closed");
    }

    /// One connection: open, synchronize until failure or shutdown, close.
    async fn cycle(&mut self) -> CycleEnd {
        let opened = tokio::select! {
            opened = self.transport.open(
                &self.config.broker_url,
                self.config.auth_token.as_deref(),
            ) => opened,
            _ = &mut self.shutdown => return CycleEnd::Shutdown,
        };

        let (mut session, mut errors) = match opened {
            Ok(opened) => opened,
            Err(error) => return CycleEnd::Failed(error),
        };

        tracing::debug!(broker = %self.config.broker_url, "Connected to roster broker");
        self.retry.reset();
        self.reconciler.on_connected();

        let end = match self.synchronize(&mut session, &mut errors).await {
            // A channel closed first; prefer the cause the session reported.
            CycleEnd::Failed(TransportError::Closed) => {
                CycleEnd::Failed(closed_cause(&mut errors))
            }
            end => end,
        };
        session.close().await;
        end
    }

    async fn synchronize(
        &mut self,
        session: &mut T::Session,
        errors: &mut SessionErrors,
    ) -> CycleEnd {
        let destinations = self.config.destinations.clone();
        let window = self.config.snapshot_timeout.filter(|window| !window.is_zero());

        // Deltas first: anything published while the snapshot is being
        // produced lands in the buffer instead of being lost.
        let mut deltas = match session.subscribe(&destinations.delta).await {
            Ok(subscription) => subscription.messages,
            Err(error) => return CycleEnd::Failed(error),
        };
        let mut snapshot = match session.subscribe(&destinations.snapshot).await {
            Ok(subscription) => Some(subscription),
            Err(error) => return CycleEnd::Failed(error),
        };

        let deadline = tokio::time::sleep(window.unwrap_or(NO_DEADLINE));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut self.shutdown => return CycleEnd::Shutdown,

                error = errors.recv() => {
                    return CycleEnd::Failed(error.unwrap_or(TransportError::Closed));
                }

                frame = deltas.recv() => match frame {
                    Some(frame) => self.reconciler.on_delta_frame(&frame),
                    None => return CycleEnd::Failed(TransportError::Closed),
                },

                frame = next_frame(snapshot.as_mut()), if snapshot.is_some() => match frame {
                    Some(frame) => {
                        if let SnapshotOutcome::Applied { .. } = self.reconciler.on_snapshot_frame(&frame) {
                            if let Some(done) = snapshot.take() {
                                if let Err(error) = session.unsubscribe(&done.handle).await {
                                    return CycleEnd::Failed(error);
                                }
                            }
                        }
                    }
                    None => return CycleEnd::Failed(TransportError::Closed),
                },

                () = &mut deadline, if window.is_some() && snapshot.is_some() => {
                    tracing::warn!(
                        destination = %destinations.snapshot,
                        timeout = ?window,
                        buffered = self.reconciler.pending_batches(),
                        "No snapshot received in time, re-subscribing"
                    );

                    if let Some(stale) = snapshot.take() {
                        if let Err(error) = session.unsubscribe(&stale.handle).await {
                            return CycleEnd::Failed(error);
                        }
                    }
                    match session.subscribe(&destinations.snapshot).await {
                        Ok(subscription) => snapshot = Some(subscription),
                        Err(error) => return CycleEnd::Failed(error),
                    }
                    if let Some(window) = window {
                        deadline.as_mut().reset(Instant::now() + window);
                    }
                }
            }
        }
    }
}

/// The error the session reported, if any, else `Closed`.
fn closed_cause(errors: &mut SessionErrors) -> TransportError {
    errors.try_recv().unwrap_or(TransportError::Closed)
}

async fn next_frame(subscription: Option<&mut Subscription>) -> Option<Vec<u8>> {
    match subscription {
        Some(subscription) => subscription.messages.recv().await,
        None => std::future::pending().await,
    }
}
