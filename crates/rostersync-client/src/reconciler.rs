//! Snapshot/delta reconciliation state machine.
//!
//! The reconciler is synchronous and owns the pending delta buffer. The
//! session dispatcher feeds it raw frames one at a time, so state and buffer
//! are only ever touched by a single writer.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─opened─▶ AwaitingSnapshot ─snapshot─▶ Synced
//!                             ▲                        │                     │
//!                             └──────── transport error (retry) ─────────────┘
//!                   any state ── retries exhausted ──▶ PermanentlyFailed
//! ```

use crate::consumer::RosterConsumer;
use rostersync_proto::messages::{parse_delta, parse_snapshot};
use rostersync_proto::DeltaEntry;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Lifecycle of a roster session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or closed by the owner
    Disconnected,
    /// Opening a broker connection
    Connecting,
    /// Subscribed; buffering deltas until the snapshot arrives
    AwaitingSnapshot,
    /// Snapshot applied; deltas flow straight through
    Synced,
    /// Retries exhausted; terminal
    PermanentlyFailed,
}

impl SessionState {
    /// Whether the session can never make progress again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PermanentlyFailed)
    }
}

/// Result of feeding a snapshot frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot delivered and buffered batches flushed
    Applied {
        /// Entries in the snapshot
        entries: usize,
        /// Buffered batches flushed after it
        flushed: usize,
    },
    /// Frame could not be parsed; still awaiting a snapshot
    Rejected,
    /// Not awaiting a snapshot; frame dropped
    Ignored,
}

/// Roster reconciliation state machine.
pub struct Reconciler<C> {
    consumer: C,
    state: SessionState,
    pending: VecDeque<Vec<DeltaEntry>>,
    active: bool,
    state_tx: watch::Sender<SessionState>,
}

impl<C: RosterConsumer> Reconciler<C> {
    /// Create a reconciler in `Disconnected` and a receiver for its state.
    pub fn new(consumer: C) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let reconciler = Self {
            consumer,
            state: SessionState::Disconnected,
            pending: VecDeque::new(),
            active: true,
            state_tx,
        };
        (reconciler, state_rx)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Batches buffered while awaiting the snapshot.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// Whether frames are still acted on.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// A connection attempt is starting. Anything buffered belongs to a dead
    /// connection and is discarded.
    pub fn begin_connecting(&mut self) {
        if !self.active {
            return;
        }
        self.pending.clear();
        self.set_state(SessionState::Connecting);
    }

    /// The broker accepted a connection; a new cycle starts from empty.
    pub fn on_connected(&mut self) {
        if !self.active {
            return;
        }
        self.pending.clear();
        self.set_state(SessionState::AwaitingSnapshot);
        self.consumer.on_connected();
    }

    /// Feed one frame from the delta subscription.
    pub fn on_delta_frame(&mut self, frame: &[u8]) {
        if !self.active {
            return;
        }

        let batch = match parse_delta(frame) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(frame),
                    "Dropping malformed delta frame"
                );
                return;
            }
        };

        match self.state {
            SessionState::AwaitingSnapshot => {
                tracing::debug!(
                    entries = batch.len(),
                    pending = self.pending.len() + 1,
                    "Buffering delta until snapshot arrives"
                );
                self.pending.push_back(batch);
            }
            SessionState::Synced => {
                tracing::debug!(entries = batch.len(), "Forwarding delta");
                self.consumer.on_delta(batch);
            }
            state => {
                tracing::debug!(?state, "Ignoring delta outside a sync cycle");
            }
        }
    }

    /// Feed one frame from the snapshot subscription.
    ///
    /// On the first valid snapshot of a cycle the consumer gets the roster,
    /// then every buffered batch in arrival order, before this returns.
    pub fn on_snapshot_frame(&mut self, frame: &[u8]) -> SnapshotOutcome {
        if !self.active || self.state != SessionState::AwaitingSnapshot {
            tracing::debug!(state = ?self.state, "Ignoring snapshot outside AwaitingSnapshot");
            return SnapshotOutcome::Ignored;
        }

        let roster = match parse_snapshot(frame) {
            Ok(roster) => roster,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(frame),
                    "Dropping malformed snapshot frame"
                );
                return SnapshotOutcome::Rejected;
            }
        };

        let entries = roster.len();
        tracing::debug!(entries, "Received initial roster");

        self.consumer.on_initial(roster);
        self.set_state(SessionState::Synced);

        let flushed = self.pending.len();
        for batch in self.pending.drain(..) {
            self.consumer.on_delta(batch);
        }

        if flushed > 0 {
            tracing::debug!(flushed, "Flushed buffered deltas");
        }

        SnapshotOutcome::Applied { entries, flushed }
    }

    /// Retries are exhausted. Terminal.
    pub fn fail_permanently(&mut self) {
        self.pending.clear();
        self.set_state(SessionState::PermanentlyFailed);
        self.active = false;
    }

    /// The owner closed the session; no callback fires after this.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.pending.clear();
        self.set_state(SessionState::Disconnected);
        self.active = false;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "Session state change");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::RosterUpdate;
    use rostersync_proto::messages::{encode_delta, encode_snapshot};
    use rostersync_proto::RosterEntry;
    use tokio::sync::mpsc;

    type Updates = mpsc::UnboundedReceiver<RosterUpdate>;

    fn reconciler() -> (
        Reconciler<mpsc::UnboundedSender<RosterUpdate>>,
        Updates,
        watch::Receiver<SessionState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reconciler, state) = Reconciler::new(tx);
        (reconciler, rx, state)
    }

    fn drain(updates: &mut Updates) -> Vec<RosterUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = updates.try_recv() {
            out.push(update);
        }
        out
    }

    fn delta_batch(id: &str) -> Vec<DeltaEntry> {
        vec![DeltaEntry::new(id, "v", "add")]
    }

    fn delta_frame(id: &str) -> Vec<u8> {
        encode_delta(&delta_batch(id)).unwrap()
    }

    fn snapshot_frame(ids: &[&str]) -> Vec<u8> {
        let entries: Vec<RosterEntry> = ids.iter().map(|id| RosterEntry::new(*id, "v")).collect();
        encode_snapshot(&entries).unwrap()
    }

    #[test]
    fn delta_before_snapshot_is_delivered_after_initial() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.begin_connecting();
        reconciler.on_connected();

        reconciler.on_delta_frame(br#"[{"n":"u1","r":"v","s":"add"}]"#);
        assert_eq!(reconciler.pending_batches(), 1);

        let outcome = reconciler.on_snapshot_frame(br#"[{"n":"u0","r":"v"}]"#);

        assert_eq!(
            outcome,
            SnapshotOutcome::Applied {
                entries: 1,
                flushed: 1
            }
        );
        assert_eq!(
            drain(&mut updates),
            vec![
                RosterUpdate::Connected,
                RosterUpdate::Initial(vec![RosterEntry::new("u0", "v")]),
                RosterUpdate::Delta(vec![DeltaEntry::new("u1", "v", "add")]),
            ]
        );
        assert_eq!(reconciler.pending_batches(), 0);
    }

    #[test]
    fn every_interleaving_delivers_each_batch_once_in_order() {
        const BATCHES: usize = 5;

        for snapshot_at in 0..=BATCHES {
            let (mut reconciler, mut updates, _) = reconciler();
            reconciler.on_connected();

            for i in 0..BATCHES {
                if i == snapshot_at {
                    reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));
                }
                reconciler.on_delta_frame(&delta_frame(&format!("d{i}")));
            }
            if snapshot_at == BATCHES {
                reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));
            }

            let updates = drain(&mut updates);
            assert_eq!(updates[0], RosterUpdate::Connected);
            assert!(matches!(updates[1], RosterUpdate::Initial(_)));

            let deltas: Vec<Vec<DeltaEntry>> = updates[2..]
                .iter()
                .map(|update| match update {
                    RosterUpdate::Delta(batch) => batch.clone(),
                    other => panic!("unexpected update {other:?}"),
                })
                .collect();
            let expected: Vec<Vec<DeltaEntry>> =
                (0..BATCHES).map(|i| delta_batch(&format!("d{i}"))).collect();

            assert_eq!(deltas, expected, "snapshot at position {snapshot_at}");
        }
    }

    #[test]
    fn buffered_batches_are_flushed_individually() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();

        reconciler.on_delta_frame(&delta_frame("a"));
        reconciler.on_delta_frame(&delta_frame("b"));
        reconciler.on_snapshot_frame(&snapshot_frame(&[]));

        let updates = drain(&mut updates);
        assert_eq!(
            &updates[1..],
            &[
                RosterUpdate::Initial(vec![]),
                RosterUpdate::Delta(delta_batch("a")),
                RosterUpdate::Delta(delta_batch("b")),
            ]
        );
    }

    #[test]
    fn second_snapshot_is_ignored() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();

        reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));
        let outcome = reconciler.on_snapshot_frame(&snapshot_frame(&["u0", "u1"]));

        assert_eq!(outcome, SnapshotOutcome::Ignored);
        let initials = drain(&mut updates)
            .into_iter()
            .filter(|update| matches!(update, RosterUpdate::Initial(_)))
            .count();
        assert_eq!(initials, 1);
    }

    #[test]
    fn malformed_delta_is_dropped_and_stream_continues() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();
        reconciler.on_snapshot_frame(&snapshot_frame(&[]));
        drain(&mut updates);

        reconciler.on_delta_frame(b"{not json");
        reconciler.on_delta_frame(&delta_frame("u2"));

        assert_eq!(
            drain(&mut updates),
            vec![RosterUpdate::Delta(delta_batch("u2"))]
        );
    }

    #[test]
    fn malformed_snapshot_keeps_waiting_and_buffering() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();

        reconciler.on_delta_frame(&delta_frame("u1"));
        assert_eq!(
            reconciler.on_snapshot_frame(b"[{\"n\":"),
            SnapshotOutcome::Rejected
        );
        assert_eq!(reconciler.state(), SessionState::AwaitingSnapshot);
        reconciler.on_delta_frame(&delta_frame("u2"));

        reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));

        assert_eq!(
            &drain(&mut updates)[2..],
            &[
                RosterUpdate::Delta(delta_batch("u1")),
                RosterUpdate::Delta(delta_batch("u2")),
            ]
        );
    }

    #[test]
    fn reconnect_discards_old_buffer() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();
        reconciler.on_delta_frame(&delta_frame("stale"));

        reconciler.begin_connecting();
        assert_eq!(reconciler.pending_batches(), 0);
        reconciler.on_connected();
        reconciler.on_delta_frame(&delta_frame("fresh"));
        reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));

        let deltas: Vec<RosterUpdate> = drain(&mut updates)
            .into_iter()
            .filter(|update| matches!(update, RosterUpdate::Delta(_)))
            .collect();
        assert_eq!(deltas, vec![RosterUpdate::Delta(delta_batch("fresh"))]);
    }

    #[test]
    fn synced_cycle_restarts_after_reconnect() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();
        reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));
        assert_eq!(reconciler.state(), SessionState::Synced);

        reconciler.begin_connecting();
        reconciler.on_connected();
        assert_eq!(reconciler.state(), SessionState::AwaitingSnapshot);

        reconciler.on_delta_frame(&delta_frame("u1"));
        assert_eq!(reconciler.pending_batches(), 1);
        reconciler.on_snapshot_frame(&snapshot_frame(&["u0", "u1"]));

        let initials = drain(&mut updates)
            .into_iter()
            .filter(|update| matches!(update, RosterUpdate::Initial(_)))
            .count();
        assert_eq!(initials, 2);
    }

    #[test]
    fn deactivated_reconciler_stays_silent() {
        let (mut reconciler, mut updates, _) = reconciler();
        reconciler.on_connected();
        reconciler.deactivate();

        reconciler.on_delta_frame(&delta_frame("late"));
        let outcome = reconciler.on_snapshot_frame(&snapshot_frame(&["u0"]));
        reconciler.on_connected();

        assert_eq!(outcome, SnapshotOutcome::Ignored);
        assert_eq!(drain(&mut updates), vec![RosterUpdate::Connected]);
        assert_eq!(reconciler.state(), SessionState::Disconnected);
    }

    #[test]
    fn permanent_failure_is_terminal_and_published() {
        let (mut reconciler, _updates, state) = reconciler();
        reconciler.begin_connecting();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        reconciler.fail_permanently();
        reconciler.begin_connecting();

        assert_eq!(reconciler.state(), SessionState::PermanentlyFailed);
        assert!(state.borrow().is_terminal());
        assert!(!reconciler.is_active());
    }
}
