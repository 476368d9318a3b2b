//! Correlation records: linking an issued command to its observed effect.
//!
//! A record is created on dispatch, owned by the translator while pending,
//! and finalized exactly once — by telemetry echo, by a Modbus result, or by
//! the awaiting side timing out. Awaiters observe resolution through a
//! `watch` channel, so resolution never blocks on whether anyone is waiting.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::DeviceCommand;
use crate::error::HilError;

/// Final state of a correlation record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pending,
    Success,
    Failure(HilError),
    TimedOut,
}

impl Outcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Caller-side handle to a pending record. Cloneable; every clone observes
/// the same resolution.
#[derive(Debug, Clone)]
pub struct CorrelationHandle {
    id: Uuid,
    rx: watch::Receiver<Outcome>,
}

impl CorrelationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current outcome without waiting.
    pub fn peek(&self) -> Outcome {
        self.rx.borrow().clone()
    }

    /// Wait for resolution, bounded by `timeout`. The bound is the hard
    /// end-to-end latency budget, independent of link-level timeouts; it
    /// returns `TimedOut` rather than hanging the test flow.
    pub async fn wait(&mut self, timeout: Duration) -> Outcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let current = self.rx.borrow().clone();
            if current.is_resolved() {
                return current;
            }
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Tracker dropped with the record still pending.
                        return Outcome::TimedOut;
                    }
                },
                _ = &mut deadline => return Outcome::TimedOut,
            }
        }
    }
}

struct PendingRecord {
    command: DeviceCommand,
    tx: watch::Sender<Outcome>,
}

/// Pending-record store. Records leave the maps the moment they resolve;
/// late resolutions (e.g. a telemetry echo after the verification read
/// already succeeded) are no-ops.
pub struct CorrelationTracker {
    pending: DashMap<Uuid, PendingRecord>,
    by_txn: DashMap<u64, Uuid>,
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            by_txn: DashMap::new(),
        }
    }

    /// Create a pending record for a freshly dispatched command.
    pub fn register(&self, command: DeviceCommand) -> (Uuid, CorrelationHandle) {
        let id = Uuid::new_v4();
        let (tx, rx) = watch::channel(Outcome::Pending);
        debug!(correlation = %id, kind = command.kind.as_str(), "correlation record created");
        self.pending.insert(id, PendingRecord { command, tx });
        (id, CorrelationHandle { id, rx })
    }

    /// Tie a Modbus transaction id to a record so `resolve_txn` can find it.
    pub fn bind_txn(&self, txn_id: u64, correlation: Uuid) {
        self.by_txn.insert(txn_id, correlation);
    }

    /// Finalize a record. First resolution wins; anything later is dropped.
    pub fn resolve(&self, correlation: Uuid, outcome: Outcome) {
        match self.pending.remove(&correlation) {
            Some((_, record)) => {
                debug!(
                    correlation = %correlation,
                    kind = record.command.kind.as_str(),
                    ?outcome,
                    "correlation record resolved"
                );
                // Send only fails when every handle is gone, which is fine.
                let _ = record.tx.send(outcome);
                self.by_txn.retain(|_, v| *v != correlation);
            },
            None => {
                debug!(correlation = %correlation, "late resolution ignored");
            },
        }
    }

    /// Finalize the record bound to a Modbus transaction.
    pub fn resolve_txn(&self, txn_id: u64, outcome: Outcome) {
        match self.by_txn.remove(&txn_id) {
            Some((_, correlation)) => self.resolve(correlation, outcome),
            None => warn!(txn_id, "modbus result for unknown transaction"),
        }
    }

    pub fn is_pending(&self, correlation: Uuid) -> bool {
        self.pending.contains_key(&correlation)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, DeviceCommand};

    fn command() -> DeviceCommand {
        DeviceCommand::new(CommandKind::StartPump, true.into(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn resolution_reaches_waiter() {
        let tracker = CorrelationTracker::new();
        let (id, mut handle) = tracker.register(command());

        tracker.resolve(id, Outcome::Success);

        let outcome = handle.wait(Duration::from_secs(1)).await;
        assert_eq!(outcome, Outcome::Success);
        assert!(!tracker.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_record_times_out() {
        let tracker = CorrelationTracker::new();
        let (_, mut handle) = tracker.register(command());

        let outcome = handle.wait(Duration::from_millis(200)).await;
        assert_eq!(outcome, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let tracker = CorrelationTracker::new();
        let (id, mut handle) = tracker.register(command());

        tracker.resolve(id, Outcome::Failure(HilError::timeout("no response")));
        tracker.resolve(id, Outcome::Success);

        let outcome = handle.wait(Duration::from_secs(1)).await;
        assert!(matches!(outcome, Outcome::Failure(HilError::ModbusTimeout(_))));
    }

    #[tokio::test]
    async fn txn_binding_routes_modbus_results() {
        let tracker = CorrelationTracker::new();
        let (id, mut handle) = tracker.register(command());
        tracker.bind_txn(7, id);

        tracker.resolve_txn(7, Outcome::Success);

        assert_eq!(handle.wait(Duration::from_secs(1)).await, Outcome::Success);
        // Binding is cleaned up with the record.
        tracker.resolve_txn(7, Outcome::Success);
    }

    #[tokio::test]
    async fn clones_observe_same_outcome() {
        let tracker = CorrelationTracker::new();
        let (id, handle) = tracker.register(command());
        let mut a = handle.clone();
        let mut b = handle;

        tracker.resolve(id, Outcome::Success);

        assert_eq!(a.wait(Duration::from_secs(1)).await, Outcome::Success);
        assert_eq!(b.wait(Duration::from_secs(1)).await, Outcome::Success);
    }
}
