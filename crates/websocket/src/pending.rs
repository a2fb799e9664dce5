//! Table of in-flight duplex requests keyed by correlation id.
//!
//! The submission path inserts and the reader task resolves, concurrently.
//! Each entry is a oneshot completion handle; whoever removes the entry owns
//! the right to complete it, so a caller is resolved at most once.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{CorrelationId, IaCloudError, Response};
use tokio::sync::oneshot;

pub(crate) type Outcome = Result<Response, IaCloudError>;

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<CorrelationId, oneshot::Sender<Outcome>>,
}

impl PendingTable {
    /// Registers a new request under a fresh correlation id.
    ///
    /// The returned guard removes the entry when dropped, which is how a
    /// timed-out or abandoned caller leaves the table.
    pub(crate) fn register(self: &Arc<Self>) -> (PendingGuard, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = CorrelationId::new_random();
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(tx);
                let guard = PendingGuard {
                    table: Arc::clone(self),
                    id,
                };
                return (guard, rx);
            }
        }
    }

    /// Completes the caller waiting on `id`. Returns `false` when no such
    /// request is pending (already timed out, or never ours).
    pub(crate) fn resolve(&self, id: CorrelationId, outcome: Outcome) -> bool {
        match self.entries.remove(&id) {
            Some((_, tx)) => {
                // The receiver may have gone away between removal and send;
                // the outcome has nobody left to inform.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Rejects every pending request with an error produced by `reason`.
    pub(crate) fn reject_all(&self, reason: impl Fn() -> IaCloudError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(reason())))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove(&self, id: &CorrelationId) {
        self.entries.remove(id);
    }
}

/// Owns one table entry for the lifetime of a submission.
pub(crate) struct PendingGuard {
    table: Arc<PendingTable>,
    id: CorrelationId,
}

impl PendingGuard {
    pub(crate) fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_completes_exactly_once() {
        let table = Arc::new(PendingTable::default());
        let (guard, rx) = table.register();
        let id = guard.id();

        assert!(table.resolve(id, Ok(Response::default())));
        assert!(!table.resolve(id, Ok(Response::default())));
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn dropping_the_guard_removes_the_entry() {
        let table = Arc::new(PendingTable::default());
        let (guard, _rx) = table.register();
        let id = guard.id();
        assert_eq!(table.len(), 1);

        drop(guard);
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(id, Ok(Response::default())));
    }

    #[tokio::test]
    async fn reject_all_drains_the_table() {
        let table = Arc::new(PendingTable::default());
        let (_a, rx_a) = table.register();
        let (_b, rx_b) = table.register();

        assert_eq!(table.reject_all(|| IaCloudError::lower("connection closed")), 2);
        assert!(matches!(rx_a.await.unwrap(), Err(IaCloudError::LowerProtocol { .. })));
        assert!(matches!(rx_b.await.unwrap(), Err(IaCloudError::LowerProtocol { .. })));
    }
}
