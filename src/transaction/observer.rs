//! Transaction lifecycle observers and the boundary tracker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Error raised by an observer to veto completion.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

/// Callbacks fired around the transaction lifecycle.
///
/// All methods default to no-ops.
pub trait TransactionObserver: Send + Sync {
    /// The physical transaction was begun.
    fn after_begin(&self) {}

    /// The transaction is about to commit. Returning an error aborts the commit.
    fn before_completion(&self) -> Result<(), ObserverError> {
        Ok(())
    }

    /// The transaction committed (`successful`) or rolled back.
    fn after_completion(&self, _successful: bool, _delayed: bool) {}
}

/// Handle returned when registering an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn TransactionObserver>)>,
}

/// Ordered set of observers.
///
/// Clones share the same registry, so an observer can hold a handle and
/// deregister itself from inside a callback. Notification always works on a
/// snapshot taken before the first callback runs.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; notification follows registration order.
    pub fn add(&self, observer: Arc<dyn TransactionObserver>) -> ObserverId {
        let mut inner = self.inner.lock();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, observer));
        id
    }

    /// Deregister an observer. Returns whether it was registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry, _)| *entry != id);
        inner.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observers registered right now, in order.
    pub fn snapshot(&self) -> Vec<Arc<dyn TransactionObserver>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// The component that owns the coordinator and tracks transaction boundaries.
///
/// Timeout expiry is this component's business; the coordinator only hands
/// the configured timeout over at begin.
pub trait TransactionOwner: Send + Sync {
    fn set_transaction_timeout(&self, _timeout: Duration) {}
    fn start_transaction_boundary(&self) {}
    fn after_transaction_begin(&self) {}
    fn after_transaction_completion(&self, _successful: bool) {}
}

/// Boundary tracker used by sessions.
///
/// Records whether the owner is inside a transaction boundary and when the
/// propagated timeout, if any, runs out.
#[derive(Debug, Default)]
pub struct TransactionBoundary {
    in_boundary: AtomicBool,
    begun: AtomicU64,
    completed: AtomicU64,
    timeout: Mutex<Option<Duration>>,
    deadline: Mutex<Option<Instant>>,
}

impl TransactionBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_boundary(&self) -> bool {
        self.in_boundary.load(Ordering::SeqCst)
    }

    /// Number of boundaries started.
    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::SeqCst)
    }

    /// Number of completions reported.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// The timeout propagated by the coordinator, if any.
    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Whether the current boundary has outlived its timeout.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl TransactionOwner for TransactionBoundary {
    fn set_transaction_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout);
    }

    fn start_transaction_boundary(&self) {
        self.in_boundary.store(true, Ordering::SeqCst);
        self.begun.fetch_add(1, Ordering::SeqCst);
        *self.deadline.lock() = self.timeout().map(|t| Instant::now() + t);
    }

    fn after_transaction_completion(&self, _successful: bool) {
        self.in_boundary.store(false, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        *self.deadline.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl TransactionObserver for Noop {}

    #[test]
    fn test_registry_order_and_removal() {
        let registry = ObserverRegistry::new();
        let a = registry.add(Arc::new(Noop));
        let b = registry.add(Arc::new(Noop));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_removal() {
        let registry = ObserverRegistry::new();
        let id = registry.add(Arc::new(Noop));
        let snapshot = registry.snapshot();
        registry.remove(id);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_boundary_tracks_timeout() {
        let boundary = TransactionBoundary::new();
        assert!(!boundary.is_expired());

        boundary.set_transaction_timeout(Duration::ZERO);
        boundary.start_transaction_boundary();
        assert!(boundary.in_boundary());
        assert!(boundary.is_expired());

        boundary.after_transaction_completion(true);
        assert!(!boundary.in_boundary());
        assert!(!boundary.is_expired());
        assert_eq!((boundary.begun(), boundary.completed()), (1, 1));
    }
}
