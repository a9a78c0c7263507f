//! Transaction coordinator - lifecycle façade over the savepoint transaction.
//!
//! The coordinator handles:
//! - Begin/commit/rollback through a single-use physical delegate
//! - Observer notification around begin and completion
//! - Timeout hand-off to the owning boundary tracker
//! - The rollback-only policy
//!
//! Conventional transaction managers treat "rollback only" as terminal. A
//! backend with a restart savepoint can recover a conflicted transaction, so
//! by default marking rollback-only from inside the coordinator does nothing
//! ([`RollbackOnlyPolicy::Ignore`]).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::backend::Connection;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::observer::{
    ObserverId, ObserverRegistry, TransactionObserver, TransactionOwner,
};
use crate::transaction::savepoint::{SavepointTransaction, TransactionMetadata};

/// Status of the physical transaction as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NotActive,
    Active,
    /// Active, but marked rollback-only.
    MarkedRollback,
}

impl TransactionStatus {
    /// Whether a rollback has something to act on.
    pub fn can_rollback(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::MarkedRollback)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::NotActive => write!(f, "NOT_ACTIVE"),
            TransactionStatus::Active => write!(f, "ACTIVE"),
            TransactionStatus::MarkedRollback => write!(f, "MARKED_ROLLBACK"),
        }
    }
}

/// What [`TransactionCoordinator::mark_rollback_only`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOnlyPolicy {
    /// Marking is a no-op; the savepoint makes the transaction recoverable.
    #[default]
    Ignore,
    /// Marking sets the physical rollback-only flag.
    Honor,
}

impl RollbackOnlyPolicy {
    pub fn supports_rollback_only(&self) -> bool {
        matches!(self, RollbackOnlyPolicy::Honor)
    }
}

/// Bridge between the coordinator and one physical transaction.
///
/// Valid for exactly one transaction; invalidated once it completes.
#[derive(Debug)]
struct PhysicalDelegate {
    generation: u64,
    invalid: bool,
}

/// Per-request transaction coordinator.
pub struct TransactionCoordinator<C: Connection> {
    transaction: SavepointTransaction<C>,
    delegate: Option<PhysicalDelegate>,
    generations: u64,
    observers: ObserverRegistry,
    owner: Arc<dyn TransactionOwner>,
    timeout: Option<Duration>,
    policy: RollbackOnlyPolicy,
}

impl<C: Connection> TransactionCoordinator<C> {
    /// Create a coordinator over a not-yet-begun savepoint transaction.
    pub fn new(transaction: SavepointTransaction<C>, owner: Arc<dyn TransactionOwner>) -> Self {
        Self {
            transaction,
            delegate: None,
            generations: 0,
            observers: ObserverRegistry::new(),
            owner,
            timeout: None,
            policy: RollbackOnlyPolicy::default(),
        }
    }

    /// Set the rollback-only policy.
    pub fn with_policy(mut self, policy: RollbackOnlyPolicy) -> Self {
        self.policy = policy;
        self
    }

    // ==================== Physical Delegate ====================

    /// The current delegate, materialized on first use.
    fn driver(&mut self) -> &mut PhysicalDelegate {
        if self.delegate.is_none() {
            self.generations += 1;
            trace!("materializing physical delegate #{}", self.generations);
        }
        let generation = self.generations;
        self.delegate.get_or_insert(PhysicalDelegate {
            generation,
            invalid: false,
        })
    }

    fn error_if_invalid(&mut self) -> TransactionResult<()> {
        let delegate = self.driver();
        if delegate.invalid {
            return Err(TransactionError::illegal(format!(
                "physical-transaction delegate #{} is no longer valid",
                delegate.generation
            )));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.invalid = true;
        }
    }

    /// Drop an invalidated delegate so the next use materializes a fresh one.
    ///
    /// Returns whether a delegate was released.
    pub fn release_driver(&mut self) -> bool {
        match self.delegate {
            Some(PhysicalDelegate { invalid: true, .. }) => {
                self.delegate = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a delegate exists and its transaction is active.
    pub fn is_joined(&self) -> bool {
        self.delegate.is_some() && self.transaction.is_active()
    }

    // ==================== Lifecycle ====================

    /// Begin the physical transaction and notify observers.
    pub fn begin(&mut self) -> TransactionResult<()> {
        self.error_if_invalid()?;
        self.transaction.begin()?;
        self.after_begin_callback();
        Ok(())
    }

    /// Run before-completion callbacks, commit, run after-completion callbacks.
    ///
    /// A conflict is returned untouched: the transaction is still open and
    /// rolling back to the savepoint is the retry loop's job. Any other
    /// failure gets a best-effort rollback before the original error is
    /// returned. The two paths differ on purpose: each conflict costs exactly
    /// one savepoint rollback, issued by the caller.
    pub fn commit(&mut self) -> TransactionResult<()> {
        self.error_if_invalid()?;

        let result = self
            .before_completion_callback()
            .and_then(|_| self.transaction.commit().into_result());

        match result {
            Ok(()) => {
                self.after_completion_callback(true);
                self.invalidate();
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                debug!(
                    "transaction {} lost a serialization conflict",
                    self.transaction.metadata().tx_id
                );
                Err(e)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    debug!("encountered failure rolling back failed commit: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Roll back to the savepoint if the transaction is active; otherwise no-op.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        let status = self.status();
        if status.can_rollback() {
            self.transaction.rollback()?;
            self.after_completion_callback(false);
        } else {
            trace!("rollback ignored, transaction status is {}", status);
        }
        Ok(())
    }

    /// Release the savepoint (best effort, see [`SavepointTransaction::release_savepoint`]).
    pub fn release_savepoint(&mut self) -> bool {
        self.transaction.release_savepoint()
    }

    // ==================== Status ====================

    pub fn status(&self) -> TransactionStatus {
        if !self.transaction.is_active() {
            TransactionStatus::NotActive
        } else if self.transaction.is_rollback_only() {
            TransactionStatus::MarkedRollback
        } else {
            TransactionStatus::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_active()
    }

    /// Rollback-only flag, reported as `false` while a retryable failure is
    /// being handled.
    pub fn is_rollback_only(&self) -> bool {
        self.transaction.is_rollback_only()
    }

    /// Explicitly mark the physical transaction rollback-only.
    pub fn set_rollback_only(&mut self) {
        self.transaction.set_rollback_only();
    }

    /// Coordinator-internal rollback-only mark, governed by the policy.
    pub fn mark_rollback_only(&mut self) {
        match self.policy {
            RollbackOnlyPolicy::Ignore => {
                trace!("ignoring rollback-only mark, savepoint keeps the transaction recoverable")
            }
            RollbackOnlyPolicy::Honor => self.transaction.set_rollback_only(),
        }
    }

    pub fn policy(&self) -> RollbackOnlyPolicy {
        self.policy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout handed to the owner at the next begin.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        self.transaction.metadata()
    }

    // ==================== Observers ====================

    pub fn add_observer(&self, observer: Arc<dyn TransactionObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Shared handle to the observer registry.
    pub fn observers(&self) -> ObserverRegistry {
        self.observers.clone()
    }

    // ==================== Access ====================

    pub fn transaction(&self) -> &SavepointTransaction<C> {
        &self.transaction
    }

    pub fn transaction_mut(&mut self) -> &mut SavepointTransaction<C> {
        &mut self.transaction
    }

    /// The connection, for issuing statements inside the transaction.
    pub fn connection(&mut self) -> &mut C {
        self.transaction.connection_mut()
    }

    /// Abort any open transaction and close the connection.
    pub fn close(&mut self) -> TransactionResult<()> {
        self.transaction.close()
    }

    // ==================== Callbacks ====================

    fn after_begin_callback(&self) {
        if let Some(timeout) = self.timeout.filter(|t| !t.is_zero()) {
            self.owner.set_transaction_timeout(timeout);
        }
        self.owner.start_transaction_boundary();
        self.owner.after_transaction_begin();

        for observer in self.observers.snapshot() {
            observer.after_begin();
        }
        trace!("TransactionCoordinator#after_begin_callback");
    }

    fn before_completion_callback(&mut self) -> TransactionResult<()> {
        trace!("TransactionCoordinator#before_completion_callback");
        for observer in self.observers.snapshot() {
            if let Err(e) = observer.before_completion() {
                self.mark_rollback_only();
                return Err(TransactionError::Observer(e.to_string()));
            }
        }
        Ok(())
    }

    fn after_completion_callback(&self, successful: bool) {
        trace!("TransactionCoordinator#after_completion_callback({})", successful);
        self.owner.after_transaction_completion(successful);
        for observer in self.observers.snapshot() {
            observer.after_completion(successful, false);
        }
    }
}

impl<C: Connection> fmt::Debug for TransactionCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("transaction", &self.transaction)
            .field("delegate", &self.delegate)
            .field("observers", &self.observers)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::backend::{
        BackendError, ConnectionFactory, MemoryConnection, MemoryDatabase, SavepointName,
        SqlStateClassifier,
    };
    use crate::transaction::observer::{ObserverError, TransactionBoundary};

    fn setup() -> (
        MemoryDatabase,
        Arc<TransactionBoundary>,
        TransactionCoordinator<MemoryConnection>,
    ) {
        let db = MemoryDatabase::new();
        let boundary = Arc::new(TransactionBoundary::new());
        let tx = SavepointTransaction::new(
            db.connect().unwrap(),
            SavepointName::default(),
            Arc::new(SqlStateClassifier::new()),
        );
        let coordinator = TransactionCoordinator::new(tx, boundary.clone());
        (db, boundary, coordinator)
    }

    /// Records callbacks as strings.
    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl TransactionObserver for Recorder {
        fn after_begin(&self) {
            self.events.lock().push(format!("{}:begin", self.name));
        }

        fn before_completion(&self) -> Result<(), ObserverError> {
            self.events.lock().push(format!("{}:before", self.name));
            Ok(())
        }

        fn after_completion(&self, successful: bool, _delayed: bool) {
            self.events
                .lock()
                .push(format!("{}:after({})", self.name, successful));
        }
    }

    /// Deregisters itself the first time it is notified.
    struct OneShot {
        registry: ObserverRegistry,
        id: Mutex<Option<ObserverId>>,
        calls: AtomicUsize,
    }

    impl TransactionObserver for OneShot {
        fn after_begin(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().take() {
                self.registry.remove(id);
            }
        }
    }

    struct Veto;

    impl TransactionObserver for Veto {
        fn before_completion(&self) -> Result<(), ObserverError> {
            Err(ObserverError("validation failed".into()))
        }
    }

    #[test]
    fn test_begin_commit_notifies_in_order() {
        let (db, _boundary, mut coordinator) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        coordinator.add_observer(Arc::new(Recorder { name: "a", events: events.clone() }));
        coordinator.add_observer(Arc::new(Recorder { name: "b", events: events.clone() }));

        coordinator.begin().unwrap();
        assert_eq!(coordinator.status(), TransactionStatus::Active);
        coordinator.connection().upsert("t", "k", json!(1)).unwrap();
        coordinator.commit().unwrap();

        assert_eq!(coordinator.status(), TransactionStatus::NotActive);
        assert_eq!(db.read_committed("t", "k"), Some(json!(1)));
        assert_eq!(
            *events.lock(),
            vec![
                "a:begin", "b:begin", "a:before", "b:before", "a:after(true)", "b:after(true)"
            ]
        );
    }

    #[test]
    fn test_observer_may_remove_itself_during_notification() {
        let (_db, _boundary, mut coordinator) = setup();
        let registry = coordinator.observers();
        let events = Arc::new(Mutex::new(Vec::new()));

        let one_shot = Arc::new(OneShot {
            registry: registry.clone(),
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let id = coordinator.add_observer(one_shot.clone());
        *one_shot.id.lock() = Some(id);
        coordinator.add_observer(Arc::new(Recorder { name: "tail", events: events.clone() }));

        coordinator.begin().unwrap();
        assert_eq!(one_shot.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*events.lock(), vec!["tail:begin"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_begin_after_commit_requires_fresh_delegate() {
        let (_db, _boundary, mut coordinator) = setup();
        coordinator.begin().unwrap();
        coordinator.commit().unwrap();

        let err = coordinator.begin().unwrap_err();
        assert!(matches!(err, TransactionError::IllegalLifecycle(_)));
        assert!(matches!(
            coordinator.commit(),
            Err(TransactionError::IllegalLifecycle(_))
        ));

        assert!(coordinator.release_driver());
        assert!(!coordinator.release_driver());
        coordinator.begin().unwrap();
        assert!(coordinator.is_joined());
    }

    #[test]
    fn test_conflict_is_returned_without_rollback() {
        let (db, _boundary, mut coordinator) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        coordinator.add_observer(Arc::new(Recorder { name: "o", events: events.clone() }));

        coordinator.begin().unwrap();
        db.fail_next_commit(BackendError::serialization_failure("restart transaction"));
        let err = coordinator.commit().unwrap_err();

        assert!(err.is_retryable());
        assert!(coordinator.is_active());
        assert_eq!(db.stats().savepoint_rollbacks, 0);
        assert!(!events.lock().iter().any(|e| e.starts_with("o:after")));

        // the retry loop rolls back and the next commit goes through
        coordinator.rollback().unwrap();
        coordinator.commit().unwrap();
        assert_eq!(db.stats().savepoint_rollbacks, 1);
    }

    #[test]
    fn test_fatal_commit_rolls_back_and_keeps_original_error() {
        let (db, _boundary, mut coordinator) = setup();
        coordinator.begin().unwrap();
        db.fail_next_commit(BackendError::database("08006", "connection reset"));

        let err = coordinator.commit().unwrap_err();
        assert_eq!(err.category(), Some(crate::backend::ErrorCategory::ConnectionLost));
        assert_eq!(db.stats().savepoint_rollbacks, 1);
    }

    #[test]
    fn test_observer_veto_aborts_commit() {
        let (db, _boundary, mut coordinator) = setup();
        coordinator.add_observer(Arc::new(Veto));
        coordinator.begin().unwrap();
        coordinator.connection().upsert("t", "k", json!(1)).unwrap();

        let err = coordinator.commit().unwrap_err();
        assert!(matches!(err, TransactionError::Observer(_)));
        // ignore policy: the veto did not doom the transaction
        assert!(!coordinator.is_rollback_only());
        assert_eq!(db.read_committed("t", "k"), None);
    }

    #[test]
    fn test_mark_rollback_only_policy() {
        let (_db, _boundary, mut coordinator) = setup();
        coordinator.begin().unwrap();
        assert!(!coordinator.policy().supports_rollback_only());
        coordinator.mark_rollback_only();
        assert!(!coordinator.is_rollback_only());

        let (_db, _boundary, coordinator) = setup();
        let mut coordinator = coordinator.with_policy(RollbackOnlyPolicy::Honor);
        coordinator.begin().unwrap();
        coordinator.mark_rollback_only();
        assert!(coordinator.is_rollback_only());
        assert_eq!(coordinator.status(), TransactionStatus::MarkedRollback);
    }

    #[test]
    fn test_set_rollback_only_suppressed_after_conflict() {
        let (db, _boundary, mut coordinator) = setup();
        coordinator.begin().unwrap();
        db.fail_next_commit(BackendError::serialization_failure("restart transaction"));
        assert!(coordinator.commit().is_err());

        coordinator.set_rollback_only();
        assert!(coordinator.transaction().connection().is_rollback_only());
        assert!(!coordinator.is_rollback_only());
        assert_eq!(coordinator.status(), TransactionStatus::Active);
    }

    #[test]
    fn test_rollback_when_not_active_is_noop() {
        let (db, _boundary, mut coordinator) = setup();
        coordinator.rollback().unwrap();
        assert_eq!(db.stats().savepoint_rollbacks, 0);
    }

    #[test]
    fn test_timeout_propagated_only_when_positive() {
        let (_db, boundary, mut coordinator) = setup();
        coordinator.set_timeout(Some(Duration::ZERO));
        coordinator.begin().unwrap();
        assert_eq!(boundary.timeout(), None);
        assert!(boundary.in_boundary());

        let (_db, boundary, mut coordinator) = setup();
        coordinator.set_timeout(Some(Duration::from_secs(30)));
        coordinator.begin().unwrap();
        assert_eq!(boundary.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(coordinator.timeout(), Some(Duration::from_secs(30)));
    }
}
