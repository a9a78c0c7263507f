//! Session factory - one session per request.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::backend::{ConnectionFactory, FailureClassifier, SavepointName, SqlStateClassifier};
use crate::session::error::SessionResult;
use crate::session::session::Session;
use crate::transaction::{
    RollbackOnlyPolicy, SavepointTransaction, TransactionBoundary, TransactionCoordinator,
};

/// Creates sessions, each with its own connection and coordinator.
///
/// Thread-safe: one factory serves every request of the process.
pub struct SessionFactory<F: ConnectionFactory> {
    connections: F,
    classifier: Arc<dyn FailureClassifier>,
    savepoint: SavepointName,
    policy: RollbackOnlyPolicy,
    timeout: Option<Duration>,
    created: AtomicU64,
    open: Arc<AtomicUsize>,
}

impl<F: ConnectionFactory> SessionFactory<F> {
    /// Create a factory with the SQLSTATE classifier and default savepoint.
    pub fn new(connections: F) -> Self {
        Self {
            connections,
            classifier: Arc::new(SqlStateClassifier::new()),
            savepoint: SavepointName::default(),
            policy: RollbackOnlyPolicy::default(),
            timeout: None,
            created: AtomicU64::new(0),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_savepoint(mut self, savepoint: SavepointName) -> Self {
        self.savepoint = savepoint;
        self
    }

    pub fn with_policy(mut self, policy: RollbackOnlyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Transaction timeout handed to each session's boundary tracker.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a connection and build a session around it.
    ///
    /// The transaction is not begun yet.
    pub fn create(&self) -> SessionResult<Arc<Session<F::Connection>>> {
        let connection = self.connections.connect()?;
        let boundary = Arc::new(TransactionBoundary::new());
        let transaction =
            SavepointTransaction::new(connection, self.savepoint.clone(), self.classifier.clone());
        let mut coordinator =
            TransactionCoordinator::new(transaction, boundary.clone()).with_policy(self.policy);
        coordinator.set_timeout(self.timeout);

        self.created.fetch_add(1, Ordering::SeqCst);
        let id = Ulid::new().to_string().to_lowercase();
        Ok(Arc::new(Session::new(id, coordinator, boundary, self.open.clone())))
    }

    /// The underlying connection factory.
    pub fn connections(&self) -> &F {
        &self.connections
    }

    /// Sessions created so far.
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Sessions created but not yet closed.
    pub fn sessions_open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for SessionFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("savepoint", &self.savepoint)
            .field("policy", &self.policy)
            .field("sessions_created", &self.sessions_created())
            .field("sessions_open", &self.sessions_open())
            .finish()
    }
}
