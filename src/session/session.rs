//! Per-request session.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::backend::Connection;
use crate::session::error::{SessionError, SessionResult};
use crate::session::resource::SessionResource;
use crate::transaction::{TransactionBoundary, TransactionCoordinator};

/// Container for everything one request owns: the transaction coordinator,
/// its boundary tracker, and secondary resources.
///
/// Sessions are shared as `Arc<Session<_>>` so that an asynchronous request
/// can hand the session to its completion listener. Every access to the
/// coordinator goes through a mutex, and [`close`](Session::close) runs at
/// most once no matter how many threads call it.
pub struct Session<C: Connection> {
    id: String,
    created_at: DateTime<Utc>,
    transaction: Mutex<TransactionCoordinator<C>>,
    boundary: Arc<TransactionBoundary>,
    resources: Mutex<Vec<Box<dyn SessionResource>>>,
    closed: AtomicBool,
    open_sessions: Arc<AtomicUsize>,
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(
        id: String,
        coordinator: TransactionCoordinator<C>,
        boundary: Arc<TransactionBoundary>,
        open_sessions: Arc<AtomicUsize>,
    ) -> Self {
        open_sessions.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            created_at: Utc::now(),
            transaction: Mutex::new(coordinator),
            boundary,
            resources: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            open_sessions,
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Boundary tracker the coordinator reports to.
    pub fn boundary(&self) -> &TransactionBoundary {
        &self.boundary
    }

    /// Lock the transaction coordinator.
    pub fn transaction(&self) -> MutexGuard<'_, TransactionCoordinator<C>> {
        self.transaction.lock()
    }

    /// Begin the request transaction and return the locked coordinator.
    ///
    /// A delegate left invalid by an earlier commit in this session is
    /// released first, so a session can run consecutive transactions.
    pub fn begin_request_transaction(
        &self,
    ) -> SessionResult<MutexGuard<'_, TransactionCoordinator<C>>> {
        self.ensure_open()?;
        let mut coordinator = self.transaction.lock();
        coordinator.release_driver();
        coordinator.begin()?;
        Ok(coordinator)
    }

    /// Hand a resource to the session; it is closed when the session closes.
    pub fn enlist(&self, resource: Box<dyn SessionResource>) -> SessionResult<()> {
        self.ensure_open()?;
        self.resources.lock().push(resource);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session.
    ///
    /// Rolls back a transaction that is still active, closes the connection
    /// (aborting the physical transaction, never committing it) and then
    /// every enlisted resource in reverse order. Failures are logged. Returns
    /// `true` for the call that
    /// actually closed the session and `false` for every later one.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!("session {} already closed", self.id);
            return false;
        }

        {
            let mut coordinator = self.transaction.lock();
            if coordinator.is_active() {
                debug!(
                    "session {} closing with active transaction {}, rolling back",
                    self.id,
                    coordinator.metadata().tx_id
                );
                if let Err(e) = coordinator.rollback() {
                    warn!("failed to roll back transaction of session {}: {}", self.id, e);
                }
            }
            if let Err(e) = coordinator.close() {
                debug!("failed to close connection of session {}: {}", self.id, e);
            }
        }

        let mut resources = std::mem::take(&mut *self.resources.lock());
        while let Some(mut resource) = resources.pop() {
            if let Err(e) = resource.close() {
                debug!("session {}: {}", self.id, e);
            }
        }

        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "closed session {} after {}ms",
            self.id,
            (Utc::now() - self.created_at).num_milliseconds()
        );
        true
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(())
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("session {} dropped without being closed", self.id);
            self.close();
        }
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
