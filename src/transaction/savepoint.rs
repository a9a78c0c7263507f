//! Savepoint-backed physical transaction.
//!
//! One physical transaction per request. A named savepoint is set right after
//! `BEGIN`, so a lost serializable conflict can be recovered by rolling back
//! to the savepoint instead of reconnecting and beginning again.
//!
//! ```text
//!   begin()     BEGIN; SAVEPOINT sp;
//!   commit()    flush; RELEASE SAVEPOINT sp; COMMIT;      -> CommitOutcome
//!   rollback()  flush; ROLLBACK TO SAVEPOINT sp; clear    (stays open)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use ulid::Ulid;

use crate::backend::{BackendError, Connection, FailureClass, FailureClassifier, SavepointName};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::outcome::CommitOutcome;

/// Transaction metadata, for logging and inspection.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction ID, regenerated on every begin.
    pub tx_id: String,
    /// When the physical transaction was begun.
    pub started_at: DateTime<Utc>,
    /// Rollbacks to the savepoint since begin.
    pub restarts: u32,
}

impl TransactionMetadata {
    fn fresh() -> Self {
        Self {
            tx_id: Ulid::new().to_string().to_lowercase(),
            started_at: Utc::now(),
            restarts: 0,
        }
    }
}

/// A physical transaction with a restart savepoint.
pub struct SavepointTransaction<C: Connection> {
    connection: C,
    savepoint: SavepointName,
    classifier: Arc<dyn FailureClassifier>,
    has_savepoint: bool,
    /// Set once a retryable failure was observed; rollback-only reads are
    /// reported as `false` until the next successful begin.
    suppress_doomed_state: bool,
    metadata: TransactionMetadata,
}

impl<C: Connection> SavepointTransaction<C> {
    /// Wrap a connection. Nothing is sent until [`begin`](Self::begin).
    pub fn new(
        connection: C,
        savepoint: SavepointName,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Self {
        Self {
            connection,
            savepoint,
            classifier,
            has_savepoint: false,
            suppress_doomed_state: false,
            metadata: TransactionMetadata::fresh(),
        }
    }

    /// Open the physical transaction and set the savepoint.
    ///
    /// If the savepoint cannot be created the physical transaction is rolled
    /// back again, so no transaction is ever left open without one.
    pub fn begin(&mut self) -> TransactionResult<()> {
        self.connection.begin().map_err(|e| self.fatal(e))?;

        if let Err(e) = self.connection.execute_native(&self.savepoint.create_sql()) {
            if let Err(abort) = self.connection.rollback() {
                debug!("failed to abort transaction after savepoint failure: {}", abort);
            }
            return Err(self.fatal(e));
        }

        self.has_savepoint = true;
        self.suppress_doomed_state = false;
        self.metadata = TransactionMetadata::fresh();
        trace!(
            "began transaction {} on connection {} with savepoint {}",
            self.metadata.tx_id,
            self.connection.id(),
            self.savepoint
        );
        Ok(())
    }

    /// Flush, then release the savepoint and commit in one native call.
    pub fn commit(&mut self) -> CommitOutcome {
        trace!("committing transaction {}", self.metadata.tx_id);
        let release = self.savepoint.release_and_commit_sql();
        let result = self
            .connection
            .flush()
            .and_then(|_| self.connection.execute_native(&release));

        match result {
            Ok(_) => {
                self.has_savepoint = false;
                CommitOutcome::Committed
            }
            Err(e) => {
                let outcome = CommitOutcome::from_failure(self.classifier.as_ref(), e);
                if outcome.is_retryable() {
                    self.suppress_doomed_state = true;
                }
                outcome
            }
        }
    }

    /// Roll back to the savepoint and drop cached entity state.
    ///
    /// The physical transaction stays open for the next attempt.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        trace!("rolling back transaction {} to {}", self.metadata.tx_id, self.savepoint);
        if let Err(e) = self.connection.flush() {
            debug!("flush before rollback failed, rolling back anyway: {}", e);
        }
        self.connection
            .execute_native(&self.savepoint.rollback_to_sql())
            .map_err(|e| self.fatal(e))?;
        self.connection.clear();
        self.metadata.restarts += 1;
        Ok(())
    }

    /// Release the savepoint and commit, if one is set.
    ///
    /// Runs during cleanup: failures are logged and swallowed. Returns whether
    /// the release statement was issued successfully.
    pub fn release_savepoint(&mut self) -> bool {
        if !self.has_savepoint {
            return false;
        }

        trace!("releasing savepoint {}", self.savepoint);
        match self
            .connection
            .execute_native(&self.savepoint.release_and_commit_sql())
        {
            Ok(_) => {
                self.has_savepoint = false;
                true
            }
            Err(e) => {
                debug!("error swallowed during savepoint release: {}", e);
                false
            }
        }
    }

    /// Whether the transaction can only roll back.
    ///
    /// Always `false` once a retryable failure has been seen, since the
    /// savepoint makes the transaction recoverable.
    pub fn is_rollback_only(&self) -> bool {
        if self.suppress_doomed_state {
            return false;
        }
        self.connection.is_rollback_only()
    }

    /// Mark the physical transaction rollback-only.
    pub fn set_rollback_only(&mut self) {
        self.connection.set_rollback_only();
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    pub fn has_savepoint(&self) -> bool {
        self.has_savepoint
    }

    pub fn is_suppressing_rollback_only(&self) -> bool {
        self.suppress_doomed_state
    }

    pub fn savepoint(&self) -> &SavepointName {
        &self.savepoint
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    /// The underlying connection, for issuing statements.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Abort whatever is still open and close the connection. Never commits.
    pub fn close(&mut self) -> TransactionResult<()> {
        if self.connection.is_active() {
            trace!("aborting transaction {} on close", self.metadata.tx_id);
            if let Err(e) = self.connection.rollback() {
                debug!("abort on close failed, closing connection anyway: {}", e);
            }
        }
        self.has_savepoint = false;
        self.connection.close().map_err(TransactionError::fatal)
    }

    fn fatal(&self, error: BackendError) -> TransactionError {
        match self.classifier.classify(&error) {
            FailureClass::Fatal(category) => TransactionError::Fatal {
                category,
                source: error,
            },
            // Conflicts outside commit are not retried at this layer.
            FailureClass::RetryableConflict => TransactionError::fatal(error),
        }
    }
}

impl<C: Connection> std::fmt::Debug for SavepointTransaction<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavepointTransaction")
            .field("tx_id", &self.metadata.tx_id)
            .field("savepoint", &self.savepoint)
            .field("active", &self.is_active())
            .field("has_savepoint", &self.has_savepoint)
            .field("suppress_doomed_state", &self.suppress_doomed_state)
            .finish()
    }
}
