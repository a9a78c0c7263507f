//! In-memory serializable backend.
//!
//! A small SQL-ish store with the concurrency behavior of a serializable,
//! optimistic database: reads are recorded with the row version they saw, and
//! the transaction is validated when it commits. A stale read fails the commit
//! with SQLSTATE `40001`, and the transaction stays open so the client can
//! `ROLLBACK TO SAVEPOINT` and try again.
//!
//! Releasing the outermost savepoint commits the transaction, the same way a
//! restart-savepoint backend treats `RELEASE SAVEPOINT cockroach_restart`.
//!
//! # Usage
//!
//! ```ignore
//! use reqtx::backend::{Connection, ConnectionFactory, MemoryDatabase};
//! use serde_json::json;
//!
//! let db = MemoryDatabase::new();
//! let mut conn = db.connect()?;
//! conn.begin()?;
//! conn.execute_native("SAVEPOINT cockroach_restart;")?;
//! conn.upsert("users", "alice", json!({"name": "Alice"}))?;
//! conn.execute_native("RELEASE SAVEPOINT cockroach_restart; COMMIT;")?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::backend::connection::{Connection, ConnectionFactory};
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::types::SqlState;

type RowRef = (String, String);

#[derive(Debug, Clone)]
struct VersionedRow {
    value: Value,
    version: u64,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Insert(Value),
    Upsert(Value),
    Delete,
}

/// Reads and flushed writes of one transaction.
///
/// A read version of 0 means the row did not exist when it was read.
#[derive(Debug, Clone, Default)]
struct TxState {
    reads: HashMap<RowRef, u64>,
    writes: BTreeMap<RowRef, WriteOp>,
}

#[derive(Debug)]
struct PhysicalTx {
    state: TxState,
    savepoints: Vec<(String, TxState)>,
    rollback_only: bool,
}

impl PhysicalTx {
    fn new() -> Self {
        Self {
            state: TxState::default(),
            savepoints: Vec::new(),
            rollback_only: false,
        }
    }

    fn savepoint_index(&self, name: &str) -> BackendResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(sp, _)| sp.eq_ignore_ascii_case(name))
            .ok_or_else(|| BackendError::UnknownSavepoint(name.to_string()))
    }
}

/// Counters describing what the database has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// transactions committed
    pub commits: u64,
    /// commits rejected with a serialization failure
    pub conflicts: u64,
    /// `ROLLBACK TO SAVEPOINT` statements executed
    pub savepoint_rollbacks: u64,
    /// commits rejected for any other reason
    pub failed_commits: u64,
    /// connections opened over the lifetime of the database
    pub connections_opened: u64,
    /// connections currently open
    pub open_connections: u64,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    conflicts: AtomicU64,
    savepoint_rollbacks: AtomicU64,
    failed_commits: AtomicU64,
    connections_opened: AtomicU64,
    open_connections: AtomicU64,
}

struct MemoryDatabaseInner {
    tables: RwLock<HashMap<String, BTreeMap<String, VersionedRow>>>,
    /// Serializes validation and apply of commits.
    commit_lock: Mutex<()>,
    next_version: AtomicU64,
    next_connection: AtomicUsize,
    injected: Mutex<VecDeque<BackendError>>,
    counters: Counters,
}

/// Shared in-memory database. Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryDatabaseInner>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryDatabaseInner {
                tables: RwLock::new(HashMap::new()),
                commit_lock: Mutex::new(()),
                next_version: AtomicU64::new(1),
                next_connection: AtomicUsize::new(1),
                injected: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Make the next commit fail with the given error.
    ///
    /// Injected failures are consumed in order, one per commit attempt.
    pub fn fail_next_commit(&self, error: BackendError) {
        self.inner.injected.lock().push_back(error);
    }

    /// Write a row outside of any connection, as a concurrent committed
    /// transaction would. Bumps the row version.
    pub fn write_committed(&self, table: &str, key: &str, value: Value) {
        let _guard = self.inner.commit_lock.lock();
        let version = self.inner.next_version.fetch_add(1, Ordering::SeqCst);
        self.inner
            .tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), VersionedRow { value, version });
    }

    /// Read the latest committed value of a row.
    pub fn read_committed(&self, table: &str, key: &str) -> Option<Value> {
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.value.clone())
    }

    /// Number of committed rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    /// Snapshot of the database counters.
    pub fn stats(&self) -> MemoryStats {
        let c = &self.inner.counters;
        MemoryStats {
            commits: c.commits.load(Ordering::SeqCst),
            conflicts: c.conflicts.load(Ordering::SeqCst),
            savepoint_rollbacks: c.savepoint_rollbacks.load(Ordering::SeqCst),
            failed_commits: c.failed_commits.load(Ordering::SeqCst),
            connections_opened: c.connections_opened.load(Ordering::SeqCst),
            open_connections: c.open_connections.load(Ordering::SeqCst),
        }
    }

    fn current_version(&self, row: &RowRef) -> u64 {
        self.inner
            .tables
            .read()
            .get(&row.0)
            .and_then(|rows| rows.get(&row.1))
            .map_or(0, |r| r.version)
    }

    fn committed_row(&self, row: &RowRef) -> Option<VersionedRow> {
        self.inner
            .tables
            .read()
            .get(&row.0)
            .and_then(|rows| rows.get(&row.1))
            .cloned()
    }

    /// Validate a transaction's reads and apply its writes atomically.
    fn validate_and_apply(&self, state: &TxState) -> BackendResult<()> {
        let _guard = self.inner.commit_lock.lock();
        let counters = &self.inner.counters;

        if let Some(err) = self.inner.injected.lock().pop_front() {
            if err.sqlstate().is(SqlState::SERIALIZATION_FAILURE) {
                counters.conflicts.fetch_add(1, Ordering::SeqCst);
            } else {
                counters.failed_commits.fetch_add(1, Ordering::SeqCst);
            }
            return Err(err);
        }

        for (row, seen) in &state.reads {
            if self.current_version(row) != *seen {
                counters.conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(BackendError::serialization_failure(format!(
                    "restart transaction: row {}/{} was modified concurrently",
                    row.0, row.1
                )));
            }
        }

        for (row, op) in &state.writes {
            if matches!(op, WriteOp::Insert(_)) && self.current_version(row) != 0 {
                counters.failed_commits.fetch_add(1, Ordering::SeqCst);
                return Err(BackendError::database(
                    SqlState::UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint: {}/{}", row.0, row.1),
                ));
            }
        }

        let mut tables = self.inner.tables.write();
        for (row, op) in &state.writes {
            let rows = tables.entry(row.0.clone()).or_default();
            match op {
                WriteOp::Insert(value) | WriteOp::Upsert(value) => {
                    let version = self.inner.next_version.fetch_add(1, Ordering::SeqCst);
                    rows.insert(
                        row.1.clone(),
                        VersionedRow {
                            value: value.clone(),
                            version,
                        },
                    );
                }
                WriteOp::Delete => {
                    rows.remove(&row.1);
                }
            }
        }

        counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionFactory for MemoryDatabase {
    type Connection = MemoryConnection;

    fn connect(&self) -> BackendResult<MemoryConnection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let counters = &self.inner.counters;
        counters.connections_opened.fetch_add(1, Ordering::SeqCst);
        counters.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id,
            db: self.clone(),
            tx: None,
            pending: BTreeMap::new(),
            closed: false,
        })
    }
}

/// A connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: usize,
    db: MemoryDatabase,
    tx: Option<PhysicalTx>,
    /// Entity writes not yet flushed to the transaction.
    pending: BTreeMap<RowRef, WriteOp>,
    closed: bool,
}

impl MemoryConnection {
    // ==================== Row Operations ====================

    /// Read a row, seeing this transaction's own writes.
    ///
    /// Inside a transaction the version of every committed row read is
    /// remembered and re-checked at commit.
    pub fn get(&mut self, table: &str, key: &str) -> BackendResult<Option<Value>> {
        self.ensure_open()?;
        let row = (table.to_string(), key.to_string());

        if let Some(op) = self.pending.get(&row) {
            return Ok(write_value(op));
        }

        let committed = self.db.committed_row(&row);
        match self.tx.as_mut() {
            Some(tx) => {
                if let Some(op) = tx.state.writes.get(&row) {
                    return Ok(write_value(op));
                }
                let version = committed.as_ref().map_or(0, |r| r.version);
                tx.state.reads.entry(row).or_insert(version);
                Ok(committed.map(|r| r.value))
            }
            None => Ok(committed.map(|r| r.value)),
        }
    }

    /// Queue an insert. Fails at commit if the row already exists.
    pub fn insert(&mut self, table: &str, key: &str, value: Value) -> BackendResult<()> {
        self.queue(table, key, WriteOp::Insert(value))
    }

    /// Queue an insert-or-replace.
    pub fn upsert(&mut self, table: &str, key: &str, value: Value) -> BackendResult<()> {
        self.queue(table, key, WriteOp::Upsert(value))
    }

    /// Queue a delete.
    pub fn delete(&mut self, table: &str, key: &str) -> BackendResult<()> {
        self.queue(table, key, WriteOp::Delete)
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Names of the savepoints currently set, outermost first.
    pub fn savepoints(&self) -> Vec<String> {
        self.tx
            .as_ref()
            .map(|tx| tx.savepoints.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    fn queue(&mut self, table: &str, key: &str, op: WriteOp) -> BackendResult<()> {
        self.ensure_open()?;
        if self.tx.is_none() {
            return Err(BackendError::NoTransaction);
        }
        self.pending.insert((table.to_string(), key.to_string()), op);
        Ok(())
    }

    // ==================== Statement Execution ====================

    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::ConnectionClosed(self.id));
        }
        Ok(())
    }

    fn tx_mut(&mut self) -> BackendResult<&mut PhysicalTx> {
        self.tx.as_mut().ok_or(BackendError::NoTransaction)
    }

    fn apply_statement(&mut self, stmt: &sp::Statement) -> BackendResult<()> {
        match stmt {
            sp::Statement::StartTransaction { .. } => self.begin(),
            sp::Statement::Savepoint { name } => {
                let tx = self.tx_mut()?;
                let snapshot = tx.state.clone();
                tx.savepoints.push((name.value.clone(), snapshot));
                Ok(())
            }
            sp::Statement::ReleaseSavepoint { name } => self.release(&name.value),
            sp::Statement::Rollback {
                savepoint: Some(name),
                ..
            } => self.rollback_to(&name.value),
            sp::Statement::Rollback { savepoint: None, .. } => self.rollback(),
            // COMMIT after the outermost savepoint was released has nothing left to do.
            sp::Statement::Commit { .. } => match self.tx {
                Some(_) => self.commit(),
                None => Ok(()),
            },
            other => Err(BackendError::Unsupported(other.to_string())),
        }
    }

    fn release(&mut self, name: &str) -> BackendResult<()> {
        let tx = self.tx_mut()?;
        let idx = tx.savepoint_index(name)?;
        if idx > 0 {
            tx.savepoints.truncate(idx);
            return Ok(());
        }
        // Releasing the outermost savepoint commits. On failure the savepoint
        // stays in place for ROLLBACK TO SAVEPOINT.
        self.commit()
    }

    fn rollback_to(&mut self, name: &str) -> BackendResult<()> {
        let tx = self.tx_mut()?;
        let idx = tx.savepoint_index(name)?;
        tx.state = tx.savepoints[idx].1.clone();
        tx.savepoints.truncate(idx + 1);
        self.db
            .inner
            .counters
            .savepoint_rollbacks
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn write_value(op: &WriteOp) -> Option<Value> {
    match op {
        WriteOp::Insert(value) | WriteOp::Upsert(value) => Some(value.clone()),
        WriteOp::Delete => None,
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> usize {
        self.id
    }

    fn begin(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        if self.tx.is_some() {
            return Err(BackendError::TransactionInProgress);
        }
        self.tx = Some(PhysicalTx::new());
        Ok(())
    }

    fn commit(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        self.flush()?;
        let tx = self.tx.as_ref().ok_or(BackendError::NoTransaction)?;
        if tx.rollback_only {
            self.tx = None;
            self.db
                .inner
                .counters
                .failed_commits
                .fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::database(
                "40000",
                "transaction was marked rollback-only",
            ));
        }
        self.db.validate_and_apply(&tx.state)?;
        self.tx = None;
        Ok(())
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        self.pending.clear();
        self.tx = None;
        Ok(())
    }

    fn execute_native(&mut self, sql: &str) -> BackendResult<u64> {
        self.ensure_open()?;
        let dialect = GenericDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;
        for stmt in &statements {
            self.apply_statement(stmt)?;
        }
        Ok(statements.len() as u64)
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let tx = self.tx_mut()?;
        tx.state.writes.extend(pending);
        Ok(())
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn is_active(&self) -> bool {
        !self.closed && self.tx.is_some()
    }

    fn set_rollback_only(&mut self) {
        if let Some(tx) = self.tx.as_mut() {
            tx.rollback_only = true;
        }
    }

    fn is_rollback_only(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.rollback_only)
    }

    fn close(&mut self) -> BackendResult<()> {
        if self.closed {
            return Ok(());
        }
        self.pending.clear();
        self.tx = None;
        self.closed = true;
        self.db
            .inner
            .counters
            .open_connections
            .fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
