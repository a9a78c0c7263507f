//! The connection contract the transaction layer is written against.

use crate::backend::error::BackendResult;

/// One logical database session, as handed out by a [`ConnectionFactory`].
///
/// The transaction layer drives the connection through begin/commit/rollback
/// and backend-specific native statements (`SAVEPOINT ...`). The connection
/// also owns a client-side cache of pending entity writes which `flush`
/// sends to the server and `clear` discards.
pub trait Connection: Send {
    /// Identifier used in log output.
    fn id(&self) -> usize;

    /// Open a physical transaction.
    fn begin(&mut self) -> BackendResult<()>;

    /// Commit the physical transaction.
    fn commit(&mut self) -> BackendResult<()>;

    /// Abort the physical transaction entirely.
    fn rollback(&mut self) -> BackendResult<()>;

    /// Execute one or more native statements, returning the number executed.
    fn execute_native(&mut self, sql: &str) -> BackendResult<u64>;

    /// Send pending entity writes to the server.
    fn flush(&mut self) -> BackendResult<()>;

    /// Discard all client-side cached entity state.
    fn clear(&mut self);

    /// Whether a physical transaction is open.
    fn is_active(&self) -> bool;

    /// Mark the physical transaction so that it can only roll back.
    fn set_rollback_only(&mut self);

    /// Whether the physical transaction has been marked rollback-only.
    fn is_rollback_only(&self) -> bool;

    /// Close the connection, aborting any open transaction.
    fn close(&mut self) -> BackendResult<()>;
}

/// Produces one connection per request.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection + 'static;

    /// Open a new connection.
    fn connect(&self) -> BackendResult<Self::Connection>;
}
