//! Transaction management for reqtx.
//!
//! Every request runs inside one physical transaction protected by a restart
//! savepoint. A serializable conflict at commit rolls back to the savepoint
//! and the request is replayed on the same connection; anything else is
//! fatal.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                     │
//! │  (single-use delegate, observers, timeout, rollback policy) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Savepoint  │       │   Commit    │       │  Observer   │
//!  │ Transaction │       │   Outcome   │       │  Registry   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use reqtx::transaction::{SavepointTransaction, TransactionBoundary, TransactionCoordinator};
//!
//! let tx = SavepointTransaction::new(conn, SavepointName::default(), classifier);
//! let mut coordinator = TransactionCoordinator::new(tx, Arc::new(TransactionBoundary::new()));
//!
//! coordinator.begin()?;
//! loop {
//!     do_work(coordinator.connection())?;
//!     match coordinator.commit() {
//!         Err(e) if e.is_retryable() => coordinator.rollback()?,
//!         other => break other?,
//!     }
//! }
//! ```

mod coordinator;
mod error;
mod observer;
mod outcome;
mod savepoint;

pub use coordinator::{RollbackOnlyPolicy, TransactionCoordinator, TransactionStatus};
pub use error::{TransactionError, TransactionResult};
pub use observer::{
    ObserverError, ObserverId, ObserverRegistry, TransactionBoundary, TransactionObserver,
    TransactionOwner,
};
pub use outcome::CommitOutcome;
pub use savepoint::{SavepointTransaction, TransactionMetadata};
