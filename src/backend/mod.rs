//! SQL backend boundary for reqtx
//!
//! The transaction layer never talks to a driver directly. It drives a
//! [`Connection`] produced by a [`ConnectionFactory`] and asks a
//! [`FailureClassifier`] what a failed commit means.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SavepointTransaction                       │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                              │
//!                  ▼                              ▼
//!  ┌───────────────────────────────┐   ┌──────────────────────┐
//!  │ Connection (begin / commit /  │   │  FailureClassifier   │
//!  │ rollback / native statements) │   │ (SQLSTATE → retry?)  │
//!  └───────────────────────────────┘   └──────────────────────┘
//!                  │
//!                  ▼
//!  ┌───────────────────────────────┐
//!  │ MemoryDatabase (serializable, │
//!  │ optimistic reference backend) │
//!  └───────────────────────────────┘
//! ```

mod classify;
mod connection;
mod error;
mod memory;
mod types;

pub use classify::{ErrorCategory, FailureClass, FailureClassifier, SqlStateClassifier};
pub use connection::{Connection, ConnectionFactory};
pub use error::{BackendError, BackendResult};
pub use memory::{MemoryConnection, MemoryDatabase, MemoryStats};
pub use types::{InvalidNameError, SavepointName, SqlState};
