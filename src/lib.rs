//! reqtx - Request-scoped transactions with savepoint retry
//!
//! This crate binds every inbound request to exactly one transaction against
//! a serializable SQL backend. The transaction is protected by a restart
//! savepoint: when the commit loses a serialization conflict, the request
//! handler is replayed on the same connection after a rollback to that
//! savepoint, up to a bounded number of attempts.
//!
//! # Example
//!
//! ```no_run
//! use reqtx::backend::{MemoryConnection, MemoryDatabase};
//! use reqtx::filter::{
//!     BufferedRequest, CapturedResponse, FilterConfig, HandlerResult, IncomingRequest,
//!     RequestContext, RequestTransactionFilter, ResponseBuffer,
//! };
//! use serde_json::json;
//!
//! fn create_user(
//!     _req: &BufferedRequest,
//!     resp: &mut ResponseBuffer,
//!     ctx: &RequestContext<MemoryConnection>,
//! ) -> HandlerResult<()> {
//!     ctx.transaction().connection().upsert("users", "alice", json!({"name": "Alice"}))?;
//!     resp.set_status(201);
//!     Ok(())
//! }
//!
//! let filter = RequestTransactionFilter::new(MemoryDatabase::new(), FilterConfig::default());
//! let mut sink = CapturedResponse::new();
//! let summary = filter
//!     .do_filter(IncomingRequest::new("POST", "/users"), &mut sink, &create_user)
//!     .unwrap();
//! assert_eq!(summary.status, 201);
//! ```

pub mod backend;
pub mod filter;
pub mod session;
pub mod transaction;
