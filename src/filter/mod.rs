//! Request-scoped transaction filter.
//!
//! Wraps the handler pipeline so every request runs in exactly one
//! transaction. The request body is buffered up front, the response is
//! buffered per attempt, and a commit that loses a serialization conflict
//! replays the handler after rolling back to the restart savepoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RequestTransactionFilter                    │
//! │        (attempt loop, backoff, session close/deferral)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                   │
//!          ▼                  ▼                   ▼
//!  ┌───────────────┐  ┌───────────────┐  ┌─────────────────┐
//!  │BufferedRequest│  │ResponseBuffer │  │ RequestContext  │
//!  │ (replayable)  │  │(flush/discard)│  │  (per attempt)  │
//!  └───────────────┘  └───────────────┘  └─────────────────┘
//!                                                 │
//!                                                 ▼
//!                                     ┌───────────────────────┐
//!                                     │ Session / Coordinator │
//!                                     └───────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let filter = RequestTransactionFilter::new(db, FilterConfig::default());
//! let handler = |req: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &RequestContext<_>| {
//!     ctx.transaction().connection().upsert("users", "alice", json!({}))?;
//!     Ok(())
//! };
//! filter.do_filter(request, &mut sink, &handler)?;
//! ```

mod async_ctx;
mod backoff;
mod config;
mod context;
mod error;
mod filter;
mod request;
mod response;

pub use async_ctx::{AsyncContext, AsyncEvent};
pub use backoff::BackoffPolicy;
pub use config::{ConfigError, FilterConfig, DEFAULT_MAX_ATTEMPTS};
pub use context::RequestContext;
pub use error::{FilterError, FilterResult, HandlerError, HandlerResult};
pub use filter::{Handler, RequestSummary, RequestTransactionFilter};
pub use request::{BufferedRequest, ClientConnection, IncomingRequest};
pub use response::{CapturedResponse, ResponseBuffer, ResponseSink};
