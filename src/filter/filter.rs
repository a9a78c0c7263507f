//! Request transaction filter - the retry loop.
//!
//! ```text
//!   create session ─► buffer body ─► begin
//!        │
//!        ▼
//!   ┌─► handler(request, buffer, ctx) ─► commit ─► flush ─► close
//!   │        │                             │
//!   │    conflict                       conflict
//!   │        └──────────────┬──────────────┘
//!   │                       ▼
//!   └── backoff ◄── discard ◄── rollback to savepoint
//! ```

use std::sync::Arc;

use log::{debug, trace, warn};
use serde::Serialize;

use crate::backend::{Connection, ConnectionFactory};
use crate::filter::async_ctx::AsyncContext;
use crate::filter::config::FilterConfig;
use crate::filter::context::RequestContext;
use crate::filter::error::{FilterError, FilterResult, HandlerError, HandlerResult};
use crate::filter::request::{BufferedRequest, IncomingRequest};
use crate::filter::response::{ResponseBuffer, ResponseSink};
use crate::session::{Session, SessionFactory};
use crate::transaction::TransactionResult;

/// The rest of the request pipeline.
///
/// Implemented for every `Fn(&BufferedRequest, &mut ResponseBuffer,
/// &RequestContext<C>) -> HandlerResult<()>`.
pub trait Handler<C: Connection> {
    fn handle(
        &self,
        request: &BufferedRequest,
        response: &mut ResponseBuffer,
        ctx: &RequestContext<C>,
    ) -> HandlerResult<()>;
}

impl<C, F> Handler<C> for F
where
    C: Connection,
    F: Fn(&BufferedRequest, &mut ResponseBuffer, &RequestContext<C>) -> HandlerResult<()>,
{
    fn handle(
        &self,
        request: &BufferedRequest,
        response: &mut ResponseBuffer,
        ctx: &RequestContext<C>,
    ) -> HandlerResult<()> {
        self(request, response, ctx)
    }
}

/// What happened to a request that went through the filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub session_id: String,
    /// Handler invocations, including the successful one.
    pub attempts: u32,
    pub status: u16,
    /// The session is closed later by an async completion listener.
    pub deferred_close: bool,
}

/// Binds each request to one transaction and replays the handler when the
/// commit loses a serialization conflict.
pub struct RequestTransactionFilter<F: ConnectionFactory> {
    sessions: SessionFactory<F>,
    config: FilterConfig,
}

impl<F: ConnectionFactory> RequestTransactionFilter<F> {
    pub fn new(connections: F, config: FilterConfig) -> Self {
        let sessions = SessionFactory::new(connections)
            .with_savepoint(config.savepoint_name.clone())
            .with_policy(config.rollback_only_policy)
            .with_timeout(config.transaction_timeout());
        Self { sessions, config }
    }

    pub fn sessions(&self) -> &SessionFactory<F> {
        &self.sessions
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run one request through the handler inside a retried transaction.
    ///
    /// The response reaches `sink` only if an attempt succeeds. The session
    /// is closed before returning unless the handler switched the request to
    /// asynchronous mode, in which case it is closed once the async context
    /// completes.
    pub fn do_filter<H>(
        &self,
        request: IncomingRequest,
        sink: &mut dyn ResponseSink,
        handler: &H,
    ) -> FilterResult<RequestSummary>
    where
        H: Handler<F::Connection> + ?Sized,
    {
        let session = self.sessions.create().map_err(FilterError::Session)?;
        trace!("session {} opened for request", session.id());

        let request = match BufferedRequest::read(request) {
            Ok(request) => request,
            Err(e) => {
                session.close();
                return Err(FilterError::RequestBody(e));
            }
        };

        let result = self.run_attempts(&session, &request, sink, handler);
        let deferred_close = self.finish(&session, request.async_context());

        let (attempts, status) = result?;
        Ok(RequestSummary {
            session_id: session.id().to_string(),
            attempts,
            status,
            deferred_close,
        })
    }

    fn run_attempts<H>(
        &self,
        session: &Arc<Session<F::Connection>>,
        request: &BufferedRequest,
        sink: &mut dyn ResponseSink,
        handler: &H,
    ) -> FilterResult<(u32, u16)>
    where
        H: Handler<F::Connection> + ?Sized,
    {
        drop(
            session
                .begin_request_transaction()
                .map_err(FilterError::Begin)?,
        );

        let max_attempts = self.config.max_attempts.max(1);
        let mut response = ResponseBuffer::new();
        let mut attempt = 1;

        loop {
            let ctx = RequestContext::new(
                session.clone(),
                request.client().clone(),
                attempt,
                request.async_context().clone(),
            );

            let failure = match handler.handle(request, &mut response, &ctx) {
                Ok(()) => match self.complete_attempt(session, request) {
                    Ok(()) => {
                        response.flush_to(sink).map_err(FilterError::Response)?;
                        trace!("session {} done after {} attempt(s)", session.id(), attempt);
                        return Ok((attempt, response.status()));
                    }
                    Err(e) if e.is_retryable() => HandlerError::Transaction(e),
                    Err(source) => return Err(FilterError::Commit { attempt, source }),
                },
                Err(e) if e.is_retryable() => e,
                Err(source) => return Err(FilterError::Handler { attempt, source }),
            };
            drop(ctx);

            debug!(
                "session {} attempt {}/{} failed, rolling back to savepoint: {}",
                session.id(),
                attempt,
                max_attempts,
                failure
            );
            session
                .transaction()
                .rollback()
                .map_err(|source| FilterError::Rollback { attempt, source })?;
            response.discard();

            if attempt >= max_attempts {
                warn!(
                    "session {} giving up after {} conflicting attempts",
                    session.id(),
                    attempt
                );
                return Err(FilterError::RetriesExhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            self.config.backoff.pause(attempt);
            attempt += 1;
        }
    }

    /// Commit what the handler left open.
    fn complete_attempt(
        &self,
        session: &Session<F::Connection>,
        request: &BufferedRequest,
    ) -> TransactionResult<()> {
        if request.is_async_started() {
            trace!("session {} is asynchronous, leaving transaction open", session.id());
            return Ok(());
        }

        let mut tx = session.transaction();
        if !tx.is_active() {
            return Ok(());
        }
        // The physical flag: the suppressed read hides a mark set on a retry.
        if tx.transaction().connection().is_rollback_only() {
            debug!(
                "transaction {} marked rollback-only, rolling back",
                tx.metadata().tx_id
            );
            return tx.rollback();
        }
        tx.commit()
    }

    /// Close the session now, or hand it to the async completion listener.
    ///
    /// Returns whether closing was deferred.
    fn finish(&self, session: &Arc<Session<F::Connection>>, async_ctx: &AsyncContext) -> bool {
        if !async_ctx.is_started() {
            session.close();
            return false;
        }

        let listener_session = session.clone();
        let deferred = async_ctx.add_listener(move |event| {
            trace!(
                "async request of session {} ended with {:?}",
                listener_session.id(),
                event
            );
            listener_session.close();
        });
        if deferred {
            trace!("session {} close deferred to async completion", session.id());
        }
        deferred
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for RequestTransactionFilter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTransactionFilter")
            .field("sessions", &self.sessions)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::backend::{
        BackendError, BackendResult, ErrorCategory, MemoryConnection, MemoryDatabase,
    };
    use crate::filter::{BackoffPolicy, CapturedResponse};
    use crate::session::CloseFn;
    use crate::transaction::TransactionError;

    type Ctx = RequestContext<MemoryConnection>;

    /// Memory connection whose `ROLLBACK TO SAVEPOINT` always fails.
    struct LostOnRollback(MemoryConnection);

    impl Connection for LostOnRollback {
        fn id(&self) -> usize {
            self.0.id()
        }

        fn begin(&mut self) -> BackendResult<()> {
            self.0.begin()
        }

        fn commit(&mut self) -> BackendResult<()> {
            self.0.commit()
        }

        fn rollback(&mut self) -> BackendResult<()> {
            self.0.rollback()
        }

        fn execute_native(&mut self, sql: &str) -> BackendResult<u64> {
            if sql.starts_with("ROLLBACK TO SAVEPOINT") {
                return Err(BackendError::database("08006", "connection reset"));
            }
            self.0.execute_native(sql)
        }

        fn flush(&mut self) -> BackendResult<()> {
            self.0.flush()
        }

        fn clear(&mut self) {
            self.0.clear()
        }

        fn is_active(&self) -> bool {
            self.0.is_active()
        }

        fn set_rollback_only(&mut self) {
            self.0.set_rollback_only()
        }

        fn is_rollback_only(&self) -> bool {
            self.0.is_rollback_only()
        }

        fn close(&mut self) -> BackendResult<()> {
            self.0.close()
        }
    }

    struct LostOnRollbackDb(MemoryDatabase);

    impl ConnectionFactory for LostOnRollbackDb {
        type Connection = LostOnRollback;

        fn connect(&self) -> BackendResult<LostOnRollback> {
            self.0.connect().map(LostOnRollback)
        }
    }

    fn setup(max_attempts: u32) -> (MemoryDatabase, RequestTransactionFilter<MemoryDatabase>) {
        let db = MemoryDatabase::new();
        let config = FilterConfig::new()
            .max_attempts(max_attempts)
            .backoff(BackoffPolicy::Yield);
        (db.clone(), RequestTransactionFilter::new(db, config))
    }

    fn conflict() -> HandlerError {
        HandlerError::Transaction(TransactionError::Retryable {
            source: BackendError::serialization_failure("restart transaction"),
        })
    }

    fn post(body: &str) -> IncomingRequest {
        IncomingRequest::new("POST", "/realms/master/protocol/openid-connect/token")
            .body(body.as_bytes().to_vec())
    }

    #[test]
    fn test_invocations_are_one_plus_conflicts() {
        let (_db, filter) = setup(10);
        let calls = AtomicU32::new(0);
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, _: &Ctx| -> HandlerResult<()> {
            if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                return Err(conflict());
            }
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(summary.attempts, 5);
        assert_eq!(sink.flushes(), 1);
    }

    #[test]
    fn test_exhaustion_is_an_error_without_response() {
        let (db, filter) = setup(4);
        let calls = AtomicU32::new(0);
        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, _: &Ctx| -> HandlerResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            write!(resp, "never sent").map_err(|e| HandlerError::failed(e.to_string()))?;
            Err(conflict())
        };

        let mut sink = CapturedResponse::new();
        let err = filter.do_filter(post(""), &mut sink, &handler).unwrap_err();

        assert!(matches!(err, FilterError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(err.status_code(), 409);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.flushes(), 0);
        assert_eq!(filter.sessions().sessions_open(), 0);
        assert_eq!(db.stats().open_connections, 0);
    }

    #[test]
    fn test_success_on_third_attempt() {
        let (db, filter) = setup(10);
        let closes = Arc::new(AtomicUsize::new(0));
        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            if ctx.attempt() == 1 {
                let closes = closes.clone();
                ctx.session().enlist(Box::new(CloseFn::new("user-cache", move || {
                    closes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })))?;
            }
            ctx.transaction()
                .connection()
                .upsert("sessions", "s1", json!({ "attempt": ctx.attempt() }))?;
            if ctx.attempt() < 3 {
                db.fail_next_commit(BackendError::serialization_failure("restart transaction"));
            }
            write!(resp, "attempt {}", ctx.attempt()).map_err(|e| HandlerError::failed(e.to_string()))
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert_eq!(summary.attempts, 3);
        assert!(!summary.deferred_close);
        let stats = db.stats();
        assert_eq!(stats.savepoint_rollbacks, 2);
        assert_eq!(stats.conflicts, 2);
        assert_eq!(stats.commits, 1);
        assert_eq!(sink.flushes(), 1);
        assert_eq!(sink.body_text(), "attempt 3");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(filter.sessions().sessions_open(), 0);
        assert_eq!(db.read_committed("sessions", "s1"), Some(json!({ "attempt": 3 })));
    }

    #[test]
    fn test_concurrent_write_replays_from_savepoint() {
        let (db, filter) = setup(10);
        db.write_committed("counters", "logins", json!(0));

        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let mut tx = ctx.transaction();
            let current = tx.connection().get("counters", "logins")?.and_then(|v| v.as_i64());
            let current = current.unwrap_or(0);
            if ctx.attempt() == 1 {
                // another request commits between our read and our commit
                db.write_committed("counters", "logins", json!(100));
            }
            tx.connection().upsert("counters", "logins", json!(current + 1))?;
            write!(resp, "{}", current + 1).map_err(|e| HandlerError::failed(e.to_string()))
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert_eq!(summary.attempts, 2);
        assert_eq!(db.read_committed("counters", "logins"), Some(json!(101)));
        assert_eq!(sink.body_text(), "101");
    }

    #[test]
    fn test_async_session_closed_by_listener() {
        let (db, filter) = setup(10);
        let async_ctx = AsyncContext::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let closes = closes.clone();
            ctx.session().enlist(Box::new(CloseFn::new("stream", move || {
                closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))?;
            ctx.transaction().connection().upsert("events", "e1", json!("queued"))?;
            ctx.transaction().commit()?;
            ctx.start_async();
            Ok(())
        };

        let request = post("").async_context(async_ctx.clone());
        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(request, &mut sink, &handler).unwrap();

        assert!(summary.deferred_close);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(filter.sessions().sessions_open(), 1);

        async_ctx.complete();
        async_ctx.timeout();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(filter.sessions().sessions_open(), 0);
        assert_eq!(db.read_committed("events", "e1"), Some(json!("queued")));
    }

    #[test]
    fn test_async_completed_during_handler_closes_once() {
        let (_db, filter) = setup(10);
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            ctx.start_async().complete();
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert!(!summary.deferred_close);
        assert_eq!(filter.sessions().sessions_open(), 0);
    }

    #[test]
    fn test_fatal_commit_is_not_retried() {
        let (db, filter) = setup(10);
        db.write_committed("users", "alice", json!({ "name": "Alice" }));
        let calls = AtomicU32::new(0);
        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.transaction()
                .connection()
                .insert("users", "alice", json!({ "name": "Alice 2" }))?;
            write!(resp, "created").map_err(|e| HandlerError::failed(e.to_string()))
        };

        let mut sink = CapturedResponse::new();
        let err = filter.do_filter(post(""), &mut sink, &handler).unwrap_err();

        assert!(matches!(err, FilterError::Commit { attempt: 1, .. }));
        assert_eq!(err.category(), Some(ErrorCategory::ConstraintViolation));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.flushes(), 0);
        assert_eq!(db.read_committed("users", "alice"), Some(json!({ "name": "Alice" })));
        assert_eq!(filter.sessions().sessions_open(), 0);
    }

    #[test]
    fn test_handler_failure_rolls_back_on_close() {
        let (db, filter) = setup(10);
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            ctx.transaction().connection().upsert("users", "bob", json!({}))?;
            Err(HandlerError::failed("invalid redirect_uri"))
        };

        let mut sink = CapturedResponse::new();
        let err = filter.do_filter(post(""), &mut sink, &handler).unwrap_err();

        assert!(matches!(err, FilterError::Handler { attempt: 1, .. }));
        assert_eq!(err.status_code(), 500);
        assert_eq!(db.read_committed("users", "bob"), None);
        assert!(db.stats().savepoint_rollbacks >= 1);
    }

    #[test]
    fn test_failed_savepoint_rollback_never_commits_on_close() {
        let db = MemoryDatabase::new();
        let config = FilterConfig::new().backoff(BackoffPolicy::Yield);
        let filter = RequestTransactionFilter::new(LostOnRollbackDb(db.clone()), config);
        let handler = |_: &BufferedRequest,
                       _: &mut ResponseBuffer,
                       ctx: &RequestContext<LostOnRollback>|
         -> HandlerResult<()> {
            ctx.transaction()
                .connection()
                .0
                .upsert("users", "mallory", json!({ "admin": true }))?;
            Err(HandlerError::failed("invalid redirect_uri"))
        };

        let mut sink = CapturedResponse::new();
        let err = filter.do_filter(post(""), &mut sink, &handler).unwrap_err();

        assert!(matches!(err, FilterError::Handler { attempt: 1, .. }));
        assert_eq!(db.read_committed("users", "mallory"), None);
        assert_eq!(db.stats().commits, 0);
        assert_eq!(db.stats().open_connections, 0);
        assert_eq!(filter.sessions().sessions_open(), 0);
    }

    #[test]
    fn test_rollback_only_transaction_is_not_committed() {
        let (db, filter) = setup(10);
        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let mut tx = ctx.transaction();
            tx.connection().upsert("users", "carol", json!({}))?;
            tx.set_rollback_only();
            resp.send_error(400, "invalid grant");
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert_eq!(summary.status, 400);
        assert_eq!(sink.status, Some(400));
        assert_eq!(db.read_committed("users", "carol"), None);
    }

    #[test]
    fn test_rollback_only_honored_on_retry_after_conflict() {
        let (db, filter) = setup(10);
        let handler = |_: &BufferedRequest, resp: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let mut tx = ctx.transaction();
            tx.connection().upsert("users", "carol", json!({}))?;
            if ctx.attempt() == 1 {
                db.fail_next_commit(BackendError::serialization_failure("restart transaction"));
                return Ok(());
            }
            tx.set_rollback_only();
            resp.send_error(400, "invalid grant");
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        let summary = filter.do_filter(post(""), &mut sink, &handler).unwrap();

        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.status, 400);
        assert_eq!(sink.status, Some(400));
        assert_eq!(db.read_committed("users", "carol"), None);
        assert_eq!(db.stats().failed_commits, 0);
    }

    #[test]
    fn test_handler_commit_is_not_repeated() {
        let (db, filter) = setup(10);
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let mut tx = ctx.transaction();
            tx.connection().upsert("clients", "admin-cli", json!({}))?;
            tx.commit()?;
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        filter.do_filter(post(""), &mut sink, &handler).unwrap();
        assert_eq!(db.stats().commits, 1);
    }

    #[test]
    fn test_body_and_context_fresh_per_attempt() {
        let (_db, filter) = setup(10);
        let seen = Mutex::new(Vec::new());
        let handler = |req: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let body = req.body_text().map_err(|e| HandlerError::failed(e.to_string()))?;
            seen.lock().push((ctx.attempt(), ctx.is_retry(), body.to_string()));
            if ctx.attempt() < 3 {
                return Err(conflict());
            }
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        filter
            .do_filter(post("grant_type=password"), &mut sink, &handler)
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 3);
        for (i, (attempt, is_retry, body)) in seen.iter().enumerate() {
            assert_eq!(*attempt, i as u32 + 1);
            assert_eq!(*is_retry, i > 0);
            assert_eq!(body, "grant_type=password");
        }
    }

    #[test]
    fn test_configured_savepoint_name() {
        let db = MemoryDatabase::new();
        let config = FilterConfig::new()
            .backoff(BackoffPolicy::Yield)
            .savepoint_name(crate::backend::SavepointName::new("sp_request").unwrap());
        let filter = RequestTransactionFilter::new(db.clone(), config);
        let handler = |_: &BufferedRequest, _: &mut ResponseBuffer, ctx: &Ctx| -> HandlerResult<()> {
            let tx = ctx.transaction();
            assert_eq!(tx.transaction().connection().savepoints(), vec!["sp_request"]);
            Ok(())
        };

        let mut sink = CapturedResponse::new();
        filter.do_filter(post(""), &mut sink, &handler).unwrap();
        assert_eq!(db.stats().open_connections, 0);
        assert_eq!(filter.sessions().sessions_created(), 1);
    }
}
