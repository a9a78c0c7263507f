//! Per-attempt request context.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::backend::Connection;
use crate::filter::async_ctx::AsyncContext;
use crate::filter::request::ClientConnection;
use crate::session::Session;
use crate::transaction::TransactionCoordinator;

/// What a handler needs to reach the current transaction.
///
/// Built fresh for every attempt and passed to the handler explicitly.
pub struct RequestContext<C: Connection> {
    session: Arc<Session<C>>,
    client: ClientConnection,
    attempt: u32,
    async_ctx: AsyncContext,
}

impl<C: Connection> RequestContext<C> {
    pub(crate) fn new(
        session: Arc<Session<C>>,
        client: ClientConnection,
        attempt: u32,
        async_ctx: AsyncContext,
    ) -> Self {
        Self {
            session,
            client,
            attempt,
            async_ctx,
        }
    }

    /// The session of this request. Clone the `Arc` to keep it past the
    /// handler call, e.g. for asynchronous completion.
    pub fn session(&self) -> &Arc<Session<C>> {
        &self.session
    }

    /// Lock the request's transaction coordinator.
    ///
    /// The guard must be dropped before the handler returns.
    pub fn transaction(&self) -> MutexGuard<'_, TransactionCoordinator<C>> {
        self.session.transaction()
    }

    pub fn client(&self) -> &ClientConnection {
        &self.client
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Switch the request to asynchronous completion.
    ///
    /// The filter neither commits nor closes the session of an asynchronous
    /// request; the session is closed when the returned context completes.
    pub fn start_async(&self) -> AsyncContext {
        self.async_ctx.start();
        self.async_ctx.clone()
    }

    pub fn async_context(&self) -> &AsyncContext {
        &self.async_ctx
    }
}

impl<C: Connection> std::fmt::Debug for RequestContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("session", &self.session.id())
            .field("client", &self.client)
            .field("attempt", &self.attempt)
            .finish()
    }
}
