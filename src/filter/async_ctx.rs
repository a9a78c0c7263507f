//! Deferred request completion.

use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

/// How an asynchronous request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncEvent {
    Complete,
    Timeout,
    /// The request failed or the client went away.
    Error(String),
}

type Listener = Box<dyn FnOnce(AsyncEvent) + Send>;

#[derive(Default)]
struct AsyncState {
    started: bool,
    outcome: Option<AsyncEvent>,
    listeners: Vec<Listener>,
}

/// Lifecycle notifier for requests that complete after the handler returns.
///
/// Clones share state. Completion happens once; the first of
/// [`complete`](Self::complete), [`timeout`](Self::timeout) or
/// [`error`](Self::error) wins and every listener fires exactly once with it.
#[derive(Clone, Default)]
pub struct AsyncContext {
    inner: Arc<Mutex<AsyncState>>,
}

impl AsyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put the request into asynchronous mode.
    pub fn start(&self) {
        self.inner.lock().started = true;
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// How the request ended, once it has.
    pub fn outcome(&self) -> Option<AsyncEvent> {
        self.inner.lock().outcome.clone()
    }

    /// Register a listener for the end of the request.
    ///
    /// Returns `true` if the listener was queued. If the request already
    /// ended the listener runs immediately on this thread and `false` is
    /// returned.
    pub fn add_listener<F>(&self, listener: F) -> bool
    where
        F: FnOnce(AsyncEvent) + Send + 'static,
    {
        let mut state = self.inner.lock();
        match state.outcome.clone() {
            Some(event) => {
                drop(state);
                listener(event);
                false
            }
            None => {
                state.listeners.push(Box::new(listener));
                true
            }
        }
    }

    pub fn complete(&self) -> bool {
        self.finish(AsyncEvent::Complete)
    }

    pub fn timeout(&self) -> bool {
        self.finish(AsyncEvent::Timeout)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.finish(AsyncEvent::Error(message.into()))
    }

    /// Record the outcome and fire listeners outside the lock.
    fn finish(&self, event: AsyncEvent) -> bool {
        let listeners = {
            let mut state = self.inner.lock();
            if state.outcome.is_some() {
                trace!("async request already ended, ignoring {:?}", event);
                return false;
            }
            state.outcome = Some(event.clone());
            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            listener(event.clone());
        }
        true
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AsyncContext")
            .field("started", &state.started)
            .field("outcome", &state.outcome)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
