//! Secondary resources owned by a session.

use crate::session::error::SessionResult;

/// Something a session must release when it closes (caches, file handles,
/// provider state). Resources are closed in reverse enlistment order.
pub trait SessionResource: Send {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Release the resource. Called at most once.
    fn close(&mut self) -> SessionResult<()>;
}

/// Adapter turning a closure into a [`SessionResource`].
pub struct CloseFn<F> {
    name: String,
    close: Option<F>,
}

impl<F> CloseFn<F>
where
    F: FnOnce() -> SessionResult<()> + Send,
{
    pub fn new(name: impl Into<String>, close: F) -> Self {
        Self {
            name: name.into(),
            close: Some(close),
        }
    }
}

impl<F> SessionResource for CloseFn<F>
where
    F: FnOnce() -> SessionResult<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> SessionResult<()> {
        match self.close.take() {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}
