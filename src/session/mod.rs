//! Per-request sessions.
//!
//! A [`Session`] owns the connection, the [`TransactionCoordinator`] driving
//! it, and any secondary resources a request picks up. Sessions are created
//! by a [`SessionFactory`] and closed exactly once, either by the request
//! thread or by an asynchronous completion listener.
//!
//! [`TransactionCoordinator`]: crate::transaction::TransactionCoordinator

mod error;
mod factory;
mod resource;
mod session;

pub use error::{SessionError, SessionResult};
pub use factory::SessionFactory;
pub use resource::{CloseFn, SessionResource};
pub use session::Session;
