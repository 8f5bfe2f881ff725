//! `sbus` client library
//!
//! Receive-side runtime for session-enabled queues and subscriptions:
//! - [`SessionManager`]: bounded concurrent acquisition of sessions
//! - [`SessionHandle`]: one locked session, its pump and settlement
//! - [`SessionClient`]: entity-scoped entry point tying the two together
//! - [`SessionAcceptor`] / [`SessionLink`]: seams to the protocol layer

pub mod client;
pub mod link;
pub mod message;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use client::SessionClient;
pub use link::{AcceptSessionOptions, SessionAcceptor, SessionLink};
pub use message::{DeadLetterOptions, Disposition, ReceivedMessage, UserProperties};
pub use session::{
    ManagerError, ManagerState, ManagerStats, SessionErrorHandler, SessionHandle,
    SessionHandlerOptions, SessionManager, SessionMessageHandler,
};
