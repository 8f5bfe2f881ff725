//! Session runtime: concurrent session acquisition and per-session pumps.

pub mod handle;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod types;
mod worker;

pub use handle::SessionHandle;
pub use manager::{DEFAULT_MAX_CONCURRENT_SESSIONS, SessionManager, host_concurrency};
pub use pool::{Permit, PermitPool, PoolError, SessionPermits};
pub use registry::SessionRegistry;
pub use types::{
    ManagerError, ManagerState, ManagerStats, SessionErrorHandler, SessionHandlerOptions,
    SessionMessageHandler,
};
