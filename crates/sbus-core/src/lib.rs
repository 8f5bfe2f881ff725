//! `sbus` Core Library
//!
//! Shared functionality for `sbus` components:
//! - Error taxonomy and AMQP condition mapping
//! - Session error classification used by the session runtime
//! - Entity path helpers for queues and topic subscriptions
//! - Configuration resolution and hierarchy
//! - Tracing initialisation

pub mod condition;
pub mod config;
pub mod entity;
pub mod error;
pub mod tracing_init;

pub use condition::{ErrorCondition, MessagingError, SessionErrorClass};
pub use config::{Config, LogConfig, ReceiveMode, SessionConfig};
pub use entity::EntityPath;
pub use error::{BoxError, Error, Result};
