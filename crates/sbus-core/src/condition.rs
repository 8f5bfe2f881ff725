//! AMQP error conditions and their classification.
//!
//! The transport layer reports failures as AMQP condition strings. This
//! module maps them onto a closed [`ErrorCondition`] enum exactly once, at
//! the edge, so the session runtime can decide between backoff and
//! escalation with a plain `match` instead of comparing strings.

use std::fmt;

/// A broker-reported error condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    /// `amqp:internal-error`
    InternalError,
    /// `amqp:not-found`
    NotFound,
    /// `amqp:unauthorized-access`
    UnauthorizedAccess,
    /// `amqp:resource-limit-exceeded`
    ResourceLimitExceeded,
    /// `amqp:not-allowed`
    NotAllowed,
    /// `amqp:operation-timeout`
    OperationTimeout,
    /// `amqp:link:detach-forced`
    LinkDetachForced,
    /// `amqp:connection:forced`
    ConnectionForced,
    /// `com.microsoft:timeout`. Raised by an accept when no unlocked
    /// session became available before the broker gave up waiting.
    Timeout,
    /// `com.microsoft:server-busy`
    ServerBusy,
    /// `com.microsoft:session-cannot-be-locked`
    SessionCannotBeLocked,
    /// `com.microsoft:session-lock-lost`
    SessionLockLost,
    /// `com.microsoft:message-lock-lost`
    MessageLockLost,
    /// `com.microsoft:message-wait-timeout`. The session ran out of messages.
    MessageWaitTimeout,
    /// `com.microsoft:entity-disabled`
    EntityDisabled,
    /// `com.microsoft:argument-error`
    ArgumentError,
    /// Any condition outside the table.
    Unknown(String),
}

/// Condition string table. Order is irrelevant; lookups are exact.
const CONDITION_TABLE: &[(&str, ErrorCondition)] = &[
    ("amqp:internal-error", ErrorCondition::InternalError),
    ("amqp:not-found", ErrorCondition::NotFound),
    ("amqp:unauthorized-access", ErrorCondition::UnauthorizedAccess),
    (
        "amqp:resource-limit-exceeded",
        ErrorCondition::ResourceLimitExceeded,
    ),
    ("amqp:not-allowed", ErrorCondition::NotAllowed),
    ("amqp:operation-timeout", ErrorCondition::OperationTimeout),
    ("amqp:link:detach-forced", ErrorCondition::LinkDetachForced),
    ("amqp:connection:forced", ErrorCondition::ConnectionForced),
    ("com.microsoft:timeout", ErrorCondition::Timeout),
    ("com.microsoft:server-busy", ErrorCondition::ServerBusy),
    (
        "com.microsoft:session-cannot-be-locked",
        ErrorCondition::SessionCannotBeLocked,
    ),
    (
        "com.microsoft:session-lock-lost",
        ErrorCondition::SessionLockLost,
    ),
    (
        "com.microsoft:message-lock-lost",
        ErrorCondition::MessageLockLost,
    ),
    (
        "com.microsoft:message-wait-timeout",
        ErrorCondition::MessageWaitTimeout,
    ),
    (
        "com.microsoft:entity-disabled",
        ErrorCondition::EntityDisabled,
    ),
    ("com.microsoft:argument-error", ErrorCondition::ArgumentError),
];

impl ErrorCondition {
    /// Map an AMQP condition string onto the enum.
    pub fn from_condition(condition: &str) -> Self {
        CONDITION_TABLE
            .iter()
            .find(|(name, _)| *name == condition)
            .map_or_else(|| Self::Unknown(condition.to_string()), |(_, c)| c.clone())
    }

    /// The AMQP condition string for this variant.
    pub fn as_str(&self) -> &str {
        if let Self::Unknown(raw) = self {
            return raw;
        }
        CONDITION_TABLE
            .iter()
            .find(|(_, c)| c == self)
            .map_or("", |(name, _)| *name)
    }

    /// Whether the transport layer may retry an operation that failed with
    /// this condition.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InternalError
                | Self::OperationTimeout
                | Self::LinkDetachForced
                | Self::ConnectionForced
                | Self::Timeout
                | Self::ServerBusy
        )
    }

    /// Session runtime classification for this condition.
    pub const fn classify(&self) -> SessionErrorClass {
        match self {
            Self::Timeout => SessionErrorClass::NoActiveSession,
            Self::OperationTimeout | Self::SessionCannotBeLocked => {
                SessionErrorClass::OperationTimeout
            }
            Self::MessageWaitTimeout => SessionErrorClass::MessageWaitTimeout,
            _ => SessionErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session runtime treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorClass {
    /// No unlocked session is currently claimable. Back off, stay quiet.
    NoActiveSession,
    /// The accept timed out or the session lock is contended. Back off,
    /// stay quiet.
    OperationTimeout,
    /// A pumped session ran dry. Normal end of that session, stay quiet.
    MessageWaitTimeout,
    /// Anything else. Surface to the user error handler.
    Other,
}

impl SessionErrorClass {
    /// Whether an accept failure of this class is absorbed by a backoff.
    pub const fn backs_off(self) -> bool {
        matches!(self, Self::NoActiveSession | Self::OperationTimeout)
    }

    /// Whether an error of this class reaches the user error handler.
    pub const fn is_reported(self) -> bool {
        matches!(self, Self::Other)
    }
}

/// Error reported by the broker for a messaging operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{condition}: {description}")]
pub struct MessagingError {
    pub condition: ErrorCondition,
    pub description: String,
    pub retryable: bool,
}

impl MessagingError {
    /// Build an error for a known condition; retryability follows the table.
    pub fn new(condition: ErrorCondition, description: impl Into<String>) -> Self {
        let retryable = condition.is_retryable();
        Self {
            condition,
            description: description.into(),
            retryable,
        }
    }

    /// Build an error from a raw AMQP condition string.
    pub fn from_amqp(condition: &str, description: impl Into<String>) -> Self {
        Self::new(ErrorCondition::from_condition(condition), description)
    }

    pub const fn classify(&self) -> SessionErrorClass {
        self.condition.classify()
    }
}
