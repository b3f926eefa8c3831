use std::time::Duration;

use dog_tenancy::ContextMisuseError;
use thiserror::Error;

/// What a message handler reports back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth redelivering later
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Redelivery would fail the same way
    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error(transparent)]
    Misuse(#[from] ContextMisuseError),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// How a handler invocation ended when it did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerFailure {
    #[error("handler failed: {0}")]
    Error(HandlerError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("unit of work cancelled during handler execution")]
    Cancelled,

    #[error("handler exceeded {0:?}")]
    TimedOut(Duration),
}

impl HandlerFailure {
    /// Cancellation, timeouts and retryable errors may succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Error(err) => err.is_retryable(),
            Self::Cancelled | Self::TimedOut(_) => true,
            Self::Panicked(_) => false,
        }
    }
}

/// Consumer pool failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("Consumer is shut down")]
    ShutDown,

    #[error("Consumer join error: {0}")]
    Join(String),
}
