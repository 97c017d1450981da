use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for query event operations.
pub type QueryEventResult<T> = Result<T, QueryEventError>;

/// Errors returned while subscribing to or handling query events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueryEventError {
    /// The notification carried no statement text. Only the offending
    /// notification is affected.
    #[error("query event from {0:?} is missing its statement")]
    MissingStatement(String),

    /// A time unit name that is not one of `native`, `microsecond`,
    /// `millisecond` or `second`.
    #[error("unsupported time unit {0:?}")]
    UnsupportedTimeUnit(String),

    /// A handler is already registered for the channel.
    #[error("a handler is already attached to channel {0:?}")]
    AlreadyAttached(String),

    /// The handle does not refer to a registered handler.
    #[error("no handler is attached to channel {0:?}")]
    NotAttached(String),

    /// Other errors not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for QueryEventError {
    fn from(err: PoisonError<T>) -> Self {
        QueryEventError::Other(format!("subscription registry lock poisoned: {err}"))
    }
}
