//! Error types of the dispatch engine.

use thiserror::Error;

/// # Errors produced by channels and subscribers.
///
/// Callback failures carry the position of the
/// failing callback in the dispatch-ordered result
/// list, so the caller can tell which one failed.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The channel was closed (or dropped) before
    /// the operation was issued.
    #[error("channel is closed")]
    Closed,

    /// The subscriber already lost all of its
    /// callbacks and was torn down.
    #[error("subscription has no callbacks left")]
    InvalidSubscription,

    /// A callback returned an error.
    #[error("callback at position {position} failed: {source}")]
    Callback {
        /// Index of the callback in the result list.
        position: usize,
        /// The error returned by the callback.
        #[source]
        source: anyhow::Error,
    },

    /// A deferred callback was discarded by its
    /// executor before it could run.
    #[error("deferred callback at position {position} was dropped unrun")]
    Dropped {
        /// Index of the callback in the result list.
        position: usize,
    },
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Closed => "channel_closed",
            Error::InvalidSubscription => "invalid_subscription",
            Error::Callback { .. } => "callback_failed",
            Error::Dropped { .. } => "callback_dropped",
        }
    }
}

/// Result type of the dispatch engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;
