use std::sync::Arc;

use b2_protocol::{Method, ProtocolError};
use thiserror::Error;

/// Errors surfaced to callers.
///
/// Transient failures never reach this type; they are consumed by the retry
/// layer. The enum is cheap to clone so an idempotent `close` can park its
/// result and hand out the same value on every call.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// A terminal answer from the service, verbatim.
    #[error("{method}: {message} (status {status})")]
    Api {
        method: Method,
        status: u16,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resume: {0}")]
    Resume(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("i/o: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// The named entity does not exist server-side.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Api { status: 404, .. })
    }

    /// A bucket update lost an optimistic-concurrency race.
    pub fn is_update_conflict(&self) -> bool {
        matches!(self, Error::Api { status: 409, .. })
    }

    /// The account is over its storage cap.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::Api { status: 403, .. })
    }

    /// The credentials do not permit the operation.
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, Error::Api { status: 401, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Api {
                method,
                status,
                message,
                ..
            } => Error::Api {
                method,
                status,
                message,
            },
            ProtocolError::Transport(e) => Error::Transport(e.to_string()),
            ProtocolError::Stream(e) => Error::Io(Arc::new(e)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
