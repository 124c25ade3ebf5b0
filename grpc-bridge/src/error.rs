//! Error types and gRPC status conversion

use thiserror::Error;

use crate::status::{default_error_transformer, StatusKind};

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bridge
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error raised by the tonic server
    #[error("Transport error: {0}")]
    Transport(Box<tonic::transport::Error>),

    /// An error that already carries a gRPC status
    #[error("RPC error: {0}")]
    Rpc(Box<tonic::Status>),

    /// An error that carries an HTTP-like status code
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code (e.g. 404)
        status: u16,
        /// Human-readable message
        message: String,
    },

    /// An error classified by the generic status taxonomy
    #[error("{kind}: {message}")]
    Status {
        /// Generic status
        kind: StatusKind,
        /// Human-readable message
        message: String,
    },

    /// The request context for a call could not be established
    #[error("Request context could not be established: {0}")]
    Context(String),

    /// A call descriptor could not be built
    #[error("Invalid call descriptor: {0}")]
    InvalidDescriptor(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build an error from the generic status taxonomy
    pub fn status(kind: StatusKind, message: impl Into<String>) -> Self {
        Self::Status {
            kind,
            message: message.into(),
        }
    }

    /// Build an error carrying an HTTP-like status code
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc(Box::new(status))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        default_error_transformer(&err)
    }
}
