//! Error types for the stellator engine

use std::io;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or driving the engine
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed (`epoll_create1`, `eventfd`, `pipe2`, ...)
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Listening socket setup failed (create, bind, listen, nonblock)
    #[error("listening socket {op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Installing signal dispositions or masks failed
    #[error("signal setup ({op}) failed: {source}")]
    Signal {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The root scheduler has no running connection queue
    #[error("root is not running")]
    NotRunning,

    /// `Root::run` was called while already running
    #[error("root is already running")]
    AlreadyRunning,

    /// Failed to spawn a worker thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

impl Error {
    /// Build a `Sys` error from the calling thread's `errno`.
    pub fn last_os(op: &'static str) -> Self {
        Error::Sys {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Build a `Socket` error for the given setup step.
    pub fn socket(op: &'static str, source: io::Error) -> Self {
        Error::Socket { op, source }
    }

    /// The raw OS error code, if this error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Sys { source, .. }
            | Error::Socket { source, .. }
            | Error::Signal { source, .. }
            | Error::Spawn(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    #[error("invalid listen address: {0:?}")]
    InvalidAddress(String),
}
