use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type. Each variant maps to one failure kind; everything
/// below `NoProxyAvailable` is local to a single candidate, (proxy, scheme)
/// attempt or judge probe and never aborts the pipeline as a whole.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to resolve host {host}")]
    Resolve { host: String },

    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("{proto} handshake failed: {reason}")]
    Handshake { proto: &'static str, reason: String },

    #[error("judge {url} unusable: {reason}")]
    Judge { url: String, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no proxy available within {0:?}")]
    NoProxyAvailable(Duration),

    #[error("{0}")]
    FatalConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn handshake(proto: &'static str, reason: impl Into<String>) -> Self {
        Error::Handshake {
            proto,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
