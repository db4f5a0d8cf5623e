//! Error types for the gateway

use std::io;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("empty password")]
    EmptyPassword,

    #[error("unsupported cipher method: {0}")]
    UnknownCipher(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("address too long")]
    AddressTooLong,

    #[error("short buffer")]
    ShortBuffer,

    #[error("AEAD open failed")]
    AeadOpen,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn bad_address<S: Into<String>>(msg: S) -> Self {
        Error::BadAddress(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut, e))
    }
}

/// Whether an I/O error is the normal teardown of a socket the other side
/// (or our own relay) already closed. These are races, not faults.
pub fn is_closed_conn(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::UnknownCipher("rot13".to_string());
        assert_eq!(e.to_string(), "unsupported cipher method: rot13");
    }

    #[test]
    fn test_closed_conn_predicate() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_closed_conn(&reset));
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!is_closed_conn(&refused));
    }
}
