//! Error types for Gantry

use std::io;
use thiserror::Error;

/// Result type alias using Gantry's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for worker-level operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Shared heartbeat could not be set up
    #[error("heartbeat error: {0}")]
    Heartbeat(String),

    /// Accept failed with an error outside the retryable set
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Async runtime could not be built or driven
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Check if this error is a fatal accept failure
    pub fn is_accept_error(&self) -> bool {
        matches!(self, Error::Accept(_))
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(io::Error::from_raw_os_error(err as i32))
    }
}

/// Why a single request cycle stopped short of a normal completion.
///
/// Call sites branch on the variant instead of on error types: the first
/// three are benign and never reach the error reporter.
#[derive(Error, Debug)]
pub enum CycleError {
    /// Peer closed the stream before a request was read
    #[error("stream ended before a request was received")]
    StreamEnded,

    /// Peer went away while the response was being written
    #[error("peer disconnected: {0}")]
    PeerReset(#[source] io::Error),

    /// Task was cancelled cooperatively
    #[error("request cancelled")]
    Cancelled,

    /// Idle connection exceeded the keep-alive window
    #[error("timed out waiting for request")]
    Timeout,

    /// Malformed request
    #[error("invalid request: {0}")]
    Parse(String),

    /// Hosted application or hook failed
    #[error("application error: {0}")]
    Application(String),

    /// Any other socket error
    #[error("socket error: {0}")]
    Io(#[source] io::Error),
}

impl CycleError {
    /// Classify a raw IO error from the connection
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                CycleError::PeerReset(err)
            }
            io::ErrorKind::UnexpectedEof => CycleError::StreamEnded,
            _ => CycleError::Io(err),
        }
    }

    /// Check if this outcome should end the connection without any error report
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CycleError::StreamEnded
                | CycleError::PeerReset(_)
                | CycleError::Cancelled
                | CycleError::Timeout
        )
    }

    /// Check if this is a socket-level failure
    pub fn is_socket_error(&self) -> bool {
        matches!(self, CycleError::PeerReset(_) | CycleError::Io(_))
    }
}

impl From<io::Error> for CycleError {
    fn from(err: io::Error) -> Self {
        CycleError::from_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let err = CycleError::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, CycleError::PeerReset(_)));

        let err = CycleError::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, CycleError::PeerReset(_)));

        let err = CycleError::from_io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, CycleError::StreamEnded));

        let err = CycleError::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, CycleError::Io(_)));
    }

    #[test]
    fn test_benign_errors() {
        assert!(CycleError::StreamEnded.is_benign());
        assert!(CycleError::Cancelled.is_benign());
        assert!(CycleError::Timeout.is_benign());
        assert!(!CycleError::Parse("bad".into()).is_benign());
        assert!(!CycleError::Application("boom".into()).is_benign());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::Configuration("missing bind".to_string());
        assert_eq!(err.to_string(), "configuration error: missing bind");

        let err = Error::Accept(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.is_accept_error());
    }

    #[test]
    fn test_nix_error_conversion() {
        let err: Error = nix::Error::EBADF.into();
        match err {
            Error::Io(io) => assert_eq!(io.raw_os_error(), Some(nix::libc::EBADF)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
