//! Error types shared by the client, the server and the wire codec

use std::io;

use crate::protocol::Command;

/// Every failure the protocol core can report.
///
/// `Framing`, `Connection` and `Disconnected` are communication failures: the
/// byte stream can no longer be trusted and the connection must be closed.
/// Everything else is a per-command failure that leaves the connection usable.
#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    /// Malformed, oversized or truncated control message
    #[error("Malformed frame: {0}")]
    Framing(String),

    /// Socket read/write failed, came up short or hit its deadline
    #[error("Connection error: {0}")]
    Connection(String),

    /// Peer closed the connection between two frames
    #[error("Connection closed by peer")]
    Disconnected,

    /// Resolved path lies outside the confinement root
    #[error("Access denied: path escapes root")]
    AccessDenied,

    /// Named entry is missing; the payload says what kind of entry was expected
    #[error("{0} does not exist")]
    NotFound(&'static str),

    #[error("Path is not a directory")]
    NotADirectory,

    #[error("Path is not a regular file")]
    NotARegularFile,

    #[error("Directory already exists")]
    AlreadyExists,

    #[error("Invalid filename: {0}")]
    InvalidName(&'static str),

    /// Response tag does not match the request tag
    #[error("Protocol violation: expected {expected} response, got {actual}")]
    ProtocolViolation { expected: Command, actual: Command },

    /// Error payload returned by the server (without the `Error: ` prefix)
    #[error("{0}")]
    Remote(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FtpError {
    /// True when the connection is desynchronized or gone and must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FtpError::Framing(_) | FtpError::Connection(_) | FtpError::Disconnected
        )
    }

    /// Wrap a socket-level I/O error. Socket failures are always fatal, so they
    /// must not land in the `Io` variant reserved for local files.
    pub fn connection(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                FtpError::Connection("peer closed connection mid-transfer".to_string())
            }
            _ => FtpError::Connection(e.to_string()),
        }
    }
}

pub type Result<T, E = FtpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FtpError::Framing("x".into()).is_fatal());
        assert!(FtpError::Connection("x".into()).is_fatal());
        assert!(FtpError::Disconnected.is_fatal());
        assert!(!FtpError::AccessDenied.is_fatal());
        assert!(!FtpError::NotFound("File").is_fatal());
        assert!(!FtpError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_fatal());
        assert!(!FtpError::ProtocolViolation {
            expected: Command::Cd,
            actual: Command::List
        }
        .is_fatal());
    }

    #[test]
    fn test_messages_match_wire_texts() {
        assert_eq!(
            FtpError::InvalidName("Cannot contain path separators").to_string(),
            "Invalid filename: Cannot contain path separators"
        );
        assert_eq!(FtpError::NotFound("File").to_string(), "File does not exist");
        assert_eq!(FtpError::AlreadyExists.to_string(), "Directory already exists");
        assert_eq!(
            FtpError::ProtocolViolation {
                expected: Command::Mkdir,
                actual: Command::List
            }
            .to_string(),
            "Protocol violation: expected MKDIR response, got LIST"
        );
    }

    #[test]
    fn test_socket_eof_is_connection_error() {
        let e = FtpError::connection(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(e, FtpError::Connection(_)));
        assert!(e.is_fatal());
    }
}
