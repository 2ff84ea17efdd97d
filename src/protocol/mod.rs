pub mod gateway;
pub mod rcon;

use thiserror::Error;

/// Remote console transport / protocol failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ProtocolError {
    /// Classifies an I/O error from a socket with read/write timeouts set.
    pub(crate) fn from_io(context: &str, e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout(format!("{}: {}", context, e)),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Connection(format!("{}: {}", context, e)),
            _ => Self::Protocol(format!("{}: {}", context, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_classification() {
        let timeout = ProtocolError::from_io("read", io::Error::new(io::ErrorKind::WouldBlock, "slow"));
        assert!(matches!(timeout, ProtocolError::Timeout(_)));

        let reset = ProtocolError::from_io("read", io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(reset, ProtocolError::Connection(_)));

        let other = ProtocolError::from_io("read", io::Error::new(io::ErrorKind::InvalidData, "bad"));
        assert_eq!(other.to_string(), "Protocol error: read: bad");
    }
}
