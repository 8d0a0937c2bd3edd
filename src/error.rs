//! Error kinds shared by the client, the worker, and the wire protocol.

use thiserror::Error;

/// Errors that can abort a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad invocation or option combination.
    #[error("usage: {0}")]
    Usage(String),

    /// I/O on a local file or directory.
    #[error("local I/O: {0}")]
    LocalIo(#[from] std::io::Error),

    /// The transport socket died or was closed by the peer.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// Framing, tag, length, or compression-bracket violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by the remote worker.
    #[error("remote error: {0}")]
    Remote(String),

    /// Cooperative cancellation was requested.
    #[error("cancelled")]
    Cancelled,

    /// No free resource (e.g. loopback ports) within the retry budget.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bounded wait (connection establishment) expired.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Stable wire code carried in an `Error` frame.
    pub fn wire_code(&self) -> u16 {
        match self {
            SyncError::Usage(_) => 1,
            SyncError::LocalIo(_) => 2,
            SyncError::TransportLost(_) => 3,
            SyncError::Protocol(_) => 4,
            SyncError::Remote(_) => 5,
            SyncError::Cancelled => 6,
            SyncError::ResourceExhausted(_) => 7,
            SyncError::DeadlineExceeded(_) => 8,
        }
    }

    /// Name used when surfacing a peer-reported kind to the user.
    pub fn wire_code_name(code: u16) -> &'static str {
        match code {
            1 => "usage",
            2 => "local I/O",
            3 => "transport lost",
            4 => "protocol error",
            5 => "remote error",
            6 => "cancelled",
            7 => "resource exhausted",
            8 => "deadline exceeded",
            _ => "unknown",
        }
    }

    /// Process exit code for the client binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Usage(_) => 2,
            SyncError::TransportLost(_) | SyncError::DeadlineExceeded(_) => 10,
            SyncError::Remote(_) => 11,
            SyncError::Cancelled => 12,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_error_kinds() {
        assert_eq!(SyncError::Usage("x".into()).exit_code(), 2);
        assert_eq!(SyncError::TransportLost("x".into()).exit_code(), 10);
        assert_eq!(SyncError::DeadlineExceeded("x".into()).exit_code(), 10);
        assert_eq!(SyncError::Remote("x".into()).exit_code(), 11);
        assert_eq!(SyncError::Cancelled.exit_code(), 12);
        assert_eq!(SyncError::Protocol("x".into()).exit_code(), 1);
    }

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(SyncError::Usage("".into()).wire_code(), 1);
        assert_eq!(SyncError::Cancelled.wire_code(), 6);
        assert_eq!(SyncError::wire_code_name(4), "protocol error");
        assert_eq!(SyncError::wire_code_name(99), "unknown");
    }
}
