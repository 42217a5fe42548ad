// ABOUTME: Unified error type for session, stream, and codec operations
// ABOUTME: Also defines the terminal-state payload latched once a session dies

use std::sync::Arc;
use thiserror::Error;

/// Error returned by session and stream operations.
///
/// Fatal variants (`InvalidProtocol`, `Consumed`, `Io`) latch the session into its terminal
/// state; non-fatal variants (`GoAway`, `Timeout`, `WouldBlock`, `ClosedPipe`) are returned
/// to the caller without affecting session state.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Version mismatch or unknown command byte on the wire.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// Peer reported more consumed bytes than we have sent.
    #[error("peer consumed {consumed} bytes but only {sent} were sent")]
    Consumed { consumed: u32, sent: u32 },

    /// Local stream-id space is exhausted.
    #[error("stream id space exhausted, session is going away")]
    GoAway,

    /// A deadline expired before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// A non-blocking operation could not make progress immediately.
    #[error("operation would block")]
    WouldBlock,

    /// The session has already been closed.
    #[error("session is closed")]
    ClosedPipe,

    /// Underlying transport I/O error.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Mirrors the "temporary timeout" marker mentioned in the spec so callers can treat
    /// timeouts as non-fatal without matching on the full enum.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_closed_pipe(&self) -> bool {
        matches!(self, Error::ClosedPipe)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The reason a session reached its terminal state.
///
/// Collapses the spec's four independent one-shot latches (session-closed,
/// socket-read-error, socket-write-error, protocol-error) into a single set-once
/// enum, per DESIGN NOTES §9.
#[derive(Debug, Clone)]
pub enum TerminalState {
    /// `Session::close` was called.
    Closed,
    /// The receiver task hit a fatal transport read error.
    ReadError(Arc<std::io::Error>),
    /// The sender task hit a fatal transport write error.
    WriteError(Arc<std::io::Error>),
    /// A protocol violation was detected (bad version, unknown command, bad `consumed`).
    Protocol(Error),
}

impl TerminalState {
    /// The error value every blocking operation should surface once this state is observed.
    pub fn as_error(&self) -> Error {
        match self {
            TerminalState::Closed => Error::ClosedPipe,
            TerminalState::ReadError(e) => Error::Io(e.clone()),
            TerminalState::WriteError(e) => Error::Io(e.clone()),
            TerminalState::Protocol(e) => e.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_marker() {
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::GoAway.is_timeout());
    }

    #[test]
    fn terminal_state_surfaces_stored_error() {
        let io_err = Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let state = TerminalState::ReadError(io_err);
        assert!(matches!(state.as_error(), Error::Io(_)));

        assert!(matches!(TerminalState::Closed.as_error(), Error::ClosedPipe));
    }

    #[test]
    fn consumed_exceeding_sent_is_protocol_error() {
        let e = Error::Consumed {
            consumed: 10,
            sent: 5,
        };
        assert!(e.to_string().contains("10"));
    }
}
