//! Error types for the client core.
//!
//! The taxonomy follows the propagation policy: an error is fatal to the
//! link, to a single circuit, or to a single stream, and teardown cascades
//! downward from that scope. Protocol errors never panic.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// How far an error propagates when it occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Tear down the link and everything beneath it.
    Link,
    /// Tear down the owning circuit and its streams.
    Circuit,
    /// Close the affected stream only.
    Stream,
    /// Recovered in place; nothing is torn down.
    Caller,
}

/// Main error type for the client core.
#[derive(Error, Debug, Clone)]
pub enum TorError {
    /// Malformed cell framing. Fatal to the link.
    #[error("invalid cell: {0}")]
    Cell(String),

    /// Link- or circuit-handshake protocol violation, including an ntor
    /// AUTH mismatch. Fatal to the owning scope.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Inbound relay-cell digest mismatch, or a nonzero recognized field on
    /// a one-hop circuit. Fatal to the circuit.
    #[error("relay digest mismatch")]
    Digest,

    /// Caller operated on a stream that is already closed.
    #[error("stream {0} is closed")]
    StreamClosed(u16),

    /// Package window is empty. Internal signal only: the cell is queued
    /// until a SENDME replenishes the window, and this never crosses the
    /// public surface.
    #[error("send window exhausted")]
    WindowExhausted,

    /// TLS or socket fault. Fatal to the link.
    #[error("transport error: {0}")]
    Transport(String),

    /// Bug guard for states the protocol cannot reach.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// The scope this error tears down.
    pub fn scope(&self) -> ErrorScope {
        match self {
            TorError::Cell(_) => ErrorScope::Link,
            TorError::Handshake(_) => ErrorScope::Circuit,
            TorError::Digest => ErrorScope::Circuit,
            TorError::StreamClosed(_) => ErrorScope::Caller,
            TorError::WindowExhausted => ErrorScope::Caller,
            TorError::Transport(_) => ErrorScope::Link,
            TorError::Internal(_) => ErrorScope::Link,
        }
    }
}

impl From<std::io::Error> for TorError {
    fn from(e: std::io::Error) -> Self {
        TorError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_classification() {
        assert_eq!(TorError::Cell("bad".into()).scope(), ErrorScope::Link);
        assert_eq!(TorError::Digest.scope(), ErrorScope::Circuit);
        assert_eq!(TorError::StreamClosed(4).scope(), ErrorScope::Caller);
        assert_eq!(
            TorError::Transport("reset".into()).scope(),
            ErrorScope::Link
        );
    }
}
