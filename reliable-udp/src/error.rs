//! Error types for the ARQ engines and the connection layer.
//!
//! Corruption and loss never surface here: they are absorbed by the protocol
//! machinery (duplicate ACKs, retransmission).  What remains are conditions a
//! caller must react to.

use thiserror::Error;

use crate::socket::SocketError;
use crate::state::ConnectionState;

/// Failures reported by the Go-Back-N and Selective-Repeat engines.
#[derive(Debug, Error)]
pub enum ArqError {
    /// GBN gave up after re-sending the window more than the configured
    /// number of times.  The transfer is aborted.
    #[error("retransmission limit of {limit} exceeded at base seq {base}")]
    RetriesExhausted { base: u32, limit: u32 },

    /// The engine was closed while the call was in progress.
    #[error("engine stopped")]
    Stopped,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Failures reported by [`crate::connection::Connection`] and
/// [`crate::listener::Listener`].
#[derive(Debug, Error)]
pub enum ConnError {
    /// The operation is not legal in the connection's current state.
    #[error("cannot {op} in state {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// The three-way handshake did not complete within the bounded wait.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The connection (or listener) has been torn down.
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Socket(#[from] SocketError),
}
