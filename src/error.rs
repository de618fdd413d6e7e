//! Error types for client connections and whole runs.

use crate::frame::FrameError;
use std::time::Duration;

/// Failure of a single client connection.
///
/// Every kind moves the connection to `Failed`; none is retried.
#[derive(Debug)]
pub enum ClientError {
    /// Could not establish the transport connection.
    Connect(std::io::Error),
    /// A read ended early or the peer closed mid-exchange.
    Protocol(FrameError),
    /// The echoed frame differs from what was sent.
    EchoMismatch {
        expected_len: usize,
        actual_len: usize,
        /// First differing payload offset, when lengths agree.
        offset: Option<usize>,
    },
    /// Could not fully flush an outgoing frame.
    Write(std::io::Error),
    /// An operation exceeded its configured deadline.
    Timeout { op: &'static str, after: Duration },
    /// Operation issued in a state that does not allow it.
    InvalidState(&'static str),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect failed: {e}"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
            ClientError::EchoMismatch {
                expected_len,
                actual_len,
                offset: Some(offset),
            } => write!(
                f,
                "echo mismatch: {actual_len}/{expected_len} bytes, first difference at offset {offset}"
            ),
            ClientError::EchoMismatch {
                expected_len,
                actual_len,
                offset: None,
            } => write!(
                f,
                "echo mismatch: expected length {expected_len}, got length {actual_len}"
            ),
            ClientError::Write(e) => write!(f, "write failed: {e}"),
            ClientError::Timeout { op, after } => {
                write!(f, "{op} timed out after {:.3}s", after.as_secs_f64())
            }
            ClientError::InvalidState(state) => {
                write!(f, "operation not allowed in state {state}")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Run-level failure reported by a controller.
#[derive(Debug)]
pub enum RunError {
    /// The fixed client pool could not be established.
    PoolEstablish { connected: usize, error: ClientError },
    /// A client failed while driving echo rounds.
    Echo { clients: usize, error: ClientError },
    /// Samples or summaries could not be persisted.
    Output(std::io::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::PoolEstablish { connected, error } => write!(
                f,
                "client pool failed after {connected} connections: {error}"
            ),
            RunError::Echo { clients, error } => {
                write!(f, "echo failed with {clients} clients: {error}")
            }
            RunError::Output(e) => write!(f, "failed to write results: {e}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Output(e)
    }
}
