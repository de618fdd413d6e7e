//! Client connection state machine.
//!
//! Each simulated client exclusively owns one TCP stream and moves through:
//!
//! ```text
//! Unconnected --connect--> Connected --echo_round--> Active
//!      |                       |                       |
//!      +--------error----------+--------error----------+--> Failed
//!                              |                       |
//!                              +--------close----------+--> Closed
//! ```
//!
//! Any I/O or validation failure moves the client to `Failed` and releases
//! the stream. Nothing is retried: echo correctness is what the harness is
//! testing.

use crate::error::ClientError;
use crate::frame::{self, FrameError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Current state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, no stream yet.
    Unconnected,
    /// Stream established (and handshake passed, if enabled).
    Connected,
    /// Driving echo rounds.
    Active,
    /// Shut down by the controller.
    Closed,
    /// An operation failed; the stream has been released.
    Failed,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Unconnected => "Unconnected",
            ClientState::Connected => "Connected",
            ClientState::Active => "Active",
            ClientState::Closed => "Closed",
            ClientState::Failed => "Failed",
        }
    }
}

/// Per-client connection settings.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Payload echoed once before the connection counts as usable.
    pub handshake: Option<Bytes>,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Deadline for a single echo round.
    pub io_timeout: Option<Duration>,
}

/// One simulated client.
#[derive(Debug)]
pub struct EchoClient {
    id: usize,
    addr: SocketAddr,
    options: ClientOptions,
    state: ClientState,
    stream: Option<TcpStream>,
    bytes_sent: u64,
    rounds: u64,
}

impl EchoClient {
    /// Create an unconnected client for `addr`.
    pub fn new(id: usize, addr: SocketAddr, options: ClientOptions) -> Self {
        Self {
            id,
            addr,
            options,
            state: ClientState::Unconnected,
            stream: None,
            bytes_sent: 0,
            rounds: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Frame bytes flushed since the last counter reset.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Echo rounds completed since the last counter reset.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Whether the client holds a live stream.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ClientState::Connected | ClientState::Active)
    }

    /// Reset per-phase counters.
    pub fn reset_counters(&mut self) {
        self.bytes_sent = 0;
        self.rounds = 0;
    }

    /// Open the stream and optionally verify the server with a handshake echo.
    ///
    /// Returns the join latency: initiation to TCP establishment. The
    /// handshake round is not part of it and its bytes are not counted.
    pub async fn connect(&mut self) -> Result<Duration, ClientError> {
        if self.state != ClientState::Unconnected {
            return Err(ClientError::InvalidState(self.state.name()));
        }

        let start = Instant::now();
        let connected = match self.options.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(self.addr)).await
            {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no connection after {:.3}s", limit.as_secs_f64()),
                )),
            },
            None => TcpStream::connect(self.addr).await,
        };
        let join_latency = start.elapsed();

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ClientState::Failed;
                return Err(ClientError::Connect(e));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            self.state = ClientState::Failed;
            return Err(ClientError::Connect(e));
        }

        self.stream = Some(stream);
        self.state = ClientState::Connected;

        if let Some(hello) = self.options.handshake.clone() {
            if let Err(e) = self.timed_exchange(&hello).await {
                debug!(client = self.id, error = %e, "Handshake failed");
                self.fail();
                return Err(e);
            }
        }

        trace!(client = self.id, latency = ?join_latency, "Connected");
        Ok(join_latency)
    }

    /// Send `payload`, wait for the echo and validate it.
    ///
    /// Returns the message latency: write flushed to response fully read.
    pub async fn echo_round(&mut self, payload: &[u8]) -> Result<Duration, ClientError> {
        if !self.is_open() {
            return Err(ClientError::InvalidState(self.state.name()));
        }
        self.state = ClientState::Active;

        match self.timed_exchange(payload).await {
            Ok(latency) => {
                self.bytes_sent += frame::frame_len(payload.len()) as u64;
                self.rounds += 1;
                Ok(latency)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Shut the stream down.
    ///
    /// Only a Connected or Active client owns a stream; calling this in any
    /// other state, including repeatedly, does nothing.
    pub async fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(client = self.id, error = %e, "Shutdown error");
            }
        }
        self.state = ClientState::Closed;
    }

    fn fail(&mut self) {
        self.stream = None;
        self.state = ClientState::Failed;
    }

    async fn timed_exchange(&mut self, payload: &[u8]) -> Result<Duration, ClientError> {
        match self.options.io_timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(payload))
                .await
                .unwrap_or(Err(ClientError::Timeout {
                    op: "echo round",
                    after: limit,
                })),
            None => self.exchange(payload).await,
        }
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Duration, ClientError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(ClientError::InvalidState("Unconnected"))?;

        let request = frame::encode(payload)?;
        stream
            .write_all(&request)
            .await
            .map_err(ClientError::Write)?;
        stream.flush().await.map_err(ClientError::Write)?;

        let start = Instant::now();
        let echoed = match frame::decode(stream, payload.len()).await {
            Ok(Some(echoed)) => echoed,
            Ok(None) => {
                return Err(ClientError::Protocol(FrameError::Truncated {
                    expected: frame::HEADER_LEN,
                    received: 0,
                }))
            }
            Err(FrameError::Oversized { declared, .. }) => {
                return Err(ClientError::EchoMismatch {
                    expected_len: payload.len(),
                    actual_len: declared,
                    offset: None,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let latency = start.elapsed();

        if echoed.len() != payload.len() {
            return Err(ClientError::EchoMismatch {
                expected_len: payload.len(),
                actual_len: echoed.len(),
                offset: None,
            });
        }
        if let Some(offset) = first_difference(payload, &echoed) {
            return Err(ClientError::EchoMismatch {
                expected_len: payload.len(),
                actual_len: echoed.len(),
                offset: Some(offset),
            });
        }

        Ok(latency)
    }
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
}
