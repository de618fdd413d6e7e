//! Batch barrier.
//!
//! A batch is a group of clients issued together. Every member's operation
//! runs concurrently, and the helpers here only return once every member
//! has resolved, so a controller can never start batch `k + 1` while batch
//! `k` still has members in flight.

use crate::client::{ClientOptions, EchoClient};
use crate::control::StopLatch;
use crate::error::ClientError;
use crate::sink::Recorder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

/// Resolved connect attempts for one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Clients that connected, in id order.
    pub connected: Vec<EchoClient>,
    /// Errors of the clients that did not.
    pub failures: Vec<ClientError>,
}

/// Connect `size` fresh clients with ids starting at `first_id`.
///
/// A join latency is recorded for each successful connect only.
pub async fn connect_batch(
    first_id: usize,
    size: usize,
    addr: SocketAddr,
    options: &ClientOptions,
    recorder: &Recorder,
) -> BatchOutcome {
    let mut set = JoinSet::new();
    for id in first_id..first_id + size {
        let mut client = EchoClient::new(id, addr, options.clone());
        let recorder = recorder.clone();
        set.spawn(async move {
            let result = client.connect().await;
            if let Ok(latency) = &result {
                recorder.join(*latency);
            }
            (client, result.err())
        });
    }

    let mut outcome = BatchOutcome::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((client, None)) => outcome.connected.push(client),
            Ok((client, Some(error))) => {
                debug!(client = client.id(), state = ?client.state(), error = %error, "Connect failed");
                outcome.failures.push(error);
            }
            Err(e) => propagate_panic(e),
        }
    }
    outcome.connected.sort_by_key(EchoClient::id);
    outcome
}

/// Result of establishing a fixed pool.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    /// Clients that connected, in id order.
    pub clients: Vec<EchoClient>,
    /// First error of the batch that stopped establishment.
    pub failure: Option<ClientError>,
}

/// Connect up to `target` clients in barrier-synchronized batches.
///
/// Stops after the first batch with a failed member, or before the next
/// batch once `stop` is set. Members of the failed batch that did connect
/// are kept in the outcome so the caller can close them.
pub async fn establish_pool(
    target: usize,
    batch_size: usize,
    addr: SocketAddr,
    options: &ClientOptions,
    recorder: &Recorder,
    stop: &StopLatch,
) -> PoolOutcome {
    let mut pool = PoolOutcome {
        clients: Vec::with_capacity(target),
        failure: None,
    };

    while pool.clients.len() < target {
        if stop.is_stopped() {
            debug!(clients = pool.clients.len(), "Pool establishment interrupted");
            break;
        }
        let size = batch_size.max(1).min(target - pool.clients.len());
        let resolved = connect_batch(pool.clients.len(), size, addr, options, recorder).await;
        pool.clients.extend(resolved.connected);

        if let Some(error) = resolved.failures.into_iter().next() {
            pool.failure = Some(error);
            break;
        }
        debug!(clients = pool.clients.len(), "Batch joined");
    }
    pool
}

/// Close every client in one concurrent batch.
pub async fn close_batch(clients: Vec<EchoClient>) -> usize {
    let mut set = JoinSet::new();
    for mut client in clients {
        set.spawn(async move {
            let open = client.is_open();
            client.close().await;
            open
        });
    }

    let mut closed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(true) => closed += 1,
            Ok(false) => {}
            Err(e) => propagate_panic(e),
        }
    }
    closed
}

/// Close `clients` in batches of `batch_size`, pausing between batches.
///
/// Returns the number of clients that held an open stream.
pub async fn close_all(clients: Vec<EchoClient>, batch_size: usize, pause: Duration) -> usize {
    let mut remaining = clients.into_iter().peekable();
    let mut closed = 0;

    while remaining.peek().is_some() {
        let batch: Vec<EchoClient> = remaining.by_ref().take(batch_size.max(1)).collect();
        closed += close_batch(batch).await;
        if remaining.peek().is_some() && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    closed
}

/// Re-raise a panic from a client task; tasks are never aborted.
pub(crate) fn propagate_panic(e: JoinError) {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
}
