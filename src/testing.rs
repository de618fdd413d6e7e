//! Scripted loopback servers for tests.

use crate::frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How a scripted server treats its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Mirror every frame.
    Echo,
    /// Mirror frames, but flip the first payload byte on the connection
    /// with this accept index.
    FlipConnection(usize),
    /// Reply with a frame one byte shorter than the request.
    Truncate,
    /// Read requests and never answer.
    Silent,
    /// Close every connection right after accepting it.
    Hangup,
    /// Echo on the first `n` connections, then stop listening.
    AcceptLimit(usize),
}

/// Handle to a running scripted server.
pub struct TestServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections whose client side has gone away.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_accepted(&self, n: usize) {
        wait_for(|| self.accepted() >= n).await;
    }

    pub async fn wait_closed(&self, n: usize) {
        wait_for(|| self.closed() >= n).await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Loopback address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start a scripted server on an ephemeral loopback port.
pub async fn spawn_server(behavior: Behavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let task = {
        let accepted = Arc::clone(&accepted);
        let closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let mut handlers = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let closed = Arc::clone(&closed);
                handlers.push(tokio::spawn(async move {
                    handle(stream, behavior, index).await;
                    closed.fetch_add(1, Ordering::SeqCst);
                }));

                if let Behavior::AcceptLimit(limit) = behavior {
                    if index + 1 >= limit {
                        // Later connects are refused
                        drop(listener);
                        break;
                    }
                }
            }
            // Keep handlers alive until the server itself is dropped
            for handler in handlers {
                let _ = handler.await;
            }
        })
    };

    TestServer {
        addr,
        accepted,
        closed,
        task,
    }
}

async fn handle(mut stream: TcpStream, behavior: Behavior, index: usize) {
    if behavior == Behavior::Hangup {
        return;
    }

    // Anything other than a clean frame ends the connection
    while let Ok(Some(payload)) = frame::decode(&mut stream, usize::MAX).await {
        let mut body = payload.to_vec();
        let reply = match behavior {
            Behavior::Silent => continue,
            Behavior::FlipConnection(target) if target == index && !body.is_empty() => {
                body[0] ^= 0x01;
                frame::encode(&body)
            }
            Behavior::Truncate => {
                body.pop();
                frame::encode(&body)
            }
            _ => frame::encode(&body),
        };
        let Ok(reply) = reply else { return };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}
