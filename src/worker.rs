//! Per-client echo loop.
//!
//! One task per active client. The task owns its client for the whole
//! loop, reports latencies through a [`Recorder`] and failures through the
//! controller's failure channel, then hands the client back so the
//! controller can close it.

use crate::batch::propagate_panic;
use crate::client::EchoClient;
use crate::control::RunControl;
use crate::error::ClientError;
use crate::payload::{self, PayloadSize};
use crate::sink::Recorder;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// A client that stopped on an error.
#[derive(Debug)]
pub struct Failure {
    pub client: usize,
    pub error: ClientError,
}

/// Template for the echo loop; cloned into every client task.
#[derive(Debug, Clone)]
pub struct EchoLoop {
    pub payload: PayloadSize,
    /// Stop after this many rounds even if the run is still active.
    pub rounds: Option<u64>,
    pub control: RunControl,
    pub recorder: Recorder,
    pub failures: mpsc::UnboundedSender<Failure>,
}

impl EchoLoop {
    /// Drive `client` until the run flag clears, the round budget is spent,
    /// or a round fails.
    pub async fn run(self, mut client: EchoClient) -> EchoClient {
        let mut rng = StdRng::from_entropy();
        let mut buf = Vec::with_capacity(self.payload.max_len());
        let mut done = 0u64;

        while self.control.is_active() && self.rounds.map_or(true, |limit| done < limit) {
            let len = self.payload.sample(&mut rng);
            payload::fill(&mut rng, &mut buf, len);

            match client.echo_round(&buf).await {
                Ok(latency) => {
                    trace!(client = client.id(), len, ?latency, "Echo round");
                    self.recorder.message(latency);
                    done += 1;
                }
                Err(error) => {
                    debug!(client = client.id(), error = %error, "Echo round failed");
                    if let Err(unsent) = self.failures.send(Failure {
                        client: client.id(),
                        error,
                    }) {
                        debug!(
                            client = client.id(),
                            error = %unsent.0.error,
                            "Failure channel closed, dropping report"
                        );
                    }
                    break;
                }
            }
        }

        client
    }
}

/// Wait for every echo loop in `set` and hand the clients back.
///
/// The first reported failure clears the run flag so the other loops stop
/// after their current round. With a `deadline` the flag is also cleared
/// once it expires. A failure that lands after the last loop was joined is
/// still returned.
pub async fn join_all(
    mut set: JoinSet<EchoClient>,
    failures: &mut mpsc::UnboundedReceiver<Failure>,
    control: &RunControl,
    deadline: Option<Duration>,
) -> (Vec<EchoClient>, Option<Failure>) {
    let mut clients = Vec::with_capacity(set.len());
    let timer = tokio::time::sleep(deadline.unwrap_or(Duration::ZERO));
    tokio::pin!(timer);
    let mut timed = deadline.is_some();
    let mut first = None;

    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                Some(Ok(client)) => clients.push(client),
                Some(Err(e)) => propagate_panic(e),
                None => break,
            },
            _ = &mut timer, if timed => {
                timed = false;
                control.cancel();
            }
            Some(failure) = failures.recv(), if first.is_none() => {
                control.cancel();
                first = Some(failure);
            }
        }
    }

    if first.is_none() {
        first = failures.try_recv().ok();
    }
    clients.sort_by_key(EchoClient::id);
    (clients, first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientOptions, ClientState};
    use crate::sink::SampleSink;
    use crate::testing::{self, Behavior};

    #[tokio::test]
    async fn test_round_budget() {
        let server = testing::spawn_server(Behavior::Echo).await;
        let mut sink = SampleSink::new();
        let (failures, mut rx) = mpsc::unbounded_channel();
        let control = RunControl::new();
        control.activate();

        let mut client = EchoClient::new(0, server.addr, ClientOptions::default());
        client.connect().await.unwrap();

        let echo = EchoLoop {
            payload: PayloadSize::Fixed(100),
            rounds: Some(7),
            control,
            recorder: sink.recorder(),
            failures,
        };
        let client = echo.run(client).await;

        assert_eq!(client.rounds(), 7);
        assert_eq!(client.bytes_sent(), 7 * 104);
        assert_eq!(sink.take_messages().len(), 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inactive_control_sends_nothing() {
        let server = testing::spawn_server(Behavior::Echo).await;
        let sink = SampleSink::new();
        let (failures, _rx) = mpsc::unbounded_channel();

        let mut client = EchoClient::new(0, server.addr, ClientOptions::default());
        client.connect().await.unwrap();

        let echo = EchoLoop {
            payload: PayloadSize::Fixed(10),
            rounds: None,
            control: RunControl::new(),
            recorder: sink.recorder(),
            failures,
        };
        let client = echo.run(client).await;
        assert_eq!(client.rounds(), 0);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_failure_reported() {
        let server = testing::spawn_server(Behavior::FlipConnection(0)).await;
        let sink = SampleSink::new();
        let (failures, mut rx) = mpsc::unbounded_channel();
        let control = RunControl::new();
        control.activate();

        let mut client = EchoClient::new(3, server.addr, ClientOptions::default());
        client.connect().await.unwrap();

        let echo = EchoLoop {
            payload: PayloadSize::Uniform { min: 4, max: 64 },
            rounds: None,
            control,
            recorder: sink.recorder(),
            failures,
        };
        let client = echo.run(client).await;
        assert_eq!(client.state(), ClientState::Failed);

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.client, 3);
        assert!(matches!(failure.error, ClientError::EchoMismatch { .. }));
    }

    #[tokio::test]
    async fn test_failure_without_listener() {
        let server = testing::spawn_server(Behavior::FlipConnection(0)).await;
        let sink = SampleSink::new();
        let (failures, rx) = mpsc::unbounded_channel();
        drop(rx);
        let control = RunControl::new();
        control.activate();

        let mut client = EchoClient::new(0, server.addr, ClientOptions::default());
        client.connect().await.unwrap();

        let echo = EchoLoop {
            payload: PayloadSize::Fixed(16),
            rounds: None,
            control,
            recorder: sink.recorder(),
            failures,
        };
        let client = echo.run(client).await;
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.rounds(), 0);
    }

    #[tokio::test]
    async fn test_join_all_stops_on_first_failure() {
        let server = testing::spawn_server(Behavior::FlipConnection(1)).await;
        let sink = SampleSink::new();
        let (failures, mut rx) = mpsc::unbounded_channel();
        let control = RunControl::new();
        control.activate();

        let echo = EchoLoop {
            payload: PayloadSize::Fixed(32),
            rounds: None,
            control: control.clone(),
            recorder: sink.recorder(),
            failures,
        };
        let mut set = JoinSet::new();
        for id in 0..3 {
            let mut client = EchoClient::new(id, server.addr, ClientOptions::default());
            client.connect().await.unwrap();
            server.wait_accepted(id + 1).await;
            set.spawn(echo.clone().run(client));
        }

        let (clients, failure) = join_all(set, &mut rx, &control, None).await;
        assert!(!control.is_active());
        assert_eq!(clients.len(), 3);
        assert_eq!(failure.unwrap().client, 1);
        assert_eq!(clients[1].state(), ClientState::Failed);
        assert_eq!(clients[0].state(), ClientState::Active);
    }

    #[tokio::test]
    async fn test_join_all_deadline() {
        let server = testing::spawn_server(Behavior::Echo).await;
        let sink = SampleSink::new();
        let (failures, mut rx) = mpsc::unbounded_channel();
        let control = RunControl::new();
        control.activate();

        let mut client = EchoClient::new(0, server.addr, ClientOptions::default());
        client.connect().await.unwrap();
        let echo = EchoLoop {
            payload: PayloadSize::Fixed(8),
            rounds: None,
            control: control.clone(),
            recorder: sink.recorder(),
            failures,
        };
        let mut set = JoinSet::new();
        set.spawn(echo.run(client));

        let (clients, failure) =
            join_all(set, &mut rx, &control, Some(Duration::from_millis(50))).await;
        assert!(failure.is_none());
        assert!(clients[0].rounds() > 0);
        assert!(!control.is_active());
    }
}
