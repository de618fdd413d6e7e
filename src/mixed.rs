//! Mixed workload: a fixed pool where every client runs a random number of
//! rounds with random payload lengths, then closes.
//!
//! Unlike the sweep there are no phases. Each client draws its own round
//! count up front, so clients finish at different times and the server sees
//! a shrinking population towards the end of the run. The run reports the
//! total bytes sent across the pool.

use crate::batch;
use crate::client::{ClientOptions, EchoClient};
use crate::control::{RunControl, StopLatch};
use crate::error::{ClientError, RunError};
use crate::output::Output;
use crate::payload::PayloadSize;
use crate::sink::SampleSink;
use crate::worker::{self, EchoLoop};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Mixed workload parameters.
#[derive(Debug, Clone)]
pub struct MixedSettings {
    pub clients: usize,
    pub batch_size: usize,
    pub payload: PayloadSize,
    /// Each client runs `1..=max_rounds` rounds.
    pub max_rounds: u64,
}

/// Final mixed workload report.
#[derive(Debug)]
pub struct MixedReport {
    pub pool: usize,
    pub join_samples: usize,
    pub rounds: u64,
    pub total_bytes: u64,
    pub message_samples: usize,
    /// First client failure, which stops every other client.
    pub failure: Option<ClientError>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

pub struct MixedController {
    addr: SocketAddr,
    options: ClientOptions,
    settings: MixedSettings,
    control: RunControl,
    stop: StopLatch,
    sink: SampleSink,
    output: Output,
}

impl MixedController {
    pub fn new(
        addr: SocketAddr,
        options: ClientOptions,
        settings: MixedSettings,
        control: RunControl,
        stop: StopLatch,
        output: Output,
    ) -> Self {
        Self {
            addr,
            options,
            settings,
            control,
            stop,
            sink: SampleSink::new(),
            output,
        }
    }

    /// Join the pool, let every client run its rounds, then close the pool.
    pub async fn run(mut self) -> Result<MixedReport, RunError> {
        let start = Instant::now();
        info!(clients = self.settings.clients, "Joining the server");

        let pool = batch::establish_pool(
            self.settings.clients,
            self.settings.batch_size,
            self.addr,
            &self.options,
            &self.sink.recorder(),
            &self.stop,
        )
        .await;
        if let Some(error) = pool.failure {
            let connected = pool.clients.len();
            warn!(clients = connected, error = %error, "Failed to establish pool");
            batch::close_all(pool.clients, self.settings.batch_size, Duration::ZERO).await;
            self.output
                .write_series("join-lat", &self.sink.take_joins())?;
            return Err(RunError::PoolEstablish { connected, error });
        }

        let joins = self.sink.take_joins();
        self.output.write_series("join-lat", &joins)?;
        info!(clients = pool.clients.len(), "All clients joined");

        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let echo = EchoLoop {
            payload: self.settings.payload,
            rounds: None,
            control: self.control.clone(),
            recorder: self.sink.recorder(),
            failures: failures_tx,
        };

        self.control.activate();
        if self.stop.is_stopped() {
            self.control.cancel();
        }

        let mut rng = StdRng::from_entropy();
        let mut set = JoinSet::new();
        for client in pool.clients {
            let rounds = rng.gen_range(1..=self.settings.max_rounds.max(1));
            set.spawn(
                EchoLoop {
                    rounds: Some(rounds),
                    ..echo.clone()
                }
                .run(client),
            );
        }
        let (clients, failed) = worker::join_all(set, &mut failures, &self.control, None).await;
        self.control.cancel();

        let total_bytes = clients.iter().map(EchoClient::bytes_sent).sum();
        let rounds = clients.iter().map(EchoClient::rounds).sum();
        let messages = self.sink.take_messages();
        self.output.write_series("msg-lat", &messages)?;
        println!("Total bytes sent: {total_bytes}");

        let failure = failed.map(|f| {
            warn!(client = f.client, error = %f.error, "Mixed run aborted");
            f.error
        });
        info!(
            total_bytes,
            rounds,
            samples = messages.len(),
            "Mixed run done"
        );

        let pool = clients.len();
        let closed = batch::close_all(clients, self.settings.batch_size, Duration::ZERO).await;
        debug!(closed, "Closed pool");

        Ok(MixedReport {
            pool,
            join_samples: joins.len(),
            rounds,
            total_bytes,
            message_samples: messages.len(),
            failure,
            interrupted: self.stop.is_stopped(),
            elapsed: start.elapsed(),
        })
    }
}
