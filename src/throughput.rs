//! Throughput controller: fixed client pool, message-size sweep.
//!
//! The pool is established once in barrier-synchronized batches; any
//! connect failure there is fatal. Each size in the sweep is one phase:
//! counters reset, one echo loop per client, and the phase ends either
//! after a fixed wall-clock duration or once every client has done a fixed
//! number of rounds. Aggregates are computed only after every loop of the
//! phase has been joined, and each phase is persisted before the next one
//! starts.

use crate::batch;
use crate::client::{ClientOptions, EchoClient};
use crate::control::{RunControl, StopLatch};
use crate::error::{ClientError, RunError};
use crate::output::{self, Output, PhaseSummary};
use crate::payload::PayloadSize;
use crate::sink::SampleSink;
use crate::worker::{self, EchoLoop, Failure};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// When a sweep phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEnd {
    /// Run every client for this long.
    Duration(Duration),
    /// Every client performs exactly this many rounds.
    Rounds(u64),
}

/// Sweep parameters.
#[derive(Debug, Clone)]
pub struct ThroughputSettings {
    pub clients: usize,
    pub batch_size: usize,
    pub sizes: Vec<usize>,
    pub phase_end: PhaseEnd,
    /// Idle time between phases.
    pub phase_pause: Duration,
    /// Idle time between close batches.
    pub close_pause: Duration,
}

/// Final sweep report.
#[derive(Debug)]
pub struct ThroughputReport {
    pub pool: usize,
    pub join_samples: usize,
    pub phases: Vec<PhaseSummary>,
    /// First client failure, which ends the sweep early.
    pub failure: Option<ClientError>,
    pub interrupted: bool,
}

pub struct ThroughputController {
    addr: SocketAddr,
    options: ClientOptions,
    settings: ThroughputSettings,
    control: RunControl,
    stop: StopLatch,
    sink: SampleSink,
    output: Output,
}

impl ThroughputController {
    pub fn new(
        addr: SocketAddr,
        options: ClientOptions,
        settings: ThroughputSettings,
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

    /// Establish the pool, sweep every size, then close the pool.
    pub async fn run(mut self) -> Result<ThroughputReport, RunError> {
        info!(clients = self.settings.clients, "Joining the server");
        let mut clients = self.establish().await?;
        let joins = self.sink.take_joins();
        self.output.write_series("join-lat", &joins)?;
        info!(clients = clients.len(), "All clients joined");

        self.output.start_throughput()?;
        let mut phases = Vec::with_capacity(self.settings.sizes.len());
        let mut failure = None;
        let sizes = self.settings.sizes.clone();

        for (i, &size) in sizes.iter().enumerate() {
            if i > 0 && !self.settings.phase_pause.is_zero() {
                tokio::time::sleep(self.settings.phase_pause).await;
            }
            // An interrupt may land during the pause
            if self.stop.is_stopped() {
                info!(size, "Sweep interrupted");
                break;
            }

            let (returned, phase, failed) = self.phase(size, clients).await;
            clients = returned;

            let messages = self.sink.take_messages();
            self.output
                .write_series(&format!("msg-lat-{size}"), &messages)?;
            self.output
                .append_throughput(size, phase.bytes, Duration::from_secs_f64(phase.elapsed_secs))?;
            println!(
                "{}",
                output::throughput_record(
                    size,
                    phase.bytes,
                    Duration::from_secs_f64(phase.elapsed_secs)
                )
            );
            info!(
                size,
                bytes = phase.bytes,
                samples = phase.samples,
                elapsed_secs = phase.elapsed_secs,
                "Phase done"
            );
            phases.push(phase);

            if let Some(f) = failed {
                warn!(size, client = f.client, error = %f.error, "Sweep aborted");
                failure = Some(f.error);
                break;
            }
        }

        let pool = clients.len();
        let closed =
            batch::close_all(clients, self.settings.batch_size, self.settings.close_pause).await;
        debug!(closed, "Closed pool");

        Ok(ThroughputReport {
            pool,
            join_samples: joins.len(),
            phases,
            failure,
            interrupted: self.stop.is_stopped(),
        })
    }

    /// Connect the full pool batch by batch.
    ///
    /// An interrupt stops establishment early and returns the partial pool.
    async fn establish(&mut self) -> Result<Vec<EchoClient>, RunError> {
        let pool = batch::establish_pool(
            self.settings.clients,
            self.settings.batch_size,
            self.addr,
            &self.options,
            &self.sink.recorder(),
            &self.stop,
        )
        .await;

        match pool.failure {
            None => Ok(pool.clients),
            Some(error) => {
                let connected = pool.clients.len();
                warn!(clients = connected, error = %error, "Failed to establish pool");
                batch::close_all(pool.clients, self.settings.batch_size, Duration::ZERO).await;
                self.output
                    .write_series("join-lat", &self.sink.take_joins())?;
                Err(RunError::PoolEstablish { connected, error })
            }
        }
    }

    /// Drive one sweep phase and hand the pool back.
    async fn phase(
        &mut self,
        size: usize,
        mut clients: Vec<EchoClient>,
    ) -> (Vec<EchoClient>, PhaseSummary, Option<Failure>) {
        for client in &mut clients {
            client.reset_counters();
        }
        self.sink.take_messages();

        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let (rounds, deadline) = match self.settings.phase_end {
            PhaseEnd::Duration(d) => (None, Some(d)),
            PhaseEnd::Rounds(n) => (Some(n), None),
        };
        let echo = EchoLoop {
            payload: PayloadSize::Fixed(size),
            rounds,
            control: self.control.clone(),
            recorder: self.sink.recorder(),
            failures: failures_tx,
        };

        info!(size, clients = clients.len(), "Starting phase");
        self.control.activate();
        if self.stop.is_stopped() {
            self.control.cancel();
        }
        let start = Instant::now();

        let mut set = JoinSet::new();
        for client in clients.drain(..) {
            set.spawn(echo.clone().run(client));
        }
        let (clients, first_failure) =
            worker::join_all(set, &mut failures, &self.control, deadline).await;
        let elapsed = start.elapsed();
        self.control.cancel();

        let bytes = clients.iter().map(EchoClient::bytes_sent).sum();
        let total_rounds = clients.iter().map(EchoClient::rounds).sum();
        self.sink.collect();
        let samples = self.sink.message_latencies().len();

        (
            clients,
            PhaseSummary::new(size, bytes, total_rounds, samples, elapsed),
            first_failure,
        )
    }
}
