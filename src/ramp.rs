//! Ramp controller: escalating concurrency until the first failure.
//!
//! Batches of fresh clients are connected one after another. Each batch is
//! a barrier: every member resolves before the controller looks at the
//! result. A clean batch joins the active population, every new client
//! completes one admission round, and only then does each start an
//! unbounded echo loop and the next batch begin. The first failed connect
//! or echo round anywhere ends the run, and the reported population is the
//! number of clients active when that failure was observed. Either way the controller clears the run flag,
//! drains every echo loop, closes every connected client and persists the
//! collected samples before reporting.

use crate::batch::{self, propagate_panic};
use crate::client::{ClientOptions, EchoClient};
use crate::control::{RunControl, StopLatch};
use crate::error::{ClientError, RunError};
use crate::output::Output;
use crate::payload::PayloadSize;
use crate::sink::SampleSink;
use crate::worker::{EchoLoop, Failure};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Ramp parameters.
#[derive(Debug, Clone)]
pub struct RampSettings {
    pub batch_size: usize,
    pub payload: PayloadSize,
    /// Stop growing, without a failure, once this many clients are active.
    pub max_clients: Option<usize>,
    /// Pause after each clean batch.
    pub batch_pause: Duration,
}

/// Which operation produced the terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Connect,
    Echo,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Connect => "connect",
            FailureStage::Echo => "echo",
        }
    }
}

/// How a ramp ended. Exactly one per run.
#[derive(Debug)]
pub enum RampOutcome {
    Failed {
        population: usize,
        stage: FailureStage,
        error: ClientError,
    },
    Capped {
        population: usize,
    },
    Interrupted {
        population: usize,
    },
}

impl RampOutcome {
    pub fn population(&self) -> usize {
        match self {
            RampOutcome::Failed { population, .. }
            | RampOutcome::Capped { population }
            | RampOutcome::Interrupted { population } => *population,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RampOutcome::Failed { .. } => "failed",
            RampOutcome::Capped { .. } => "capped",
            RampOutcome::Interrupted { .. } => "interrupted",
        }
    }
}

/// Final ramp report.
#[derive(Debug)]
pub struct RampReport {
    pub outcome: RampOutcome,
    /// Batches issued, including the one that failed.
    pub batches: usize,
    /// Clients that still held an open stream at shutdown.
    pub closed: usize,
    pub join_samples: usize,
    pub message_samples: usize,
    pub elapsed: Duration,
}

pub struct RampController {
    addr: SocketAddr,
    options: ClientOptions,
    settings: RampSettings,
    control: RunControl,
    stop: StopLatch,
    sink: SampleSink,
    output: Output,
}

impl RampController {
    pub fn new(
        addr: SocketAddr,
        options: ClientOptions,
        settings: RampSettings,
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

    /// Run the ramp to its single terminal outcome.
    pub async fn run(mut self) -> Result<RampReport, RunError> {
        let start = Instant::now();
        let (failures_tx, mut failures) = mpsc::unbounded_channel::<Failure>();
        let echo = EchoLoop {
            payload: self.settings.payload,
            rounds: None,
            control: self.control.clone(),
            recorder: self.sink.recorder(),
            failures: failures_tx,
        };
        let admission = EchoLoop {
            rounds: Some(1),
            ..echo.clone()
        };

        let mut active: JoinSet<EchoClient> = JoinSet::new();
        // Clients that never start an unbounded loop
        let mut stragglers = Vec::new();
        let mut population = 0;
        let mut batches = 0;

        info!(
            batch_size = self.settings.batch_size,
            max_clients = ?self.settings.max_clients,
            "Starting ramp"
        );
        self.control.activate();

        let recorder = self.sink.recorder();
        let outcome = loop {
            if let Ok(failure) = failures.try_recv() {
                break echo_failure(population, failure);
            }
            if !self.control.is_active() || self.stop.is_stopped() {
                break RampOutcome::Interrupted { population };
            }
            let size = match self.settings.max_clients {
                Some(max) if population >= max => break RampOutcome::Capped { population },
                Some(max) => self.settings.batch_size.min(max - population),
                None => self.settings.batch_size,
            };

            // Running loops may fail while the batch connects
            let connecting =
                batch::connect_batch(population, size, self.addr, &self.options, &recorder);
            tokio::pin!(connecting);
            let mut observed = None;
            let resolved = loop {
                tokio::select! {
                    resolved = &mut connecting => break resolved,
                    Some(failure) = failures.recv(), if observed.is_none() => {
                        self.control.cancel();
                        observed = Some(failure);
                    }
                }
            };
            batches += 1;

            if let Some(failure) = observed {
                // The batch never joined the active population
                stragglers.extend(resolved.connected);
                break echo_failure(population, failure);
            }

            population += resolved.connected.len();
            if let Some(error) = resolved.failures.into_iter().next() {
                stragglers.extend(resolved.connected);
                break RampOutcome::Failed {
                    population,
                    stage: FailureStage::Connect,
                    error,
                };
            }

            // Admission round: every new client echoes once before the next batch
            let mut admitting = JoinSet::new();
            for client in resolved.connected {
                admitting.spawn(admission.clone().run(client));
            }
            while let Some(joined) = admitting.join_next().await {
                match joined {
                    Ok(client) if client.is_open() => {
                        active.spawn(echo.clone().run(client));
                    }
                    // Its failure is already on the channel
                    Ok(client) => stragglers.push(client),
                    Err(e) => propagate_panic(e),
                }
            }
            info!(clients = population, "Client count");

            if !self.settings.batch_pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.batch_pause) => {}
                    Some(failure) = failures.recv() => break echo_failure(population, failure),
                }
            }
        };

        // Drain: every loop finishes its in-flight round and returns its client
        self.control.cancel();
        let mut clients = stragglers;
        while let Some(joined) = active.join_next().await {
            match joined {
                Ok(client) => clients.push(client),
                Err(e) => propagate_panic(e),
            }
        }

        // A round that failed while draining still counts as the failure
        let outcome = if matches!(outcome, RampOutcome::Failed { .. }) {
            while let Ok(late) = failures.try_recv() {
                debug!(client = late.client, error = %late.error, "Further failure while draining");
            }
            outcome
        } else {
            match failures.try_recv() {
                Ok(failure) => echo_failure(outcome.population(), failure),
                Err(_) => outcome,
            }
        };

        match &outcome {
            RampOutcome::Failed {
                population,
                stage,
                error,
            } => {
                warn!(clients = population, stage = stage.as_str(), error = %error, "Failed at");
            }
            other => info!(clients = other.population(), outcome = other.label(), "Ramp stopped"),
        }

        let closed = batch::close_all(clients, self.settings.batch_size, Duration::ZERO).await;
        debug!(closed, "Closed clients");

        let joins = self.sink.take_joins();
        let messages = self.sink.take_messages();
        self.output.write_series("join-lat", &joins)?;
        self.output.write_series("msg-lat", &messages)?;

        Ok(RampReport {
            outcome,
            batches,
            closed,
            join_samples: joins.len(),
            message_samples: messages.len(),
            elapsed: start.elapsed(),
        })
    }
}

fn echo_failure(population: usize, failure: Failure) -> RampOutcome {
    debug!(client = failure.client, "Echo failure ends ramp");
    RampOutcome::Failed {
        population,
        stage: FailureStage::Echo,
        error: failure.error,
    }
}
