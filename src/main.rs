//! echo-bench: load generator for length-prefixed echo servers
//!
//! Opens large numbers of concurrent TCP connections to a server under
//! test and drives them through request/response cycles, recording
//! telemetry for comparison across server implementations.
//!
//! Modes:
//! - Ramp: grow the client population in batches until the first failure
//! - Throughput: sweep message sizes over a fixed client pool
//! - Mixed: random round counts and payload lengths over a fixed pool
//!
//! Features:
//! - Join latency and raw per-message latency export
//! - Per-phase bytes and elapsed time for throughput analysis
//! - Configuration via CLI arguments or TOML file

mod batch;
mod client;
mod config;
mod control;
mod error;
mod frame;
mod mixed;
mod output;
mod payload;
mod ramp;
mod sink;
mod throughput;
mod worker;

#[cfg(test)]
mod testing;

use chrono::Local;
use config::{Config, Mode};
use control::{RunControl, StopLatch};
use error::RunError;
use mixed::MixedController;
use output::{Output, RunSummary};
use ramp::{RampController, RampOutcome};
use std::net::SocketAddr;
use throughput::ThroughputController;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        name = %config.name,
        server = %config.server,
        mode = config.mode.as_str(),
        batch_size = config.batch_size,
        workers = ?config.workers,
        out = %config.out_dir.display(),
        "Starting echo-bench"
    );

    raise_fd_limit();

    let runtime = match config.workers {
        Some(workers) => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()?,
        None => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    runtime.block_on(run(config))
}

/// Resolve the target, run the selected experiment and write its summary.
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = resolve(&config.server).await?;
    let output = Output::create(&config.out_dir, &config.name)?;
    let control = RunControl::new();
    let stop = StopLatch::new();

    {
        let control = control.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, draining clients");
                stop.stop();
                control.cancel();
            }
        });
    }

    let mut summary = RunSummary {
        name: config.name.clone(),
        mode: config.mode.as_str().to_string(),
        server: addr.to_string(),
        started_at: Local::now().to_rfc3339(),
        finished_at: String::new(),
        clients: 0,
        join_samples: 0,
        total_bytes: None,
        outcome: None,
        failure: None,
        phases: Vec::new(),
    };

    let result = match config.mode {
        Mode::Ramp => {
            let controller = RampController::new(
                addr,
                config.client_options(),
                config.ramp_settings(),
                control,
                stop,
                output.clone(),
            );
            controller.run().await.map(|report| {
                info!(
                    clients = report.outcome.population(),
                    batches = report.batches,
                    closed = report.closed,
                    messages = report.message_samples,
                    elapsed_secs = report.elapsed.as_secs_f64(),
                    "Ramp finished"
                );
                summary.clients = report.outcome.population();
                summary.join_samples = report.join_samples;
                summary.outcome = Some(report.outcome.label().to_string());
                if let RampOutcome::Failed { stage, error, .. } = &report.outcome {
                    summary.failure = Some(format!("{} failed: {error}", stage.as_str()));
                }
            })
        }
        Mode::Throughput => {
            let controller = ThroughputController::new(
                addr,
                config.client_options(),
                config.throughput_settings(),
                control,
                stop,
                output.clone(),
            );
            controller.run().await.and_then(|report| {
                summary.clients = report.pool;
                summary.join_samples = report.join_samples;
                summary.phases = report.phases;
                summary.outcome = Some(outcome_label(report.failure.is_some(), report.interrupted));
                match report.failure {
                    Some(error) => Err(RunError::Echo {
                        clients: report.pool,
                        error,
                    }),
                    None => Ok(()),
                }
            })
        }
        Mode::Mixed => {
            let controller = MixedController::new(
                addr,
                config.client_options(),
                config.mixed_settings(),
                control,
                stop,
                output.clone(),
            );
            controller.run().await.and_then(|report| {
                info!(
                    clients = report.pool,
                    rounds = report.rounds,
                    messages = report.message_samples,
                    total_bytes = report.total_bytes,
                    elapsed_secs = report.elapsed.as_secs_f64(),
                    "Mixed run finished"
                );
                summary.clients = report.pool;
                summary.join_samples = report.join_samples;
                summary.total_bytes = Some(report.total_bytes);
                summary.outcome = Some(outcome_label(report.failure.is_some(), report.interrupted));
                match report.failure {
                    Some(error) => Err(RunError::Echo {
                        clients: report.pool,
                        error,
                    }),
                    None => Ok(()),
                }
            })
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "Run failed");
        summary.outcome = Some("failed".to_string());
        summary.failure = Some(e.to_string());
        if let RunError::PoolEstablish { connected, .. } = e {
            summary.clients = *connected;
        }
    }

    summary.finished_at = Local::now().to_rfc3339();
    let path = output.write_summary(&summary)?;
    info!(path = %path.display(), "Wrote summary");

    result.map_err(Into::into)
}

fn outcome_label(failed: bool, interrupted: bool) -> String {
    if failed {
        "failed"
    } else if interrupted {
        "interrupted"
    } else {
        "completed"
    }
    .to_string()
}

/// Resolve `host:port` once so thousands of connects skip name lookup.
async fn resolve(server: &str) -> std::io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(server).await?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address found for {server}"),
        )
    })
}

/// Lift the soft open-file limit to the hard limit; every client is a socket.
#[cfg(unix)]
fn raise_fd_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: getrlimit only writes into the struct we pass.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "Could not read open file limit");
        return;
    }
    if limit.rlim_cur >= limit.rlim_max {
        debug!(limit = limit.rlim_cur, "Open file limit already at maximum");
        return;
    }

    let previous = limit.rlim_cur;
    limit.rlim_cur = limit.rlim_max;
    // SAFETY: the struct is fully initialized by getrlimit above.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            current = previous,
            "Could not raise open file limit"
        );
    } else {
        info!(from = previous, to = limit.rlim_cur, "Raised open file limit");
    }
}

#[cfg(not(unix))]
fn raise_fd_limit() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve("127.0.0.1:6969").await.unwrap();
        assert_eq!(addr, "127.0.0.1:6969".parse().unwrap());
    }

    #[test]
    fn test_outcome_label() {
        assert_eq!(outcome_label(true, true), "failed");
        assert_eq!(outcome_label(false, true), "interrupted");
        assert_eq!(outcome_label(false, false), "completed");
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_port() {
        assert!(resolve("127.0.0.1").await.is_err());
    }
}
