//! Sample collection.
//!
//! Client tasks never touch the collections directly. Each task holds a
//! [`Recorder`] and sends [`Sample`]s over an unbounded channel; the
//! controller owns the [`SampleSink`] and drains the channel between
//! phases, once every sending task has been joined. This keeps the
//! collections single-owner on both current-thread and multi-threaded
//! runtimes.

use std::time::Duration;
use tokio::sync::mpsc;

/// One measurement produced by a client task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Connect initiation to connect completion.
    Join(Duration),
    /// Request flushed to response fully read.
    Message(Duration),
}

/// Sending half handed to client tasks.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<Sample>,
}

impl Recorder {
    pub fn join(&self, latency: Duration) {
        // The sink outlives every task; a closed channel only happens at teardown.
        let _ = self.tx.send(Sample::Join(latency));
    }

    pub fn message(&self, latency: Duration) {
        let _ = self.tx.send(Sample::Message(latency));
    }
}

/// Append-only join and message latency collections, in seconds.
#[derive(Debug)]
pub struct SampleSink {
    tx: mpsc::UnboundedSender<Sample>,
    rx: mpsc::UnboundedReceiver<Sample>,
    join: Vec<f64>,
    message: Vec<f64>,
}

impl SampleSink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            join: Vec::new(),
            message: Vec::new(),
        }
    }

    /// New recorder feeding this sink.
    pub fn recorder(&self) -> Recorder {
        Recorder {
            tx: self.tx.clone(),
        }
    }

    /// Move every sample sent so far into the collections.
    pub fn collect(&mut self) {
        while let Ok(sample) = self.rx.try_recv() {
            match sample {
                Sample::Join(d) => self.join.push(d.as_secs_f64()),
                Sample::Message(d) => self.message.push(d.as_secs_f64()),
            }
        }
    }

    pub fn message_latencies(&self) -> &[f64] {
        &self.message
    }

    /// Collect, then hand over the message latencies of the finished phase.
    pub fn take_messages(&mut self) -> Vec<f64> {
        self.collect();
        std::mem::take(&mut self.message)
    }

    /// Collect, then hand over the join latencies.
    pub fn take_joins(&mut self) -> Vec<f64> {
        self.collect();
        std::mem::take(&mut self.join)
    }
}

impl Default for SampleSink {
    fn default() -> Self {
        Self::new()
    }
}
