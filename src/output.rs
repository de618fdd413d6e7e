//! Result persistence.
//!
//! Files are newline-delimited numeric records under the output directory,
//! prefixed with the run name:
//!
//! ```text
//! {name}-join-lat.csv          one join latency (seconds) per line
//! {name}-msg-lat.csv           ramp or mixed message latencies
//! {name}-msg-lat-{size}.csv    sweep message latencies for one size
//! {name}-throughput.csv        "size, bytes, elapsed-seconds" per phase
//! {name}-summary.toml          scalar summary of the run
//! ```

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Writer for one run's result files.
#[derive(Debug, Clone)]
pub struct Output {
    dir: PathBuf,
    name: String,
}

impl Output {
    /// Prepare the output directory.
    pub fn create(dir: impl AsRef<Path>, name: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            name: name.to_string(),
        })
    }

    /// Path of the file holding `series`.
    pub fn path(&self, series: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}-{series}.{extension}", self.name))
    }

    /// Write a single-series file, one value per line.
    pub fn write_series(&self, series: &str, values: &[f64]) -> std::io::Result<PathBuf> {
        let path = self.path(series, "csv");
        let mut writer = BufWriter::new(File::create(&path)?);
        for value in values {
            writeln!(writer, "{value}")?;
        }
        writer.flush()?;
        debug!(path = %path.display(), samples = values.len(), "Wrote samples");
        Ok(path)
    }

    /// Truncate the throughput file at the start of a sweep.
    pub fn start_throughput(&self) -> std::io::Result<()> {
        File::create(self.path("throughput", "csv"))?;
        Ok(())
    }

    /// Append one sweep phase record.
    pub fn append_throughput(
        &self,
        size: usize,
        bytes: u64,
        elapsed: Duration,
    ) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path("throughput", "csv"))?;
        writeln!(file, "{}", throughput_record(size, bytes, elapsed))
    }

    /// Write the scalar run summary.
    pub fn write_summary(&self, summary: &RunSummary) -> std::io::Result<PathBuf> {
        let path = self.path("summary", "toml");
        let text = toml::to_string(summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, text)?;
        Ok(path)
    }
}

/// `size, bytes, elapsed-seconds` record for one sweep phase.
pub fn throughput_record(size: usize, bytes: u64, elapsed: Duration) -> String {
    format!("{size}, {bytes}, {:.6}", elapsed.as_secs_f64())
}

/// Aggregate result of one sweep phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub size: usize,
    pub bytes: u64,
    pub rounds: u64,
    pub samples: usize,
    pub elapsed_secs: f64,
    pub bytes_per_sec: f64,
}

impl PhaseSummary {
    pub fn new(size: usize, bytes: u64, rounds: u64, samples: usize, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let bytes_per_sec = if elapsed_secs > 0.0 {
            bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            size,
            bytes,
            rounds,
            samples,
            elapsed_secs,
            bytes_per_sec,
        }
    }
}

/// Scalar summary written at the end of every run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub mode: String,
    pub server: String,
    pub started_at: String,
    pub finished_at: String,
    /// Population at failure (ramp) or established pool size (sweep).
    pub clients: usize,
    pub join_samples: usize,
    /// Bytes sent across the pool (mixed workload).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub phases: Vec<PhaseSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("echo-bench-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_series_one_value_per_line() {
        let dir = scratch_dir("series");
        let output = Output::create(&dir, "local").unwrap();

        let path = output.write_series("join-lat", &[0.5, 0.25, 1.0]).unwrap();
        assert_eq!(path, dir.join("local-join-lat.csv"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "0.5\n0.25\n1\n");

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_throughput_records() {
        let dir = scratch_dir("throughput");
        let output = Output::create(&dir, "run").unwrap();

        output.start_throughput().unwrap();
        output
            .append_throughput(100, 10_400, Duration::from_millis(1500))
            .unwrap();
        output
            .append_throughput(500, 50_400, Duration::from_secs(2))
            .unwrap();

        let text = fs::read_to_string(dir.join("run-throughput.csv")).unwrap();
        assert_eq!(text, "100, 10400, 1.500000\n500, 50400, 2.000000\n");

        // A new sweep starts from an empty file
        output.start_throughput().unwrap();
        assert!(fs::read_to_string(dir.join("run-throughput.csv"))
            .unwrap()
            .is_empty());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_summary_toml() {
        let dir = scratch_dir("summary");
        let output = Output::create(&dir, "run").unwrap();

        let summary = RunSummary {
            name: "run".to_string(),
            mode: "throughput".to_string(),
            server: "127.0.0.1:6969".to_string(),
            started_at: "2024-01-01T00:00:00+00:00".to_string(),
            finished_at: "2024-01-01T00:01:00+00:00".to_string(),
            clients: 10,
            join_samples: 10,
            total_bytes: None,
            outcome: None,
            failure: None,
            phases: vec![PhaseSummary::new(100, 10_400, 100, 100, Duration::from_secs(2))],
        };
        let path = output.write_summary(&summary).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("clients = 10"));
        assert!(text.contains("[[phases]]"));
        assert!(text.contains("bytes_per_sec = 5200.0"));
        assert!(!text.contains("failure"));
        assert!(!text.contains("total_bytes"));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_phase_rate_zero_elapsed() {
        let phase = PhaseSummary::new(100, 1000, 10, 10, Duration::ZERO);
        assert_eq!(phase.bytes_per_sec, 0.0);
    }
}
