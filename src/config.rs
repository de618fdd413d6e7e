//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::ClientOptions;
use crate::mixed::MixedSettings;
use crate::payload::PayloadSize;
use crate::ramp::RampSettings;
use crate::throughput::{PhaseEnd, ThroughputSettings};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which experiment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Grow the client population until the server fails.
    Ramp,
    /// Sweep message sizes over a fixed client pool.
    Throughput,
    /// Random round counts and payload lengths over a fixed client pool.
    Mixed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ramp => "ramp",
            Mode::Throughput => "throughput",
            Mode::Mixed => "mixed",
        }
    }
}

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Load generator for length-prefixed echo servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server under test (e.g., 127.0.0.1:6969)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Experiment to run
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Run name, used as the output file prefix
    #[arg(short, long)]
    pub name: Option<String>,

    /// Output directory for samples and summaries
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Clients connected per batch
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Client pool size for the throughput and mixed runs
    #[arg(long)]
    pub clients: Option<usize>,

    /// Seconds per sweep phase
    #[arg(long)]
    pub run_time: Option<u64>,

    /// Fixed rounds per client per sweep phase (overrides --run-time)
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Number of worker threads (defaults to a single-threaded runtime)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub mixed: MixedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server under test
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_server")]
    pub server: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
        }
    }
}

/// Run-wide settings
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            name: default_name(),
            out_dir: default_out_dir(),
            batch_size: default_batch_size(),
            workers: None,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Echo a handshake frame before a connection counts as joined
    #[serde(default = "default_true")]
    pub handshake: bool,
    #[serde(default = "default_handshake_payload")]
    pub handshake_payload: String,
    /// Connect deadline in milliseconds (0 = transport default)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-round deadline in milliseconds (0 = none)
    #[serde(default)]
    pub io_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake: true,
            handshake_payload: default_handshake_payload(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: 0,
        }
    }
}

/// Ramp experiment settings
#[derive(Debug, Clone, Deserialize)]
pub struct RampConfig {
    #[serde(default = "default_min_msg_len")]
    pub min_msg_len: usize,
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,
    /// Stop growing at this population
    pub max_clients: Option<usize>,
    #[serde(default)]
    pub batch_pause_ms: u64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            min_msg_len: default_min_msg_len(),
            max_msg_len: default_max_msg_len(),
            max_clients: None,
            batch_pause_ms: 0,
        }
    }
}

/// Throughput sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct ThroughputConfig {
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_sizes")]
    pub sizes: Vec<usize>,
    #[serde(default = "default_run_time_secs")]
    pub run_time_secs: u64,
    /// Fixed rounds per client instead of a timed phase
    pub rounds: Option<u64>,
    #[serde(default = "default_pause_ms")]
    pub phase_pause_ms: u64,
    #[serde(default = "default_pause_ms")]
    pub close_pause_ms: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            sizes: default_sizes(),
            run_time_secs: default_run_time_secs(),
            rounds: None,
            phase_pause_ms: default_pause_ms(),
            close_pause_ms: default_pause_ms(),
        }
    }
}

/// Mixed workload settings
#[derive(Debug, Clone, Deserialize)]
pub struct MixedConfig {
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_min_msg_len")]
    pub min_msg_len: usize,
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,
    /// Upper bound of the per-client round count
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u64,
}

impl Default for MixedConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            min_msg_len: default_min_msg_len(),
            max_msg_len: default_max_msg_len(),
            max_rounds: default_max_rounds(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_server() -> String {
    "127.0.0.1:6969".to_string()
}

fn default_mode() -> Mode {
    Mode::Throughput
}

fn default_name() -> String {
    "local".to_string()
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("echo-out")
}

fn default_batch_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_handshake_payload() -> String {
    "HELLO".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_min_msg_len() -> usize {
    4
}

fn default_max_msg_len() -> usize {
    1000
}

fn default_clients() -> usize {
    5000
}

fn default_sizes() -> Vec<usize> {
    vec![100, 500, 1000, 5000, 10000, 50000, 100000]
}

fn default_max_rounds() -> u64 {
    1000
}

fn default_run_time_secs() -> u64 {
    30
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub mode: Mode,
    pub name: String,
    pub out_dir: PathBuf,
    pub batch_size: usize,
    pub workers: Option<usize>,
    pub client: ClientConfig,
    pub ramp: RampConfig,
    pub throughput: ThroughputConfig,
    pub mixed: MixedConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let mut throughput = file.throughput;
        let mut mixed = file.mixed;
        if let Some(clients) = cli.clients {
            throughput.clients = clients;
            mixed.clients = clients;
        }
        if let Some(run_time) = cli.run_time {
            throughput.run_time_secs = run_time;
        }
        if cli.rounds.is_some() {
            throughput.rounds = cli.rounds;
        }

        let config = Config {
            server: cli.server.unwrap_or(file.target.server),
            mode: cli.mode.unwrap_or(file.run.mode),
            name: cli.name.unwrap_or(file.run.name),
            out_dir: cli.out.unwrap_or(file.run.out_dir),
            batch_size: cli.batch_size.unwrap_or(file.run.batch_size),
            workers: cli.workers.or(file.run.workers),
            client: file.client,
            ramp: file.ramp,
            throughput,
            mixed,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.ramp.min_msg_len > self.ramp.max_msg_len {
            return Err(ConfigError::Invalid(format!(
                "ramp min_msg_len {} exceeds max_msg_len {}",
                self.ramp.min_msg_len, self.ramp.max_msg_len
            )));
        }
        if self.throughput.clients == 0 {
            return Err(ConfigError::Invalid("clients must be at least 1".into()));
        }
        if self.throughput.sizes.is_empty() {
            return Err(ConfigError::Invalid("sizes must not be empty".into()));
        }
        if let Some(size) = self
            .throughput
            .sizes
            .iter()
            .find(|&&s| u32::try_from(s).is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "message size {size} exceeds the 32-bit length field"
            )));
        }
        if self.mixed.clients == 0 {
            return Err(ConfigError::Invalid("mixed clients must be at least 1".into()));
        }
        if self.mixed.min_msg_len > self.mixed.max_msg_len {
            return Err(ConfigError::Invalid(format!(
                "mixed min_msg_len {} exceeds max_msg_len {}",
                self.mixed.min_msg_len, self.mixed.max_msg_len
            )));
        }
        if self.mixed.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds must be at least 1".into()));
        }
        if self.throughput.rounds.is_none() && self.throughput.run_time_secs == 0 {
            return Err(ConfigError::Invalid(
                "run_time_secs must be positive when rounds is unset".into(),
            ));
        }
        Ok(())
    }

    /// Connection settings shared by every client.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            handshake: self
                .client
                .handshake
                .then(|| Bytes::from(self.client.handshake_payload.clone().into_bytes())),
            connect_timeout: millis(self.client.connect_timeout_ms),
            io_timeout: millis(self.client.io_timeout_ms),
        }
    }

    pub fn ramp_settings(&self) -> RampSettings {
        RampSettings {
            batch_size: self.batch_size,
            payload: PayloadSize::Uniform {
                min: self.ramp.min_msg_len,
                max: self.ramp.max_msg_len,
            },
            max_clients: self.ramp.max_clients,
            batch_pause: Duration::from_millis(self.ramp.batch_pause_ms),
        }
    }

    pub fn throughput_settings(&self) -> ThroughputSettings {
        let phase_end = match self.throughput.rounds {
            Some(rounds) => PhaseEnd::Rounds(rounds),
            None => PhaseEnd::Duration(Duration::from_secs(self.throughput.run_time_secs)),
        };
        ThroughputSettings {
            clients: self.throughput.clients,
            batch_size: self.batch_size,
            sizes: self.throughput.sizes.clone(),
            phase_end,
            phase_pause: Duration::from_millis(self.throughput.phase_pause_ms),
            close_pause: Duration::from_millis(self.throughput.close_pause_ms),
        }
    }

    pub fn mixed_settings(&self) -> MixedSettings {
        MixedSettings {
            clients: self.mixed.clients,
            batch_size: self.batch_size,
            payload: PayloadSize::Uniform {
                min: self.mixed.min_msg_len,
                max: self.mixed.max_msg_len,
            },
            max_rounds: self.mixed.max_rounds,
        }
    }
}

/// Zero disables the deadline.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("echo-bench").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.target.server, "127.0.0.1:6969");
        assert_eq!(config.run.mode, Mode::Throughput);
        assert_eq!(config.run.batch_size, 1000);
        assert_eq!(config.throughput.clients, 5000);
        assert_eq!(
            config.throughput.sizes,
            vec![100, 500, 1000, 5000, 10000, 50000, 100000]
        );
        assert_eq!(config.throughput.run_time_secs, 30);
        assert!(config.client.handshake);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            server = "10.0.0.2:7000"

            [run]
            mode = "ramp"
            name = "epoll-stress"
            batch_size = 500

            [client]
            handshake = false
            io_timeout_ms = 2000

            [ramp]
            max_msg_len = 64
            max_clients = 20000

            [throughput]
            sizes = [100, 1000]
            rounds = 10

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.target.server, "10.0.0.2:7000");
        assert_eq!(config.run.mode, Mode::Ramp);
        assert_eq!(config.run.name, "epoll-stress");
        assert_eq!(config.run.batch_size, 500);
        assert!(!config.client.handshake);
        assert_eq!(config.client.io_timeout_ms, 2000);
        assert_eq!(config.ramp.min_msg_len, 4);
        assert_eq!(config.ramp.max_clients, Some(20000));
        assert_eq!(config.throughput.sizes, vec![100, 1000]);
        assert_eq!(config.throughput.rounds, Some(10));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [run]
            mode = "ramp"
            batch_size = 500
            [throughput]
            clients = 2000
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--mode", "throughput", "--clients", "10", "--rounds", "3"]),
            file,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Throughput);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.throughput.clients, 10);
        assert_eq!(
            config.throughput_settings().phase_end,
            PhaseEnd::Rounds(3)
        );
    }

    #[test]
    fn test_settings_conversion() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();

        let options = config.client_options();
        assert_eq!(options.handshake.as_deref(), Some(&b"HELLO"[..]));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.io_timeout, None);

        let ramp = config.ramp_settings();
        assert_eq!(ramp.payload, PayloadSize::Uniform { min: 4, max: 1000 });

        let sweep = config.throughput_settings();
        assert_eq!(sweep.phase_end, PhaseEnd::Duration(Duration::from_secs(30)));
        assert_eq!(sweep.close_pause, Duration::from_secs(1));
    }

    #[test]
    fn test_mixed_mode() {
        let file: TomlConfig = toml::from_str(
            r#"
            [run]
            mode = "mixed"
            [mixed]
            max_msg_len = 200
            max_rounds = 50
            "#,
        )
        .unwrap();
        let config = Config::merge(cli(&["--clients", "64"]), file).unwrap();
        assert_eq!(config.mode, Mode::Mixed);

        let mixed = config.mixed_settings();
        assert_eq!(mixed.clients, 64);
        assert_eq!(mixed.payload, PayloadSize::Uniform { min: 4, max: 200 });
        assert_eq!(mixed.max_rounds, 50);

        let file: TomlConfig = toml::from_str("[mixed]\nmax_rounds = 0").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());
    }

    #[test]
    fn test_validation() {
        let err = Config::merge(cli(&["--batch-size", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let file: TomlConfig = toml::from_str("[throughput]\nsizes = []").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());

        let file: TomlConfig = toml::from_str("[ramp]\nmin_msg_len = 10\nmax_msg_len = 5").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());
    }
}
