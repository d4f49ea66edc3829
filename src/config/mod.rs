//! Configuration loading and validation.
//!
//! Loads the pipeline configuration from a YAML file with environment
//! variable interpolation. The resulting [`Config`] is immutable and passed
//! into the pipeline at construction.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptySinkPathSnafu, EmptySourcePathSnafu, EmptyStatePathSnafu,
    EnvInterpolationSnafu, InvalidDelimiterSnafu, ReadFileSnafu, YamlParseSnafu, ZeroValueSnafu,
};

pub use vars::{InterpolationResult, interpolate};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where input audit logs are listed and read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Location of the input files.
    /// Examples: "s3://bucket/audit/inbox", "/data/inbox", "memory://inbox"
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// File name suffixes considered input files (case-insensitive).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Field delimiter (default: "|").
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Objects larger than this are read with ranged requests instead of a single GET.
    #[serde(default = "default_max_direct_read_bytes")]
    pub max_direct_read_bytes: usize,

    /// Size of each ranged request in the chunked read path.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl SourceConfig {
    /// The delimiter as a single character (validated on load).
    pub fn delimiter_char(&self) -> char {
        self.delimiter.chars().next().unwrap_or('|')
    }

    /// Whether a listed path looks like an input file.
    pub fn accepts(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        self.extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }
}

fn default_extensions() -> Vec<String> {
    [".txt", ".csv", ".log", ".psv"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_delimiter() -> String {
    "|".to_string()
}

fn default_max_direct_read_bytes() -> usize {
    256 * MB
}

fn default_read_chunk_bytes() -> usize {
    8 * MB
}

/// Where output parts are exported and how large they may be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Output location for Parquet parts.
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Hard cell capacity of one working sheet (default: 10,000,000).
    #[serde(default = "default_max_cells")]
    pub max_cells: usize,

    /// Policy chunk size: maximum data rows per part (default: 50,000).
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,

    /// Maximum rows per block write into the working sheet (default: 5,000).
    #[serde(default = "default_write_block_rows")]
    pub write_block_rows: usize,

    /// Parquet compression codec.
    #[serde(default)]
    pub compression: ParquetCompression,
}

fn default_max_cells() -> usize {
    10_000_000
}

fn default_chunk_rows() -> usize {
    50_000
}

fn default_write_block_rows() -> usize {
    5_000
}

/// Location of the process-state store (job, queue, triggers, lease).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub path: String,

    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Per-invocation job limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Rows emitted per invocation before the job pauses (default: 30,000).
    #[serde(default = "default_row_budget")]
    pub row_budget: usize,

    /// Lifetime of the invocation lease (default: 900s).
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            row_budget: default_row_budget(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_row_budget() -> usize {
    30_000
}

fn default_lease_ttl_secs() -> u64 {
    900
}

impl JobConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Delays used by the scheduler glue and the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Delay before resuming a paused job (default: 60s).
    #[serde(default = "default_resume_delay_secs")]
    pub resume_delay_secs: u64,

    /// Delay before retrying a failed invocation (default: 30s).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Period of the watchdog check (default: 600s).
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// Delay of a resume armed by the watchdog (default: 15s).
    #[serde(default = "default_watchdog_repair_delay_secs")]
    pub watchdog_repair_delay_secs: u64,

    /// How often `serve` checks for due triggers (default: 5s).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            resume_delay_secs: default_resume_delay_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            watchdog_repair_delay_secs: default_watchdog_repair_delay_secs(),
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_resume_delay_secs() -> u64 {
    60
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_watchdog_interval_secs() -> u64 {
    600
}

fn default_watchdog_repair_delay_secs() -> u64 {
    15
}

fn default_tick_secs() -> u64 {
    5
}

/// Phrases that classify a message as a session boundary (case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_start_phrases")]
    pub start_phrases: Vec<String>,

    #[serde(default = "default_end_phrases")]
    pub end_phrases: Vec<String>,

    #[serde(default = "default_auto_end_phrases")]
    pub auto_end_phrases: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_phrases: default_start_phrases(),
            end_phrases: default_end_phrases(),
            auto_end_phrases: default_auto_end_phrases(),
        }
    }
}

fn default_start_phrases() -> Vec<String> {
    vec!["checked out".to_string()]
}

fn default_end_phrases() -> Vec<String> {
    vec!["checked in".to_string()]
}

fn default_auto_end_phrases() -> Vec<String> {
    [
        "automatically checked in",
        "auto checked in",
        "auto check-in",
        "auto-checked in",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Error handling configuration for resilient pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Location for rejected-line generations. Bad lines are dropped when unset.
    #[serde(default)]
    pub bad_lines_path: Option<String>,

    /// Storage options for the bad-line location.
    #[serde(default)]
    pub bad_lines_storage_options: HashMap<String, String>,

    /// Entries per bad-line generation before rolling (default: 50,000).
    #[serde(default = "default_bad_lines_capacity")]
    pub bad_lines_capacity: usize,

    /// Attempts for a transient storage operation (default: 4).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds (default: 500).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds (default: 8,000).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            bad_lines_path: None,
            bad_lines_storage_options: HashMap::new(),
            bad_lines_capacity: default_bad_lines_capacity(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_bad_lines_capacity() -> usize {
    50_000
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

/// Execution log location. Events only go to tracing when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served by `serve` (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating environment variables.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let result = interpolate(content);
        if !result.is_ok() {
            return EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
            .fail();
        }

        let config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.path.is_empty(), EmptySourcePathSnafu);
        ensure!(!self.sink.path.is_empty(), EmptySinkPathSnafu);
        ensure!(!self.state.path.is_empty(), EmptyStatePathSnafu);

        let mut chars = self.source.delimiter.chars();
        let valid_delimiter = matches!((chars.next(), chars.next()), (Some(c), None) if c != '"');
        ensure!(
            valid_delimiter,
            InvalidDelimiterSnafu {
                delimiter: self.source.delimiter.clone()
            }
        );

        for (field, value) in [
            ("sink.max_cells", self.sink.max_cells),
            ("sink.chunk_rows", self.sink.chunk_rows),
            ("sink.write_block_rows", self.sink.write_block_rows),
            ("source.read_chunk_bytes", self.source.read_chunk_bytes),
            ("job.row_budget", self.job.row_budget),
            (
                "error_handling.bad_lines_capacity",
                self.error_handling.bad_lines_capacity,
            ),
        ] {
            ensure!(value > 0, ZeroValueSnafu { field });
        }
        ensure!(
            self.error_handling.max_attempts > 0,
            ZeroValueSnafu {
                field: "error_handling.max_attempts"
            }
        );
        ensure!(
            self.schedule.tick_secs > 0,
            ZeroValueSnafu {
                field: "schedule.tick_secs"
            }
        );
        Ok(())
    }

    /// Minimal configuration for the given locations with every default applied.
    pub fn with_paths(source: &str, sink: &str, state: &str) -> Self {
        Self {
            source: SourceConfig {
                path: source.to_string(),
                storage_options: HashMap::new(),
                extensions: default_extensions(),
                delimiter: default_delimiter(),
                max_direct_read_bytes: default_max_direct_read_bytes(),
                read_chunk_bytes: default_read_chunk_bytes(),
            },
            sink: SinkConfig {
                path: sink.to_string(),
                storage_options: HashMap::new(),
                max_cells: default_max_cells(),
                chunk_rows: default_chunk_rows(),
                write_block_rows: default_write_block_rows(),
                compression: ParquetCompression::default(),
            },
            state: StateConfig {
                path: state.to_string(),
                storage_options: HashMap::new(),
            },
            job: JobConfig::default(),
            schedule: ScheduleConfig::default(),
            sessions: SessionConfig::default(),
            error_handling: ErrorHandlingConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
