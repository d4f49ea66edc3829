//! Error types for auditpart using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// Every read strategy for an object failed.
    #[snafu(display("Unable to read {path} after {attempts} attempts and chunked fallback"))]
    ReadExhausted {
        path: String,
        attempts: u32,
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            StorageError::ReadExhausted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Source path is empty.
    #[snafu(display("Source path cannot be empty"))]
    EmptySourcePath,

    /// Sink path is empty.
    #[snafu(display("Sink path cannot be empty"))]
    EmptySinkPath,

    /// State path is empty.
    #[snafu(display("State path cannot be empty"))]
    EmptyStatePath,

    /// A numeric setting that must be positive was zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroValue { field: &'static str },

    /// The delimiter must be exactly one character and not a quote.
    #[snafu(display("Invalid delimiter {delimiter:?}: expected a single non-quote character"))]
    InvalidDelimiter { delimiter: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ State Errors ============

/// Errors raised by the process-state store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StateError {
    /// Underlying storage failed.
    #[snafu(display("State storage failed for key {key}"))]
    StateStorage { key: String, source: StorageError },

    /// A persisted value could not be decoded.
    #[snafu(display("Persisted state {key} is not valid JSON"))]
    StateDecode {
        key: String,
        source: serde_json::Error,
    },

    /// A value could not be encoded.
    #[snafu(display("Failed to encode state {key}"))]
    StateEncode {
        key: String,
        source: serde_json::Error,
    },
}

// ============ Sheet Errors ============

/// Errors raised by the bounded working sheet.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SheetError {
    /// A block would exceed the sheet's cell capacity.
    #[snafu(display(
        "Sheet {name} cannot hold {rows} rows x {columns} columns (max {max_cells} cells)"
    ))]
    SheetCapacity {
        name: String,
        rows: usize,
        columns: usize,
        max_cells: usize,
    },

    /// A block's width does not match the sheet.
    #[snafu(display("Block row {row} has {actual} cells, sheet {name} expects {expected}"))]
    BlockShape {
        name: String,
        row: usize,
        expected: usize,
        actual: usize,
    },

    /// A block was written at a row that leaves a gap.
    #[snafu(display("Block for sheet {name} starts at row {start}, next free row is {next}"))]
    BlockOffset {
        name: String,
        start: usize,
        next: usize,
    },

    /// The sink cap computed from max cells is zero.
    #[snafu(display("max_cells {max_cells} leaves no data rows for {columns} columns"))]
    NoCapacity { max_cells: usize, columns: usize },
}

// ============ Parquet Errors ============

/// Errors that can occur during Parquet export.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParquetError {
    /// Parquet write error.
    #[snafu(display("Parquet write error"))]
    Write {
        source: parquet::errors::ParquetError,
    },

    /// Failed to create Parquet writer.
    #[snafu(display("Failed to create Parquet writer"))]
    WriterCreate {
        source: parquet::errors::ParquetError,
    },

    /// Failed to read an existing Parquet footer.
    #[snafu(display("Failed to read Parquet metadata of {path}"))]
    FooterRead {
        path: String,
        source: parquet::errors::ParquetError,
    },

    /// Arrow batch construction failed.
    #[snafu(display("Failed to build record batch"))]
    Batch { source: arrow::error::ArrowError },

    /// Buffer lock error (mutex poisoned).
    #[snafu(display("Buffer lock failed: mutex poisoned"))]
    BufferLock,

    /// Buffer has outstanding references and cannot be consumed.
    #[snafu(display("Buffer has outstanding references"))]
    BufferInUse,
}

// ============ Bad-line Errors ============

/// Errors that can occur while recording rejected lines.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum BadLineError {
    /// Failed to write a bad-line generation.
    #[snafu(display("Failed to write bad-line generation {generation}"))]
    BadLineWrite {
        generation: u64,
        source: StorageError,
    },

    /// Failed to serialize a bad-line entry.
    #[snafu(display("Failed to serialize bad-line entry"))]
    BadLineSerialize { source: serde_json::Error },

    /// Failed to create bad-line storage provider.
    #[snafu(display("Failed to create bad-line storage"))]
    BadLineStorage { source: StorageError },

    /// Failed to persist the generation cursor.
    #[snafu(display("Failed to persist bad-line cursor"))]
    BadLineCursor { source: StateError },

    /// Failed to load or persist the recorded-source markers.
    #[snafu(display("Failed to update bad-line markers"))]
    BadLineMarkers { source: StateError },
}

// ============ Schedule Errors ============

/// Errors raised by the deferred scheduler.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScheduleError {
    /// The trigger store failed.
    #[snafu(display("Failed to update trigger for handler {handler}"))]
    TriggerStore { handler: String, source: StateError },
}

// ============ Lease Errors ============

/// Errors raised while acquiring or releasing the invocation lease.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LeaseError {
    /// Lease storage failed.
    #[snafu(display("Lease storage failed"))]
    LeaseStorage { source: StorageError },

    /// Lease content could not be decoded or encoded.
    #[snafu(display("Lease record is not valid JSON"))]
    LeaseJson { source: serde_json::Error },

    /// Another holder owns an unexpired lease.
    #[snafu(display("Lease held by {holder} after {attempts} attempts"))]
    LeaseHeld { holder: String, attempts: u32 },

    /// The lease expired and is now owned by someone else.
    #[snafu(display("Lease lost to {holder}"))]
    LeaseLost { holder: String },
}

impl LeaseError {
    /// Check if the lease is held by another invocation.
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseError::LeaseHeld { .. })
    }

    /// Check if a held lease was broken by another invocation.
    pub fn is_lost(&self) -> bool {
        matches!(self, LeaseError::LeaseLost { .. })
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Process-state error.
    #[snafu(display("State error"))]
    State { source: StateError },

    /// Working sheet error.
    #[snafu(display("Sheet error"))]
    Sheet { source: SheetError },

    /// Parquet error.
    #[snafu(display("Parquet error"))]
    Parquet { source: ParquetError },

    /// Bad-line sink error.
    #[snafu(display("Bad-line sink error"))]
    BadLines { source: BadLineError },

    /// Scheduler error.
    #[snafu(display("Scheduler error"))]
    Schedule { source: ScheduleError },

    /// Lease error.
    #[snafu(display("Lease error"))]
    Lease { source: LeaseError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Two queued sources map to the same output part names.
    #[snafu(display("Sources {first} and {second} share output base {base}"))]
    OutputBaseCollision {
        base: String,
        first: String,
        second: String,
    },

    /// The source produced fewer rows than the persisted job expects.
    #[snafu(display(
        "Source {path} yielded {available} rows but job cursor needs {required}; file changed since job creation"
    ))]
    SourceChanged {
        path: String,
        available: usize,
        required: usize,
    },
}

impl PipelineError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            PipelineError::PipelineStorage { source } => source.is_not_found(),
            _ => false,
        }
    }

    /// Check if the invocation lost its lease while running.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, PipelineError::Lease { source } if source.is_lost())
    }
}
