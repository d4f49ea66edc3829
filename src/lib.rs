//! auditpart: resumable export of pipe-delimited audit logs to Parquet parts.
//!
//! Audit-log files are parsed into fixed-arity records, enriched with
//! derived fields, correlated into checkout/checkin sessions and written as
//! size-bounded Parquet parts. Work is split across many short invocations,
//! each bounded by a row budget; progress is persisted after every part so a
//! file is never exported twice.
//!
//! # Example
//!
//! ```ignore
//! use auditpart::error::{ConfigSnafu, PipelineError};
//! use auditpart::{Config, Pipeline};
//! use snafu::ResultExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("auditpart.yaml").context(ConfigSnafu)?;
//!     let pipeline = Pipeline::new(config).await?;
//!     pipeline.start().await?;
//!     let outcome = pipeline.resume().await?;
//!     println!("{outcome}");
//!     Ok(())
//! }
//! ```

pub mod badlines;
pub mod config;
pub mod enrich;
pub mod error;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod parse;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod runlog;
pub mod schedule;
pub mod session;
pub mod signal;
pub mod sink;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod watchdog;

// Re-export main types
pub use config::Config;
pub use pipeline::{InvocationOutcome, Pipeline, StartReport, StatusReport};
pub use schedule::ScheduleDriver;
pub use storage::{StorageProvider, StorageProviderRef};
pub use telemetry::init_tracing;
pub use watchdog::WatchdogOutcome;
