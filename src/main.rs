//! auditpart CLI: drive the audit-log export pipeline.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;

use auditpart::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use auditpart::{Config, Pipeline, ScheduleDriver, init_tracing, metrics, signal};

/// Resumable export of audit logs to Parquet parts.
#[derive(Parser, Debug)]
#[command(name = "auditpart")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the file queue from the source and run the first invocation.
    Start,
    /// Run one budget-limited invocation of the current job.
    Resume,
    /// Re-arm a resume if work is pending without one.
    Watchdog,
    /// Deliver due resumes and run the watchdog until interrupted.
    Serve,
    /// Print the persisted job, queue and trigger state.
    Status,
    /// Drop job and queue state and cancel pending resumes.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), PipelineError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    info!(
        source = %config.source.path,
        sink = %config.sink.path,
        state = %config.state.path,
        "Configuration loaded"
    );

    let pipeline = Pipeline::new(config).await?;

    match args.command {
        Command::Start => {
            let Some(report) = pipeline.start().await? else {
                println!("BUSY");
                return Ok(());
            };
            println!("Queued {} file(s)", report.files);
            if report.first.is_some() {
                println!("{}", pipeline.resume().await?);
            }
        }
        Command::Resume => println!("{}", pipeline.resume().await?),
        Command::Watchdog => println!("{}", pipeline.watchdog().await?),
        Command::Status => {
            let report = pipeline.status().await?;
            match serde_json::to_string_pretty(&report) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{report:?}"),
            }
        }
        Command::Reset => {
            if pipeline.reset().await? {
                println!("RESET");
            } else {
                println!("BUSY");
            }
        }
        Command::Serve => serve(pipeline).await?,
    }

    Ok(())
}

async fn serve(pipeline: Pipeline) -> Result<(), PipelineError> {
    let metrics_config = pipeline.config().metrics.clone();
    if metrics_config.enabled {
        let addr = metrics_config.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    ScheduleDriver::new(Arc::new(pipeline))
        .run(shutdown)
        .await
}
