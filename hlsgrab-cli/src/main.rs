mod cli;
mod config;
mod error;

use std::process;

use clap::Parser;
use hlsgrab_engine::{BatchManifest, BatchOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{cli::Args, config::AppConfig, error::Result};

/// Every job completed.
const EXIT_OK: i32 = 0;
/// Unusable input or configuration.
const EXIT_FATAL: i32 = 1;
/// The report lists at least one failed job.
const EXIT_JOB_FAILURES: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(EXIT_FATAL);
    }

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(EXIT_FATAL);
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = AppConfig::load(args.config.as_deref())?.into_batch_config(&args)?;

    let manifest = match (&args.url, &args.batch) {
        (_, Some(path)) => BatchManifest::load(path).await?,
        (Some(url), None) => BatchManifest::single(url.clone()),
        (None, None) => BatchManifest::default(),
    };

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running downloads");
            ctrl_c_token.cancel();
        }
    });

    let orchestrator = BatchOrchestrator::new(config)?.with_cancellation(token);
    let report = orchestrator.run(manifest).await;
    let report_path = report.write_to(&orchestrator.config().output_dir).await?;
    info!(path = %report_path.display(), "Report written");

    Ok(if report.all_succeeded() {
        EXIT_OK
    } else {
        EXIT_JOB_FAILURES
    })
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .try_init()
        .map_err(|e| crate::error::AppError::Logging(e.to_string()))
}
