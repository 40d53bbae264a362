//! Nutri Ingest - Main entry point

use clap::Parser;
use nutri_common::env;
use nutri_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use nutri_ingest::commands::ingest::{self, Target};
use nutri_ingest::commands::{fdc, merge, migrate, reindex};
use nutri_ingest::pipeline::{EXIT_COMPLETED, EXIT_SETUP_FAILED};
use nutri_ingest::{Cli, Commands, SinkKind};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env::load_dotenv();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("nutri-ingest")
        .build();

    // Environment variables take precedence over the flags
    let log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring invalid logging settings: {e}");
            log_config
        },
    };

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        },
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match execute_command(cli, cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_SETUP_FAILED)
        },
    }
}

/// Cancel the run on the first Ctrl-C
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping after in-flight batches");
                cancel.cancel();
            },
            Err(e) => warn!(error = %e, "Could not listen for interrupts"),
        }
    });
}

/// Execute the command; returns the process exit status
async fn execute_command(cli: Cli, cancel: CancellationToken) -> anyhow::Result<u8> {
    match cli.command {
        Commands::MyFoodData {
            file,
            skip_rows,
            dry_run,
            pipeline,
        } => {
            let target = Target::from_flags(SinkKind::Database, None, None, dry_run);
            let report = ingest::myfooddata(&file, skip_rows, target, &pipeline, cancel).await?;
            Ok(report.exit_code())
        },

        Commands::OpenFoodFacts {
            file,
            sink,
            api_url,
            token,
            dry_run,
            pipeline,
        } => {
            let target = Target::from_flags(sink, api_url, token, dry_run);
            let report = ingest::openfoodfacts(&file, target, &pipeline, cancel).await?;
            Ok(report.exit_code())
        },

        Commands::Fdc {
            dir,
            stage,
            dry_run,
            pipeline,
        } => {
            let outcome = fdc::run(&dir, stage, dry_run, &pipeline, cancel).await?;
            Ok(outcome.exit_code())
        },

        Commands::MergeDuplicates { dry_run } => {
            merge::run(dry_run).await?;
            Ok(EXIT_COMPLETED)
        },

        Commands::Migrate => {
            migrate::run().await?;
            Ok(EXIT_COMPLETED)
        },

        Commands::Reindex { es_url, index } => {
            let indexed = reindex::run(es_url, index).await?;
            info!(indexed, "Reindex finished");
            Ok(EXIT_COMPLETED)
        },
    }
}
