mod config;
mod observability;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError};
use ingest_relay::config::ValidationError;
use ingest_relay::errors::RelayError;
use observability::ObservabilityError;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "tracktime", about = "Activity ingestion relay")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Accept activity payloads over HTTP
    Server(CliArgs),
    /// Copy records from the topic into the database
    Consumer(CliArgs),
}

#[derive(clap::Args)]
struct CliArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Observability(#[from] ObservabilityError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli_main(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tracktime exited with an error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cli_main(cli: Cli) -> Result<(), CliError> {
    let (args, is_consumer) = match &cli.command {
        CliCommand::Server(args) => (args, false),
        CliCommand::Consumer(args) => (args, true),
    };

    let mut config = Config::from_file(&args.config_file_path)?;
    config.relay.apply_env(|name| std::env::var(name).ok());

    let _sentry_guard = observability::init_logging(&config.logging.clone().unwrap_or_default())?;

    if is_consumer {
        config.relay.validate_consumer()?;
    } else {
        config.relay.validate()?;
    }

    if let Some(metrics) = &config.metrics {
        observability::init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        if is_consumer {
            tracing::info!("Starting consumer");
            ingest_relay::run_consumer(config.relay, shutdown_signal()).await
        } else {
            tracing::info!("Starting server");
            ingest_relay::run_server(config.relay, shutdown_signal()).await
        }
    })?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received ctrl-c");
}
