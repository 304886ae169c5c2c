use beach_connector::cli::Cli;
use beach_connector::config::ConnectorConfig;
use beach_connector::error::StartupError;
use beach_connector::{app, shutdown, telemetry};
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = ConnectorConfig::load(cli.config.as_deref(), cli.overrides())?;
    telemetry::logging::init(&config.log)?;
    let shutdown = shutdown::install().map_err(StartupError::Signals)?;
    app::run(config, shutdown).await
}
