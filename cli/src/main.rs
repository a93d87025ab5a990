use clap::Parser;
use dvtool::commands::{self, Cli};
use dvtool::config::load_config;
use dvtool::logger::setup_logger;
use dvtool::AppError;
use std::process::ExitCode;

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    if let Err(e) = setup_logger(config.logging()) {
        eprintln!("Warning: Failed to initialize logger: {e}");
    }

    match commands::run(cli, config).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(AppError::Auth(e)) if e.is_cancellation() => Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(AppError::Auth(e)) => {
            eprintln!("Error: {}", e.user_message());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
