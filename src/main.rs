//! provision CLI entrypoint

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use provision::cli::Cli;
use provision::domain::SETUP_FAILURE_EXIT;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    match cli.execute().await {
        Ok(code) => code,
        Err(e) => {
            // Plan, config or lock problems: nothing was applied
            eprintln!("Error: {:#}", e);
            ExitCode::from(SETUP_FAILURE_EXIT)
        }
    }
}
