//! Main entry point for the ferrogql CLI.

use clap::Parser;
use ferrogql_cli::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.default_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = ferrogql_cli::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
