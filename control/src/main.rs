use anyhow::Result;
use clap::Parser;

mod aggregator;
mod args;
mod cli;
mod db;
mod emitter;
mod error;
mod handlers;
mod identity;
mod metrics;
mod models;
mod nodepool_db;
mod nodepool_handlers;
mod schedule_db;
mod scheduler;
mod server;
mod status_db;
mod status_handlers;
mod status_models;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    flotilla_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => server::run_server(args).await,
        Commands::Health(args) => cli::run_health(args).await,
    }
}
