mod args;
mod handlers;
mod utils;

use std::process::ExitCode;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands};
use crate::handlers::{
    handle_clear, handle_flush_cache, handle_flush_locks, handle_status, load_config,
};
use crate::utils::{StatusType, print_status_msg};

const DEBUG_ENV: &str = "LOCKCACHE_DEBUG";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            print_status_msg(StatusType::Error, &format!("{error:#}"));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = if std::env::var(DEBUG_ENV).is_ok_and(|value| value == "true") {
        LevelFilter::DEBUG
    } else {
        cli.verbose.tracing_level_filter()
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let lock_and_cache = lockcache::LockAndCache::from_config(&config)?;

    match &cli.command {
        Commands::Status(args) => handle_status(&lock_and_cache, args).await,
        Commands::Clear(args) => handle_clear(&lock_and_cache, args).await,
        Commands::FlushCache(args) => handle_flush_cache(&lock_and_cache, args).await,
        Commands::FlushLocks(args) => handle_flush_locks(&lock_and_cache, args).await,
    }
}
