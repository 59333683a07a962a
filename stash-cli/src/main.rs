use std::time::Duration;

use clap::Parser;
use stash_engine::{AssetManager, StashConfig};
use tracing::{Level, debug, error};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod commands;
mod error;
mod utils;

use cli::{CliArgs, Command};
use error::AppError;
use utils::{parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    init_logging(&args)?;

    let config = build_config(&args)?;
    debug!(cache_dir = ?config.cache_dir(), "Configuration loaded");
    let manager = AssetManager::new(config).await?;

    let result = match &args.command {
        Command::Fetch { urls } => commands::fetch(&manager, urls).await,
        Command::Prefetch { urls } => commands::prefetch(&manager, urls).await,
        Command::Path { urls } => {
            commands::paths(&manager, urls);
            Ok(())
        }
        Command::Stats => commands::stats(&manager),
        Command::Flush => commands::flush(&manager).await,
        Command::ClearIndex { yes } => commands::clear_index(&manager, *yes).await,
    };

    manager.shutdown().await;
    result
}

fn init_logging(args: &CliArgs) -> Result<(), AppError> {
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    // Logs go to stderr so command output on stdout stays parseable.
    let writer = match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(MakeWriterExt::and(std::io::stderr, log_file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(args.log_file.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))
}

fn build_config(args: &CliArgs) -> Result<StashConfig, AppError> {
    let mut builder = StashConfig::builder()
        .with_max_memory_bytes(parse_size(&args.max_memory)?)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));

    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    for host in &args.self_signed_hosts {
        builder = builder.with_self_signed_host(host);
    }
    for (name, value) in parse_headers(&args.headers) {
        builder = builder.with_header(name, value);
    }
    Ok(builder.build())
}
