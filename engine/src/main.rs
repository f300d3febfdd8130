// Analyst query engine
// Main entry point for the analyst binary

use analyst_engine::cli::{CacheAction, Cli, Command};
use analyst_engine::config::Config;
use analyst_engine::handlers::{
    handle_ask, handle_cache_lookup, handle_cache_prune, handle_cache_stats, handle_doctor,
    OutputFormat,
};
use analyst_engine::telemetry::{init_telemetry, init_telemetry_with_level};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    match &cli.log {
        Some(level) => init_telemetry_with_level(level),
        None => init_telemetry(),
    }

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Analyst Engine v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Re-initialize telemetry with config-driven log level
    // (only takes effect if RUST_LOG env var is not set and --log was not given)
    if cli.log.is_none() {
        init_telemetry_with_level(&config.core.log_level);
    }

    // Handle commands
    match cli.command {
        Command::Ask { query, session } => {
            tracing::debug!("Answering query for session {}", session);
            handle_ask(query, session, &config, format).await
        }

        Command::Cache { action } => match action {
            CacheAction::Stats => handle_cache_stats(&config, format).await,
            CacheAction::Prune => handle_cache_prune(&config, format).await,
            CacheAction::Lookup { query } => handle_cache_lookup(query, &config, format).await,
        },

        Command::Doctor => handle_doctor(&config, format).await,
    }
}
