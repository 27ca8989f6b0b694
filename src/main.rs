// ABOUTME: CLI entry point for watermark-replicator
// ABOUTME: Parses commands and routes to run, seed, status and init-schema

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use watermark_replicator::backend::{open_source, open_target};
use watermark_replicator::config::{load_sync_config_from_file, SyncConfig, WatermarkConfig};
use watermark_replicator::lock::RunLock;
use watermark_replicator::sync::{
    parse_marker, seed, MarkerChange, SeedOutcome, SyncDaemon, SyncRunner, WatermarkStore,
};

#[derive(Parser)]
#[command(name = "watermark-replicator")]
#[command(about = "Incremental table sync driven by a last_modified watermark", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the sync job TOML file
    #[arg(
        long,
        global = true,
        env = "WATERMARK_REPLICATOR_CONFIG",
        default_value = "watermark-replicator.toml"
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync rows changed since the stored watermark
    Run {
        /// Override source_name from the config file
        #[arg(long)]
        source_name: Option<String>,
        /// Run a single sync and exit (default: repeat every interval_secs)
        #[arg(long)]
        once: bool,
    },
    /// Set the starting watermark before the first run
    Seed {
        /// Marker as RFC 3339 timestamp or YYYY-MM-DD
        #[arg(long)]
        marker: String,
        /// Override source_name from the config file
        #[arg(long)]
        source_name: Option<String>,
        /// Overwrite an existing watermark, even moving it backwards
        #[arg(long)]
        force: bool,
    },
    /// Show the stored watermark, pending source changes and destination row count
    Status {
        /// Override source_name from the config file
        #[arg(long)]
        source_name: Option<String>,
    },
    /// Create destination and watermark tables if they do not exist
    InitSchema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Initialize TLS policy using thread-safe OnceLock
    watermark_replicator::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = load_sync_config_from_file(&cli.config)?;

    match cli.command {
        Commands::Run { source_name, once } => run(with_source_name(config, source_name)?, once).await,
        Commands::Seed {
            marker,
            source_name,
            force,
        } => seed_marker(with_source_name(config, source_name)?, &marker, force).await,
        Commands::Status { source_name } => status(with_source_name(config, source_name)?).await,
        Commands::InitSchema => init_schema(config).await,
    }
}

fn with_source_name(config: SyncConfig, source_name: Option<String>) -> anyhow::Result<SyncConfig> {
    let config = config.with_source_name(source_name);
    config.validate()?;
    Ok(config)
}

/// Run one sync, or keep syncing on an interval until Ctrl+C
async fn run(config: SyncConfig, once: bool) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(&config.lock_dir, &config.source_name)?;

    let source = open_source(&config.source).await?;
    let target = open_target(&config).await?;
    if !target.is_transactional() {
        tracing::info!("Watermark store is a state file; rows are applied before the marker is written");
    }

    let runner = SyncRunner::new(source, target, config.floor);
    let daemon_config = config.schedule.daemon_config();
    let interval = daemon_config.interval;
    let daemon = SyncDaemon::new(runner, &config.source_name, daemon_config);

    if once {
        tracing::info!("Running single sync for '{}'...", config.source_name);

        let outcome = daemon
            .run_once()
            .await
            .with_context(|| format!("Sync for '{}' failed", config.source_name))?;

        println!();
        println!("========================================");
        println!("Sync complete: {}", outcome.source_name);
        println!("========================================");
        println!("  Run ID: {}", outcome.run_id);
        println!("  Rows inserted: {}", outcome.inserted);
        println!("  Rows updated: {}", outcome.updated);
        match outcome.marker {
            MarkerChange::Advanced { from, to } => {
                println!(
                    "  Watermark: {} -> {}",
                    from.map(|m| m.to_rfc3339())
                        .unwrap_or_else(|| "(none)".to_string()),
                    to.to_rfc3339()
                );
            }
            MarkerChange::Unchanged(_) => println!("  Watermark: unchanged (no new rows)"),
        }
    } else {
        tracing::info!("Starting continuous sync daemon...");
        tracing::info!("Press Ctrl+C to stop");

        println!();
        println!("========================================");
        println!("Starting watermark sync: {}", config.source_name);
        println!("========================================");
        println!("  Sync interval: {}s", interval.as_secs());
        println!("  Press Ctrl+C to stop");
        println!();

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

        // Set up Ctrl+C handler
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        });

        let stats = daemon.run(shutdown_rx).await;

        println!();
        println!("========================================");
        println!("Watermark sync stopped");
        println!("========================================");
        println!("  Runs: {}", stats.runs);
        println!("  Failed runs: {}", stats.failed_runs);
        println!("  Rows applied: {}", stats.rows_applied);
    }

    Ok(())
}

/// Write a starting watermark out-of-band
async fn seed_marker(config: SyncConfig, marker: &str, force: bool) -> anyhow::Result<()> {
    let marker = parse_marker(marker).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid marker '{}': expected RFC 3339 (2024-01-10T00:00:00Z) or YYYY-MM-DD",
            marker
        )
    })?;

    let _lock = RunLock::acquire(&config.lock_dir, &config.source_name)?;
    let target = open_target(&config).await?;
    target
        .ensure_schema()
        .await
        .context("Failed to create watermark table")?;

    let outcome = seed(&target, &config.source_name, marker, force)
        .await
        .with_context(|| format!("Failed to seed watermark for '{}'", config.source_name))?;

    match outcome {
        SeedOutcome::Created => println!(
            "Watermark for '{}' set to {}",
            config.source_name,
            marker.to_rfc3339()
        ),
        SeedOutcome::Replaced { previous } => println!(
            "Watermark for '{}' changed from {} to {}",
            config.source_name,
            previous.to_rfc3339(),
            marker.to_rfc3339()
        ),
        SeedOutcome::Unchanged => println!(
            "Watermark for '{}' already at {}",
            config.source_name,
            marker.to_rfc3339()
        ),
    }
    Ok(())
}

/// Print the stored watermark and how many source rows are waiting
async fn status(config: SyncConfig) -> anyhow::Result<()> {
    let target = open_target(&config).await?;

    println!("Source: {}", config.source_name);
    match &config.watermark {
        WatermarkConfig::Table { table } => println!("Watermark store: table '{}'", table),
        WatermarkConfig::File { path } => println!("Watermark store: file {:?}", path),
    }

    let since = match target.get(&config.source_name).await {
        Ok(Some(marker)) => {
            println!("Watermark: {}", marker.to_rfc3339());
            Some(marker)
        }
        Ok(None) => {
            println!(
                "Watermark: not set, floor applies ({})",
                config.floor.to_rfc3339()
            );
            Some(config.floor)
        }
        // A missing watermark table means init-schema has not run yet
        Err(e) => {
            tracing::debug!("Failed to read watermark: {}", e);
            println!("Watermark: unavailable ({})", e);
            None
        }
    };

    if let Some(since) = since {
        let pending = match open_source(&config.source).await {
            Ok(source) => source.count_changed_since(since).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match pending {
            Ok(count) => println!("Pending changes: {}", count),
            Err(e) => println!("Pending changes: unavailable ({:#})", e),
        }
    }

    match target.row_count().await {
        Ok(rows) => println!("Destination rows: {}", rows),
        Err(e) => println!("Destination rows: unavailable ({})", e),
    }
    Ok(())
}

/// Create destination and watermark tables
async fn init_schema(config: SyncConfig) -> anyhow::Result<()> {
    let target = open_target(&config).await?;
    target
        .ensure_schema()
        .await
        .context("Failed to create destination schema")?;

    println!(
        "✓ Destination table '{}' is ready",
        config.destination.table
    );
    Ok(())
}
