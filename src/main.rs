// ABOUTME: CLI entry point for pg-bisync
// ABOUTME: Parses commands, builds the sync configuration and prints JSON results

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pg_bisync::{BidirectionalSync, FailureMode, SyncConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pg-bisync")]
#[command(about = "Bidirectional row sync between two PostgreSQL databases", long_about = None)]
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
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    /// Local database connection string
    #[arg(long, env = "LOCAL_DATABASE_URL", hide_env_values = true)]
    local: String,
    /// Peer database connection string
    #[arg(long, env = "PEER_DATABASE_URL", hide_env_values = true)]
    peer: String,
    /// Path to a TOML sync configuration file
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// Schema to sync (overrides the config file)
    #[arg(long)]
    schema: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one bidirectional sync pass
    Sync {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Rows per INSERT statement
        #[arg(long)]
        batch_size: Option<usize>,
        /// Record failing tables and keep going instead of aborting
        #[arg(long)]
        continue_on_error: bool,
        /// Select rows without writing them or resetting sequences
        #[arg(long)]
        dry_run: bool,
        /// Per-statement timeout in seconds
        #[arg(long = "statement-timeout")]
        statement_timeout: Option<u64>,
        /// Write the JSON result to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show how one table would be synced
    Inspect {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Table to inspect
        #[arg(long)]
        table: String,
    },
}

fn load_config(connection: &ConnectionArgs) -> anyhow::Result<SyncConfig> {
    let mut config = match &connection.config_path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(schema) = &connection.schema {
        config.schema = schema.clone();
    }
    Ok(config)
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))
                .with_context(|| format!("Failed to write result to {:?}", path))?;
            tracing::info!("Result written to {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Received Ctrl+C, cancelling sync");
                token.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log. Logs go to stderr so stdout stays JSON.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    pg_bisync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Sync {
            connection,
            batch_size,
            continue_on_error,
            dry_run,
            statement_timeout,
            output,
        } => {
            pg_bisync::utils::validate_connection_string(&connection.local)
                .context("Invalid --local connection string")?;
            pg_bisync::utils::validate_connection_string(&connection.peer)
                .context("Invalid --peer connection string")?;

            let mut config = load_config(&connection)?;
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if continue_on_error {
                config.failure_mode = FailureMode::Continue;
            }
            if dry_run {
                config.dry_run = true;
            }
            if statement_timeout.is_some() {
                config.statement_timeout_secs = statement_timeout;
            }

            let sync = BidirectionalSync::new(connection.local, connection.peer, config);
            let result = sync.run(&cancel).await?;
            write_json(&result, output.as_ref())?;

            if !result.is_success() {
                anyhow::bail!(
                    "{} table(s) failed to sync; see failedTables in the result",
                    result.failed_tables.len()
                );
            }
        }
        Commands::Inspect { connection, table } => {
            pg_bisync::utils::validate_connection_string(&connection.local)
                .context("Invalid --local connection string")?;
            pg_bisync::utils::validate_connection_string(&connection.peer)
                .context("Invalid --peer connection string")?;

            let config = load_config(&connection)?;
            let sync = BidirectionalSync::new(connection.local, connection.peer, config);
            let report = sync.inspect_table(&table, &cancel).await?;
            write_json(&report, None)?;
        }
    }

    Ok(())
}
