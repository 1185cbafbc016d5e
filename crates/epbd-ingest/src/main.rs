//! EPBD Ingest - keeps a Postgres copy of the EPBD registry up to date

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use epbd_common::logging::{init_logging, LogConfig, LogLevel};
use epbd_ingest::config::{
    default_mutation_date, DatabaseConfig, FeedConfig, DEFAULT_CHUNK_SIZE, DEFAULT_DB_PORT,
    DEFAULT_FEED_ENDPOINT,
};
use epbd_ingest::feed::EpOnlineFeed;
use epbd_ingest::mutation::{ReconcileStatus, Reconciler, DEFAULT_MAX_LOOKBACK_DAYS};
use epbd_ingest::storage::PgStore;
use epbd_ingest::total::{load_total, read_export};
use epbd_ingest::IngestError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "epbd-ingest")]
#[command(author, version, about = "Load and update an EPBD energy-label database")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Also write logs to this file
    #[arg(long, global = true, env = "EPBD_LOGFILE")]
    logfile: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply daily mutation files, reconciling the sequence when files are missing
    Update {
        #[command(flatten)]
        database: DatabaseArgs,

        /// EP-Online user name
        #[arg(long, env = "EPBD_FEED_USER")]
        feed_user: String,

        /// EP-Online password
        #[arg(long, env = "EPBD_FEED_PASSWORD", hide_env_values = true)]
        feed_password: String,

        /// Mutation date (YYYY-MM-DD); defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Apply the date's file without checking its sequence number
        #[arg(long)]
        force: bool,

        /// SOAP endpoint of the download service
        #[arg(long, env = "EPBD_FEED_ENDPOINT", default_value = DEFAULT_FEED_ENDPOINT)]
        endpoint: String,

        /// Most days to walk back looking for a missing mutation file
        #[arg(long, default_value_t = DEFAULT_MAX_LOOKBACK_DAYS)]
        max_lookback_days: u32,
    },

    /// Create the tables and load the full EPBD export (XML or zip)
    Total {
        #[command(flatten)]
        database: DatabaseArgs,

        /// Path of the export
        path: PathBuf,

        /// Records per transaction
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

#[derive(Args, Debug)]
struct DatabaseArgs {
    /// Database host
    #[arg(long, env = "EPBD_DB_HOST")]
    host: String,

    /// Database name
    #[arg(long, env = "EPBD_DB_NAME")]
    dbname: String,

    /// Schema holding the certificate table
    #[arg(long, env = "EPBD_DB_SCHEMA")]
    schema: String,

    /// Certificate table
    #[arg(long, env = "EPBD_DB_TABLE")]
    table: String,

    /// Database user
    #[arg(long, env = "EPBD_DB_USER")]
    db_user: String,

    /// Database password
    #[arg(long, env = "EPBD_DB_PASSWORD", hide_env_values = true, default_value = "")]
    db_password: String,

    /// Database port
    #[arg(long, env = "EPBD_DB_PORT", default_value_t = DEFAULT_DB_PORT)]
    port: u16,
}

impl DatabaseArgs {
    fn to_config(&self) -> DatabaseConfig {
        DatabaseConfig::new(&self.host, &self.dbname, &self.schema, &self.table)
            .with_port(self.port)
            .with_credentials(&self.db_user, &self.db_password)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut log_builder = match LogConfig::from_env() {
        Ok(config) => config.into_builder(),
        Err(e) => {
            eprintln!("Error: invalid logging environment: {:#}", e);
            return ExitCode::FAILURE;
        },
    };
    if cli.verbose {
        log_builder = log_builder.level(LogLevel::Debug);
    }
    if let Some(ref path) = cli.logfile {
        log_builder = log_builder.log_file(path.clone());
    }
    let log_config = log_builder.build();

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let fatal = e
                .downcast_ref::<IngestError>()
                .is_some_and(IngestError::is_fatal);
            error!(error = %format!("{:#}", e), fatal, "Command failed");
            if fatal {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Update {
            database,
            feed_user,
            feed_password,
            date,
            force,
            endpoint,
            max_lookback_days,
        } => {
            let feed_config = FeedConfig::new(feed_user, feed_password).with_endpoint(endpoint);
            let feed = EpOnlineFeed::new(feed_config).context("Invalid feed configuration")?;
            let store = PgStore::connect(&database.to_config())
                .await
                .context("Failed to connect to database")?;

            let date = date.unwrap_or_else(default_mutation_date);
            let report = Reconciler::new(feed, store)
                .force(force)
                .max_lookback_days(max_lookback_days)
                .reconcile(date)
                .await?;

            match report.status {
                ReconcileStatus::Applied => info!(
                    applied = report.applied.len(),
                    last_sequence = ?report.final_sequence(),
                    "Database updated"
                ),
                ReconcileStatus::UpToDate { sequence } => {
                    info!(sequence, "Database already up to date")
                },
                ReconcileStatus::StoreAhead { store, feed } => {
                    info!(store, feed, "Database is ahead of the requested mutation")
                },
                ReconcileStatus::NotPublished => {
                    warn!(date = %date, "No mutation file available; nothing applied")
                },
            }
            Ok(())
        },
        Command::Total {
            database,
            path,
            chunk_size,
        } => {
            info!(path = %path.display(), chunk_size, "Loading full EPBD export");
            let payload = read_export(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let store = PgStore::connect(&database.to_config())
                .await
                .context("Failed to connect to database")?;

            let stats = load_total(&payload, &store, chunk_size).await?;
            info!(
                records = stats.records,
                chunks = stats.chunks,
                sequence = stats.sequence,
                "Database loaded"
            );
            Ok(())
        },
    }
}
