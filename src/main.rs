//! CLI entry point for the exam ranking engine.
//!
//! Provides subcommands for recomputing an exam's derived results and
//! exporting them as CSV.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exam_ranker::config::{ConfigError, DB_ENV, EngineConfig};
use exam_ranker::output::export_results;
use exam_ranker::store::SqliteStore;
use exam_ranker::{EngineError, Orchestrator, logging};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_RERUN: u8 = 3;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "exam_ranker")]
#[command(about = "Recompute grades, divisions and rankings for an exam", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clear and recompute every derived field of an exam
    Recompute {
        #[arg(long)]
        exam_id: i64,

        /// SQLite database path (falls back to EXAM_RANKER_DB)
        #[arg(long)]
        db: Option<PathBuf>,

        /// JSON engine config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Export an exam's student results to CSV
    Export {
        #[arg(long)]
        exam_id: i64,

        /// SQLite database path (falls back to EXAM_RANKER_DB)
        #[arg(long)]
        db: Option<PathBuf>,

        /// CSV file to write
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
}

fn resolve_db(db: Option<PathBuf>) -> PathBuf {
    db.or_else(|| std::env::var(DB_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("exam_ranker.db"))
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::from_env(),
    }
}

async fn recompute(exam_id: i64, db: Option<PathBuf>, config: Option<PathBuf>) -> Result<ExitCode> {
    let config = match load_config(config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid engine configuration");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let db = resolve_db(db);
    info!(db = %db.display(), chunk_size = config.chunk_size, "Opening store");
    let store = SqliteStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
    let orchestrator = Orchestrator::new(Arc::new(store), config);

    match orchestrator.recompute(exam_id).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.needs_rerun() {
                Ok(ExitCode::from(EXIT_RERUN))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(EngineError::Configuration(e)) => {
            error!(exam_id, error = %e, "Configuration error; nothing was written");
            Ok(ExitCode::from(EXIT_CONFIG))
        }
        Err(e) => Err(e.into()),
    }
}

async fn export(exam_id: i64, db: Option<PathBuf>, output: PathBuf) -> Result<ExitCode> {
    let db = resolve_db(db);
    let store = SqliteStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
    let rows = store.student_results(exam_id).await?;
    export_results(&output, &rows)?;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok(); // Load .env file
    let _log_guard = logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Recompute {
            exam_id,
            db,
            config,
        } => recompute(exam_id, db, config).await,
        Commands::Export {
            exam_id,
            db,
            output,
        } => export(exam_id, db, output).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
