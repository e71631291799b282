mod archive;
mod config;
mod db;
mod extract;
mod grammar;
mod ingest;
mod persist;
mod transcript;

use clap::{Parser, Subcommand};
use config::IngestConfig;
use db::Store;
use ingest::Ingestor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Ingest Chat Bridge Markdown transcripts into a SQLite store:
/// extract session, agent and message records, upsert them in one
/// transaction per file, and archive what was committed.
#[derive(Parser, Debug)]
#[command(name = "chatbridge-ingest", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "chatbridge.toml")]
    config: PathBuf,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Extra logging (field fallbacks, phase transitions)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings, errors and the summary
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and its tables
    Init,
    /// Ingest every transcript in a directory
    Ingest {
        /// Directory to scan
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Concurrent documents (overrides config)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// File glob within the directory (overrides config)
        #[arg(long)]
        pattern: Option<String>,

        /// Archive committed transcripts
        #[arg(long, conflicts_with = "no_archive")]
        archive: bool,

        /// Do not archive, even if the config enables it
        #[arg(long)]
        no_archive: bool,

        /// Archive directory (overrides config)
        #[arg(long)]
        archive_dir: Option<PathBuf>,

        /// Extract and print records as JSON without touching the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a stored session with its agents and messages as JSON
    Show {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match IngestConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }

    let result = match cli.command {
        Command::Init => handle_init(&config),
        Command::Ingest {
            dir,
            jobs,
            pattern,
            archive,
            no_archive,
            archive_dir,
            dry_run,
        } => {
            if let Some(jobs) = jobs {
                config.scan.jobs = jobs;
            }
            if let Some(pattern) = pattern {
                config.scan.pattern = pattern;
            }
            if archive {
                config.archive.enabled = true;
            }
            if no_archive {
                config.archive.enabled = false;
            }
            if let Some(archive_dir) = archive_dir {
                config.archive.dir = archive_dir;
            }
            if dry_run {
                handle_dry_run(&config, &dir)
            } else {
                handle_ingest(config, &dir).await
            }
        }
        Command::Show { session_id } => handle_show(&config, &session_id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "chatbridge_ingest=debug"
    } else if cli.quiet {
        "chatbridge_ingest=warn"
    } else {
        "chatbridge_ingest=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn store_for(config: &IngestConfig) -> Store {
    Store::new(&config.store.path, config.store.busy_timeout())
}

/// Handle the `init` subcommand.
fn handle_init(config: &IngestConfig) -> Result<(), String> {
    let store = store_for(config);
    store
        .init()
        .map_err(|e| format!("Failed to create database {}: {e}", store.path().display()))?;
    println!("Database ready: {}", store.path().display());
    Ok(())
}

/// Handle the `ingest` subcommand.
async fn handle_ingest(config: IngestConfig, dir: &std::path::Path) -> Result<(), String> {
    let store = store_for(&config);
    // Schema creation is not part of a document's transaction; do it once up front.
    store
        .init()
        .map_err(|e| format!("Failed to open database {}: {e}", store.path().display()))?;

    let files = ingest::discover(dir, &config.scan)?;
    println!("Found {} files to process", files.len());

    let ingestor = Arc::new(Ingestor::new(store.clone(), config.archive.clone()));
    let summary = ingest::run_batch(ingestor, files, config.scan.jobs).await;

    for outcome in &summary.committed {
        println!(
            "Successfully processed: {} ({})",
            outcome.path.display(),
            outcome.report.session_id
        );
        if let Some(dest) = &outcome.archived {
            println!("Archived: {} -> {}", outcome.path.display(), dest.display());
        }
    }
    for err in &summary.failed {
        println!("  failed: {err}");
    }
    println!(
        "\nProcessed {}/{} files successfully",
        summary.succeeded(),
        summary.total
    );

    if let Ok(conn) = store.acquire() {
        match db::table_counts(&conn) {
            Ok(c) => tracing::info!(
                sessions = c.sessions,
                agents = c.agents,
                messages = c.messages,
                "store totals"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to count stored rows"),
        }
    }

    if summary.all_succeeded() {
        Ok(())
    } else {
        Err(format!(
            "{} file(s) failed",
            summary.total - summary.succeeded()
        ))
    }
}

/// Handle `ingest --dry-run`: extract only, print each record with its field
/// diagnostics.
fn handle_dry_run(config: &IngestConfig, dir: &std::path::Path) -> Result<(), String> {
    let files = ingest::discover(dir, &config.scan)?;
    let mut failed = 0usize;

    for path in &files {
        let extraction = match ingest::read_and_extract(path) {
            Ok(x) => x,
            Err(e) => {
                println!("  failed: {e}");
                failed += 1;
                continue;
            }
        };
        let issues: Vec<String> = extraction.issues.iter().map(|i| i.to_string()).collect();
        let doc = serde_json::json!({
            "path": path.display().to_string(),
            "transcript": extraction.transcript,
            "issues": issues,
        });
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| format!("Failed to serialize {}: {e}", path.display()))?;
        println!("{json}");
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(format!("{failed} file(s) could not be read"))
    }
}

/// Handle the `show` subcommand.
fn handle_show(config: &IngestConfig, session_id: &str) -> Result<(), String> {
    let store = store_for(config);
    let conn = store
        .acquire()
        .map_err(|e| format!("Failed to open database {}: {e}", store.path().display()))?;
    let transcript = db::load_transcript(&conn, session_id)
        .map_err(|e| format!("Failed to load session {session_id}: {e}"))?
        .ok_or_else(|| format!("Session {session_id} not found"))?;
    let json = serde_json::to_string_pretty(&transcript)
        .map_err(|e| format!("Failed to serialize session {session_id}: {e}"))?;
    println!("{json}");
    Ok(())
}
