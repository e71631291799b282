//! Document ingestion: read a transcript file, extract it, and apply it to
//! the store in one transaction, then archive the source.
//!
//! Each document moves through [`DocumentState`]; any failure after the
//! transaction opens rolls it back, and no failure stops a batch.

use crate::archive;
use crate::config::{ArchiveConfig, ScanConfig};
use crate::db::Store;
use crate::extract::{self, Extraction};
use crate::persist::{self, DocumentState, Phase, PersistError, PersistReport};
use crate::transcript::AgentLabel;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Document-level failures. Each one aborts that document only.
#[derive(Debug)]
pub enum DocumentError {
    /// The file could not be read as UTF-8 text.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// No usable session identifier; nothing was written.
    MissingKey { path: PathBuf },
    /// No store connection or transaction could be obtained.
    Connection {
        path: PathBuf,
        source: rusqlite::Error,
    },
    /// A write phase failed and the transaction was rolled back.
    Persistence {
        path: PathBuf,
        phase: Phase,
        source: rusqlite::Error,
    },
    /// The worker processing this document panicked.
    Worker { path: PathBuf, message: String },
}

impl DocumentError {
    pub fn path(&self) -> &Path {
        match self {
            DocumentError::Read { path, .. }
            | DocumentError::MissingKey { path }
            | DocumentError::Connection { path, .. }
            | DocumentError::Persistence { path, .. }
            | DocumentError::Worker { path, .. } => path,
        }
    }
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            DocumentError::MissingKey { path } => {
                write!(f, "{}: no valid session identifier", path.display())
            }
            DocumentError::Connection { path, source } => {
                write!(
                    f,
                    "{}: could not acquire store connection: {}",
                    path.display(),
                    source
                )
            }
            DocumentError::Persistence {
                path,
                phase,
                source,
            } => {
                write!(
                    f,
                    "{}: {} phase failed, rolled back: {}",
                    path.display(),
                    phase,
                    source
                )
            }
            DocumentError::Worker { path, message } => {
                write!(f, "{}: worker panicked: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DocumentError::Read { source, .. } => Some(source),
            DocumentError::MissingKey { .. } => None,
            DocumentError::Connection { source, .. } => Some(source),
            DocumentError::Persistence { source, .. } => Some(source),
            DocumentError::Worker { .. } => None,
        }
    }
}

/// Result of a committed document.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub path: PathBuf,
    pub report: PersistReport,
    /// Where the source was archived, if archival ran and succeeded.
    pub archived: Option<PathBuf>,
}

/// Ingests documents into one store. Shared by all batch workers.
#[derive(Debug, Clone)]
pub struct Ingestor {
    store: Store,
    archive: ArchiveConfig,
}

impl Ingestor {
    pub fn new(store: Store, archive: ArchiveConfig) -> Self {
        Self { store, archive }
    }

    /// Ingest a single file end to end.
    pub fn process_file(&self, path: &Path) -> Result<DocumentOutcome, DocumentError> {
        tracing::info!(path = %path.display(), "processing transcript");

        let Extraction { transcript, issues } = read_and_extract(path)?;
        for issue in &issues {
            tracing::debug!(path = %path.display(), %issue, "field fell back to unset");
        }
        tracing::debug!(
            path = %path.display(),
            session_id = transcript.session_id().unwrap_or("-"),
            model_a = transcript.agent(AgentLabel::A).model.as_deref().unwrap_or("-"),
            model_b = transcript.agent(AgentLabel::B).model.as_deref().unwrap_or("-"),
            messages = transcript.messages.len(),
            "extracted transcript"
        );

        // Checked before a connection is taken so a keyless document never
        // opens a transaction.
        if transcript.session_id().is_none() {
            return Err(DocumentError::MissingKey {
                path: path.to_path_buf(),
            });
        }

        let mut conn = self
            .store
            .acquire()
            .map_err(|e| DocumentError::Connection {
                path: path.to_path_buf(),
                source: e,
            })?;
        let tx = conn.transaction().map_err(|e| DocumentError::Connection {
            path: path.to_path_buf(),
            source: e,
        })?;

        let report = match persist::apply(&tx, &transcript) {
            Ok(report) => report,
            Err(err) => {
                if let Err(e) = tx.rollback() {
                    tracing::warn!(path = %path.display(), error = %e, "rollback failed");
                }
                log_terminal(path, DocumentState::RolledBack);
                return Err(match err {
                    PersistError::MissingKey => DocumentError::MissingKey {
                        path: path.to_path_buf(),
                    },
                    PersistError::Phase { phase, source, .. } => DocumentError::Persistence {
                        path: path.to_path_buf(),
                        phase,
                        source,
                    },
                });
            }
        };

        // A failed commit rolls the transaction back on drop.
        if let Err(e) = tx.commit() {
            log_terminal(path, DocumentState::RolledBack);
            return Err(DocumentError::Persistence {
                path: path.to_path_buf(),
                phase: Phase::Commit,
                source: e,
            });
        }
        log_terminal(path, DocumentState::Committed);
        drop(conn);

        tracing::info!(
            path = %path.display(),
            session_id = %report.session_id,
            agents = report.agents,
            messages = report.messages,
            stale_messages = report.stale_messages,
            "committed transcript"
        );

        let archived = if self.archive.enabled {
            match archive::archive_document(path, &self.archive) {
                Ok(dest) => Some(dest),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to archive transcript"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(DocumentOutcome {
            path: path.to_path_buf(),
            report,
            archived,
        })
    }
}

fn log_terminal(path: &Path, state: DocumentState) {
    debug_assert!(state.is_terminal());
    tracing::debug!(path = %path.display(), ?state, "document finished");
}

/// Read a file and extract it without touching any store.
pub fn read_and_extract(path: &Path) -> Result<Extraction, DocumentError> {
    let text = std::fs::read_to_string(path).map_err(|e| DocumentError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(extract::extract(&text))
}

/// Find transcript files in `dir` matching the scan pattern, minus excluded
/// file names, in sorted order.
pub fn discover(dir: &Path, scan: &ScanConfig) -> Result<Vec<PathBuf>, String> {
    let pattern = dir.join(&scan.pattern);
    let pattern = pattern.to_string_lossy();
    let entries =
        glob::glob(&pattern).map_err(|e| format!("invalid scan pattern {pattern}: {e}"))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let excluded = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| scan.exclude.iter().any(|x| x == name));
        if !excluded {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Aggregate result of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub committed: Vec<DocumentOutcome>,
    pub failed: Vec<DocumentError>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.committed.len()
    }

    /// True only when every discovered file committed.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.committed.len() == self.total
    }
}

/// Ingest `files` on up to `jobs` blocking workers. Every file is attempted;
/// failures are collected, never propagated.
pub async fn run_batch(ingestor: Arc<Ingestor>, files: Vec<PathBuf>, jobs: usize) -> BatchSummary {
    run_each(files, jobs, move |path| ingestor.process_file(path)).await
}

async fn run_each<F>(files: Vec<PathBuf>, jobs: usize, work: F) -> BatchSummary
where
    F: Fn(&Path) -> Result<DocumentOutcome, DocumentError> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut summary = BatchSummary {
        total: files.len(),
        ..Default::default()
    };
    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut workers = JoinSet::new();

    for path in files {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let work = Arc::clone(&work);
        workers.spawn_blocking(move || {
            let _permit = permit;
            std::panic::catch_unwind(AssertUnwindSafe(|| work(&path))).unwrap_or_else(|panic| {
                Err(DocumentError::Worker {
                    message: panic_message(panic.as_ref()),
                    path,
                })
            })
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(outcome)) => summary.committed.push(outcome),
            Ok(Err(err)) => {
                tracing::error!(path = %err.path().display(), error = %err, "document failed");
                summary.failed.push(err);
            }
            Err(e) => tracing::error!(error = %e, "ingest worker panicked"),
        }
    }

    let unaccounted = summary.total - summary.committed.len() - summary.failed.len();
    if unaccounted > 0 {
        tracing::error!(unaccounted, "documents finished without a result");
    }

    summary.committed.sort_by(|a, b| a.path.cmp(&b.path));
    summary
        .failed
        .sort_by(|a, b| a.path().cmp(b.path()));
    summary
}
