//! Post-commit archival of ingested transcripts using zstd.
//!
//! Once a document's transaction commits, the source file is compressed into
//! the archive directory as `{stem}_{YYYYMMDD}.md.zst`. The original is kept
//! unless `remove_original` is set.

use crate::config::ArchiveConfig;
use std::path::{Path, PathBuf};

/// Archive name for `path` on the given day, e.g. `conv_1_2_20240101.md.zst`.
pub fn archive_name(path: &Path, day: chrono::NaiveDate) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("md");
    Some(format!("{stem}_{}.{ext}.zst", day.format("%Y%m%d")))
}

/// Compress `path` into the archive directory. Returns the archive path.
pub fn archive_document(path: &Path, config: &ArchiveConfig) -> std::io::Result<PathBuf> {
    let day = chrono::Utc::now().date_naive();
    let name = archive_name(path, day).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot derive archive name from {}", path.display()),
        )
    })?;

    std::fs::create_dir_all(&config.dir)?;
    let dest = config.dir.join(name);

    let input = std::fs::read(path)?;
    let compressed = zstd::encode_all(input.as_slice(), config.level)?;
    std::fs::write(&dest, compressed)?;

    if config.remove_original {
        std::fs::remove_file(path)?;
    }

    tracing::debug!(
        file = %path.display(),
        archive = %dest.display(),
        removed = config.remove_original,
        "archived transcript"
    );
    Ok(dest)
}
