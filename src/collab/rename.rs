use super::{belongs_to, is_raw_output, CollabError, FileProcessor, RenameSummary};
use crate::unit::{Season, RAW_EXTENSION};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Renames raw `.cgid` files to the unit's tagged extension on a bounded
/// pool of threads.
#[derive(Debug, Clone)]
pub struct TagRenamer {
    workers: usize,
}

impl TagRenamer {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

/// Files under `dir` whose name satisfies `keep`.
fn find_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>, CollabError> {
    if !dir.is_dir() {
        return Err(CollabError::io(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "output directory missing"),
        ));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                return Err(CollabError::Walk {
                    path: dir.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && keep(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// `Tamriel_x1_y2.cgid` -> `Tamriel_x1_y2.WIN.cgid`.
fn tagged_path(path: &Path, unit: Season) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = &name[..name.len().checked_sub(RAW_EXTENSION.len())?];
    Some(path.with_file_name(format!("{stem}{}", unit.extension())))
}

fn rename_one(path: &Path, unit: Season) -> std::io::Result<()> {
    let target = tagged_path(path, unit).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a raw output name")
    })?;
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    std::fs::rename(path, &target)
}

impl FileProcessor for TagRenamer {
    fn rename_outputs(&self, dir: &Path, unit: Season) -> Result<RenameSummary, CollabError> {
        if !unit.is_seasonal() {
            debug!(%unit, "untagged unit, outputs keep their names");
            return Ok(RenameSummary::default());
        }
        let files = find_files(dir, is_raw_output)?;
        if files.is_empty() {
            warn!(dir = %dir.display(), "no raw output files to rename");
            return Ok(RenameSummary::default());
        }

        let next = AtomicUsize::new(0);
        let processed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let workers = self.workers.min(files.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(path) = files.get(i) else { break };
                    match rename_one(path, unit) {
                        Ok(()) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "rename failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let summary = RenameSummary {
            processed: processed.into_inner(),
            failed: failed.into_inner(),
        };
        info!(
            %unit,
            processed = summary.processed,
            failed = summary.failed,
            workers,
            "tagged output files"
        );
        Ok(summary)
    }

    fn has_outputs(&self, dir: &Path, unit: Season) -> bool {
        if !dir.is_dir() {
            return false;
        }
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .any(|e| e.file_type().is_file() && belongs_to(&e.file_name().to_string_lossy(), unit))
    }

    fn cleanup_outputs(&self, dir: &Path, unit: Season) -> Result<usize, CollabError> {
        let files = find_files(dir, |name| belongs_to(name, unit))?;
        let mut removed = 0;
        for path in &files {
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output"),
            }
        }
        info!(%unit, removed, "cleaned up output files");
        Ok(removed)
    }
}
