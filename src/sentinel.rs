//! The sentinel file: the worker's only progress channel.
//!
//! The harness creates the file before launch. The worker appends one record
//! per processed cell and deletes the file when it finishes. The filesystem
//! cannot say who deleted it, so every deletion the harness performs goes
//! through [`SentinelFile::remove_as_orchestrator`], which sets a
//! [`DeletionMark`] first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Point-in-time read of the sentinel file. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub exists: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub line_count: usize,
    pub last_record: Option<String>,
}

impl ProgressSnapshot {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn has_content(&self) -> bool {
        self.exists && self.size > 0
    }

    /// True when size or mtime moved between two reads.
    pub fn differs_from(&self, previous: &ProgressSnapshot) -> bool {
        self.exists != previous.exists
            || self.size != previous.size
            || self.modified != previous.modified
    }
}

/// Records that the harness itself deleted the sentinel.
///
/// Owned by the per-attempt context; cleared when a monitoring session starts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeletionMark {
    marked: bool,
}

impl DeletionMark {
    pub fn mark(&mut self) {
        self.marked = true;
    }

    pub fn clear(&mut self) {
        self.marked = false;
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }
}

/// What `prepare_for_launch` did to the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// Resume: existing content left untouched.
    Preserved { lines: usize },
    /// No file existed; an empty one was created.
    Created,
    /// A stale empty file from an earlier session was replaced.
    ReplacedEmpty,
    /// A fresh start discarded existing records.
    Discarded { lines: usize },
}

#[derive(Debug, Clone)]
pub struct SentinelFile {
    path: PathBuf,
}

impl SentinelFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read existence, size, mtime and record count.
    ///
    /// A file that vanishes between the stat and the read is reported missing.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return ProgressSnapshot::missing(),
        };
        let mut snapshot = ProgressSnapshot {
            exists: true,
            size: meta.len(),
            modified: meta.modified().ok(),
            line_count: 0,
            last_record: None,
        };
        if snapshot.size == 0 {
            return snapshot;
        }
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                snapshot.line_count = text.lines().count();
                snapshot.last_record = text
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return ProgressSnapshot::missing(),
            Err(e) => {
                tracing::debug!(error = %e, path = %self.path.display(), "sentinel unreadable, using stat only");
            }
        }
        snapshot
    }

    /// Make sure the sentinel exists before the worker starts.
    ///
    /// With `is_resume` and existing content, the file is left as is. Anything
    /// else ends with an empty file; a pre-existing one is removed first and
    /// the removal is recorded in `mark`.
    pub fn prepare_for_launch(
        &self,
        is_resume: bool,
        mark: &mut DeletionMark,
    ) -> std::io::Result<Preparation> {
        let current = self.snapshot();
        if current.exists && current.size > 0 && is_resume {
            tracing::info!(
                lines = current.line_count,
                last = current.last_record.as_deref().unwrap_or(""),
                "resuming from existing sentinel progress"
            );
            return Ok(Preparation::Preserved {
                lines: current.line_count,
            });
        }

        let outcome = if !current.exists {
            Preparation::Created
        } else if current.size == 0 {
            tracing::info!(path = %self.path.display(), "replacing empty sentinel from previous session");
            self.remove_as_orchestrator(mark)?;
            Preparation::ReplacedEmpty
        } else {
            tracing::warn!(
                lines = current.line_count,
                "starting fresh, discarding existing sentinel progress"
            );
            self.remove_as_orchestrator(mark)?;
            Preparation::Discarded {
                lines: current.line_count,
            }
        };

        std::fs::File::create(&self.path)?;
        tracing::debug!(path = %self.path.display(), "created sentinel");
        Ok(outcome)
    }

    /// Delete the sentinel on the harness's behalf, marking it first.
    ///
    /// Returns Ok(false) if the file was already gone.
    pub fn remove_as_orchestrator(&self, mark: &mut DeletionMark) -> std::io::Result<bool> {
        mark.mark();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, line: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        writeln!(f, "{line}").unwrap();
    }

    #[test]
    fn test_snapshot_missing_file() {
        let dir = tempdir().unwrap();
        let s = SentinelFile::new(dir.path().join("PrecacheGrass.txt"));
        let snap = s.snapshot();
        assert!(!snap.exists);
        assert!(!snap.has_content());
        assert_eq!(snap, ProgressSnapshot::missing());
    }

    #[test]
    fn test_snapshot_counts_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        append(&path, "Tamriel 1,1");
        append(&path, "Tamriel 1,2");
        append(&path, "");
        let snap = SentinelFile::new(&path).snapshot();
        assert!(snap.exists);
        assert_eq!(snap.line_count, 3);
        assert_eq!(snap.last_record.as_deref(), Some("Tamriel 1,2"));
        assert!(snap.modified.is_some());
    }

    #[test]
    fn test_differs_on_growth_and_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        std::fs::write(&path, "").unwrap();
        let s = SentinelFile::new(&path);
        let before = s.snapshot();
        assert!(!s.snapshot().differs_from(&before));

        append(&path, "cell");
        assert!(s.snapshot().differs_from(&before));

        let grown = s.snapshot();
        let later = filetime::FileTime::from_unix_time(2_000_000_000, 0);
        filetime::set_file_mtime(&path, later).unwrap();
        assert!(s.snapshot().differs_from(&grown));
    }

    #[test]
    fn test_resume_preserves_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        append(&path, "cell a");
        append(&path, "cell b");
        let s = SentinelFile::new(&path);
        let mut mark = DeletionMark::default();

        let prep = s.prepare_for_launch(true, &mut mark).unwrap();
        assert_eq!(prep, Preparation::Preserved { lines: 2 });
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cell a\ncell b\n");
        assert!(!mark.is_marked());
    }

    #[test]
    fn test_fresh_launch_replaces_stale_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        std::fs::write(&path, "").unwrap();
        let s = SentinelFile::new(&path);
        let mut mark = DeletionMark::default();

        let prep = s.prepare_for_launch(false, &mut mark).unwrap();
        assert_eq!(prep, Preparation::ReplacedEmpty);
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(mark.is_marked());
    }

    #[test]
    fn test_resume_with_empty_file_recreates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        std::fs::write(&path, "").unwrap();
        let mut mark = DeletionMark::default();
        let prep = SentinelFile::new(&path)
            .prepare_for_launch(true, &mut mark)
            .unwrap();
        assert_eq!(prep, Preparation::ReplacedEmpty);
        assert!(path.exists());
    }

    #[test]
    fn test_fresh_launch_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        let mut mark = DeletionMark::default();
        let prep = SentinelFile::new(&path)
            .prepare_for_launch(false, &mut mark)
            .unwrap();
        assert_eq!(prep, Preparation::Created);
        assert!(path.exists());
        assert!(!mark.is_marked());
    }

    #[test]
    fn test_fresh_launch_discards_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PrecacheGrass.txt");
        append(&path, "old cell");
        let mut mark = DeletionMark::default();
        let prep = SentinelFile::new(&path)
            .prepare_for_launch(false, &mut mark)
            .unwrap();
        assert_eq!(prep, Preparation::Discarded { lines: 1 });
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(mark.is_marked());
    }

    #[test]
    fn test_remove_as_orchestrator_marks_even_when_missing() {
        let dir = tempdir().unwrap();
        let s = SentinelFile::new(dir.path().join("PrecacheGrass.txt"));
        let mut mark = DeletionMark::default();
        assert!(!s.remove_as_orchestrator(&mut mark).unwrap());
        assert!(mark.is_marked());
        mark.clear();
        assert!(!mark.is_marked());
    }
}
