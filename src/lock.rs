/// Marker files: the generation lock and the harness singleton lock.
use fs2::FileExt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Present only while a unit's monitoring loop is active.
///
/// Finding it at startup means the previous attempt was cut off mid-flight,
/// as opposed to a completed run that left artifacts behind. The content is
/// a human-readable timestamp and is never parsed.
#[derive(Debug, Clone)]
pub struct GenerationLock {
    path: PathBuf,
}

impl GenerationLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Create (or refresh) the marker.
    pub fn acquire(&self, label: &str) -> std::io::Result<()> {
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let body = format!(
            "cachesmith generation active: {label}\nstarted: {started}\npid: {}\n",
            std::process::id()
        );
        std::fs::write(&self.path, body)
    }

    /// Remove the marker. A missing file is not an error.
    pub fn release(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another cachesmith instance holds {path}")]
    Held { path: PathBuf },
    #[error("failed to write lock file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive lock that keeps two harnesses off the same install.
///
/// Released when dropped.
#[derive(Debug)]
pub struct HarnessLock {
    _file: std::fs::File,
}

impl HarnessLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        // Open without truncating: the current holder's PID must survive a
        // failed attempt.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.try_lock_exclusive().map_err(|_| LockError::Held {
            path: path.to_path_buf(),
        })?;

        let write_err = |e| LockError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        let mut file = file;
        file.set_len(0).map_err(write_err)?;
        writeln!(file, "{}", std::process::id()).map_err(write_err)?;

        Ok(Self { _file: file })
    }
}
