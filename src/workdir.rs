use crate::config::HarnessConfig;
use std::path::{Path, PathBuf};

/// Name of the harness's own directory inside the install dir.
pub const DATA_DIR_NAME: &str = ".cachesmith";

/// Well-known paths under the worker's install directory.
///
/// The sentinel and generation lock live at the install root because the
/// worker's plugin looks for the sentinel there. Harness-owned state (status
/// file, singleton lock, INI backups) lives under `.cachesmith/`.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    sentinel_name: String,
    lock_name: String,
    grass_dir: PathBuf,
}

impl WorkDir {
    pub fn new(
        root: impl Into<PathBuf>,
        sentinel_name: impl Into<String>,
        lock_name: impl Into<String>,
        grass_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            sentinel_name: sentinel_name.into(),
            lock_name: lock_name.into(),
            grass_dir: grass_dir.into(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.worker.install_dir.clone(),
            config.sentinel.file_name.clone(),
            config.sentinel.lock_name.clone(),
            config.output.grass_dir.clone(),
        )
    }

    /// The install directory (the worker's cwd).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the sentinel file the worker consumes.
    pub fn sentinel(&self) -> PathBuf {
        self.root.join(&self.sentinel_name)
    }

    /// Path to the hidden generation lock marker.
    pub fn generation_lock(&self) -> PathBuf {
        self.root.join(&self.lock_name)
    }

    /// Directory the worker writes cache files into.
    pub fn grass_dir(&self) -> PathBuf {
        if self.grass_dir.is_absolute() {
            self.grass_dir.clone()
        } else {
            self.root.join(&self.grass_dir)
        }
    }

    /// Harness data directory (e.g. `.cachesmith/`).
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR_NAME)
    }

    /// Path to the harness status file.
    pub fn status(&self) -> PathBuf {
        self.data_dir().join("status")
    }

    /// Path to the singleton lock file.
    pub fn harness_lock(&self) -> PathBuf {
        self.data_dir().join("lock")
    }

    /// Directory holding INI backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    /// Create the harness data directory. Returns Ok(true) if it was created.
    pub fn init(&self) -> std::io::Result<bool> {
        let data_dir = self.data_dir();
        let created = !data_dir.exists();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(created)
    }
}
