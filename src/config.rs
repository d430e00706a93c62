use crate::unit::Season;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from cachesmith.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub worker: WorkerConfig,
    pub sentinel: SentinelConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
    pub seasons: SeasonsConfig,
    pub preflight: PreflightConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Game install directory; the worker's working directory.
    pub install_dir: PathBuf,
    /// Explicit executable (relative to install_dir or absolute).
    pub executable: Option<PathBuf>,
    /// Launchers that spawn the real worker and exit.
    pub loader_names: Vec<String>,
    /// Names of the real worker process.
    pub worker_names: Vec<String>,
    pub existing_instance_wait_secs: u64,
    pub cooldown_secs: u64,
    pub spawn_discovery_secs: u64,
    pub discovery_poll_millis: u64,
    pub start_check_secs: u64,
    pub terminate_wait_secs: u64,
    pub exit_linger_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub file_name: String,
    pub lock_name: String,
    pub startup_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub stall_warning_secs: u64,
    pub inactivity_timeout_mins: u64,
    pub report_interval_secs: u64,
    pub crash_log_globs: Vec<String>,
    pub crash_log_lines: usize,
    pub hang: HangConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HangConfig {
    pub enabled: bool,
    pub cpu_threshold_percent: f64,
    pub samples: u32,
    pub sample_interval_secs: u64,
    pub memory_delta_bytes: u64,
    pub recheck_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub resume_interrupted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where the worker writes cache files, relative to install_dir.
    pub grass_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub archive: bool,
    pub cleanup_outputs: bool,
    pub rename_workers: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SeasonsConfig {
    pub units: Vec<Season>,
    pub ini_file: PathBuf,
    pub backup: bool,
}

/// Environment checks run once before the first launch.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub enabled: bool,
    /// Files that must exist, relative to install_dir. The seasons INI is
    /// added automatically when a seasonal unit is selected.
    pub required_files: Vec<PathBuf>,
    /// Free space required on the install volume, in GiB.
    pub min_free_gb: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub install_dir: Option<PathBuf>,
    pub seasons: Vec<Season>,
    pub max_attempts: Option<u32>,
    pub inactivity_timeout_mins: Option<u64>,
}

impl HarnessConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(dir) = overrides.install_dir {
            self.worker.install_dir = dir;
        }
        if !overrides.seasons.is_empty() {
            self.seasons.units = overrides.seasons;
        }
        if let Some(n) = overrides.max_attempts {
            self.retry.max_attempts = n;
        }
        if let Some(mins) = overrides.inactivity_timeout_mins {
            self.monitor.inactivity_timeout_mins = mins;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        let timeout_secs = self
            .monitor
            .inactivity_timeout_mins
            .checked_mul(60)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "monitor.inactivity_timeout_mins ({}) is too large",
                    self.monitor.inactivity_timeout_mins
                ))
            })?;
        if self.monitor.stall_warning_secs >= timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "monitor.stall_warning_secs ({}) must be shorter than the inactivity timeout ({} min)",
                self.monitor.stall_warning_secs, self.monitor.inactivity_timeout_mins
            )));
        }
        if self.seasons.units.is_empty() {
            return Err(ConfigError::Invalid("no seasons selected".into()));
        }
        if self.worker.worker_names.is_empty() {
            return Err(ConfigError::Invalid(
                "worker.worker_names must name at least one process".into(),
            ));
        }
        if self.sentinel.file_name.trim().is_empty() {
            return Err(ConfigError::Invalid("sentinel.file_name is empty".into()));
        }
        Ok(())
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.inactivity_timeout_mins.saturating_mul(60))
    }

    /// Resolve a path that may be relative to the install directory.
    pub fn install_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.worker.install_dir.join(path)
        }
    }
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("."),
            executable: None,
            loader_names: vec![
                "skse64_loader.exe".to_string(),
                "sksevr_loader.exe".to_string(),
                "skse_loader.exe".to_string(),
            ],
            worker_names: vec![
                "SkyrimSE.exe".to_string(),
                "SkyrimAE.exe".to_string(),
                "SkyrimVR.exe".to_string(),
                "Skyrim.exe".to_string(),
            ],
            existing_instance_wait_secs: 120,
            cooldown_secs: 5,
            spawn_discovery_secs: 30,
            discovery_poll_millis: 1000,
            start_check_secs: 3,
            terminate_wait_secs: 10,
            exit_linger_secs: 30,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            file_name: "PrecacheGrass.txt".to_string(),
            lock_name: ".cachesmith_generation_active".to_string(),
            startup_grace_secs: 10,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            stall_warning_secs: 300,
            inactivity_timeout_mins: 10,
            report_interval_secs: 300,
            crash_log_globs: Vec::new(),
            crash_log_lines: 20,
            hang: HangConfig::default(),
        }
    }
}

impl Default for HangConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_threshold_percent: 2.0,
            samples: 3,
            sample_interval_secs: 2,
            memory_delta_bytes: 1024 * 1024,
            recheck_secs: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_secs: 5,
            resume_interrupted: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            grass_dir: PathBuf::from("Data/Grass"),
            archive_dir: PathBuf::from("cachesmith-output"),
            archive: true,
            cleanup_outputs: true,
            rename_workers: 8,
        }
    }
}

impl Default for SeasonsConfig {
    fn default() -> Self {
        Self {
            units: Season::SEASONAL.to_vec(),
            ini_file: PathBuf::from("Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini"),
            backup: true,
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_files: vec![
                PathBuf::from("Data/SKSE/Plugins/GrassControl.ini"),
                PathBuf::from("skse64_loader.exe"),
            ],
            min_free_gb: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HarnessConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.sentinel.file_name, "PrecacheGrass.txt");
        assert_eq!(cfg.seasons.units, Season::SEASONAL.to_vec());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachesmith.toml");
        std::fs::write(
            &path,
            r#"
[worker]
install_dir = "/games/skyrim"

[monitor]
inactivity_timeout_mins = 20

[monitor.hang]
enabled = false

[seasons]
units = ["autumn", "no_seasons"]
"#,
        )
        .unwrap();
        let cfg = HarnessConfig::load(&path).unwrap();
        assert_eq!(cfg.worker.install_dir, PathBuf::from("/games/skyrim"));
        assert_eq!(cfg.monitor.inactivity_timeout_mins, 20);
        assert_eq!(cfg.monitor.poll_interval_secs, 5);
        assert!(!cfg.monitor.hang.enabled);
        assert_eq!(cfg.monitor.hang.samples, 3);
        assert_eq!(cfg.seasons.units, vec![Season::Autumn, Season::NoSeasons]);
        assert_eq!(cfg.inactivity_timeout(), Duration::from_secs(1200));
    }

    #[test]
    fn test_unknown_season_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachesmith.toml");
        std::fs::write(&path, "[seasons]\nunits = [\"monsoon\"]\n").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut cfg = HarnessConfig::default();
        cfg.apply(Overrides {
            install_dir: Some(PathBuf::from("/x")),
            seasons: vec![Season::Winter],
            max_attempts: Some(2),
            inactivity_timeout_mins: Some(30),
        });
        assert_eq!(cfg.worker.install_dir, PathBuf::from("/x"));
        assert_eq!(cfg.seasons.units, vec![Season::Winter]);
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.monitor.inactivity_timeout_mins, 30);
    }

    #[test]
    fn test_empty_overrides_change_nothing() {
        let mut cfg = HarnessConfig::default();
        cfg.apply(Overrides::default());
        assert_eq!(cfg.seasons.units.len(), 4);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn test_validate_rejects_stall_warning_past_timeout() {
        let mut cfg = HarnessConfig::default();
        cfg.monitor.inactivity_timeout_mins = 5;
        cfg.monitor.stall_warning_secs = 300;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stall_warning_secs"));
    }

    #[test]
    fn test_huge_timeout_is_rejected_not_panicking() {
        let mut cfg = HarnessConfig::default();
        cfg.apply(Overrides {
            inactivity_timeout_mins: Some(u64::MAX),
            ..Overrides::default()
        });
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("too large"));
        assert_eq!(cfg.inactivity_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_preflight_section_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachesmith.toml");
        std::fs::write(
            &path,
            "[preflight]\nmin_free_gb = 12\nrequired_files = [\"Data/NGIO.dll\"]\n",
        )
        .unwrap();
        let cfg = HarnessConfig::load(&path).unwrap();
        assert!(cfg.preflight.enabled);
        assert_eq!(cfg.preflight.min_free_gb, 12);
        assert_eq!(cfg.preflight.required_files, vec![PathBuf::from("Data/NGIO.dll")]);
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_poll() {
        let mut cfg = HarnessConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.monitor.poll_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_install_path_resolution() {
        let mut cfg = HarnessConfig::default();
        cfg.worker.install_dir = PathBuf::from("/games/skyrim");
        assert_eq!(
            cfg.install_path(Path::new("Data/Grass")),
            PathBuf::from("/games/skyrim/Data/Grass")
        );
        assert_eq!(cfg.install_path(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
