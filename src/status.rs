/// Status file: writes `.cachesmith/status` as JSON on every orchestrator
/// transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::unit::Season;
use crate::watchdog::{MonitorState, ProgressReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    Starting,
    PatchingConfig,
    Launching,
    Monitoring,
    Retrying,
    PostProcessing,
    ShuttingDown,
    Finished,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: HarnessState,
    pub unit: Option<Season>,
    pub unit_index: usize,
    pub unit_count: usize,
    pub attempt: u32,
    pub max_attempts: u32,
    pub monitor_state: Option<MonitorState>,
    pub records: usize,
    /// Seconds the current attempt has been monitored.
    pub monitor_elapsed_secs: u64,
    /// Seconds since the sentinel last changed.
    pub idle_secs: u64,
    pub attempt_start: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub completed: Vec<Season>,
    pub abandoned: Vec<Season>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write temp status file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read status file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_string_pretty(data)?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Raw file contents, or None when no run has written one.
    pub fn read_raw(&self) -> Result<Option<String>, StatusError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StatusError::Read {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    unit: Option<Season>,
    unit_index: usize,
    unit_count: usize,
    attempt: u32,
    max_attempts: u32,
    monitor_state: Option<MonitorState>,
    records: usize,
    monitor_elapsed: Duration,
    idle: Duration,
    attempt_start: Option<DateTime<Utc>>,
    completed: Vec<Season>,
    abandoned: Vec<Season>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, unit_count: usize, max_attempts: u32) -> Self {
        let mut tracker = Self::disabled(unit_count, max_attempts);
        tracker.file = Some(StatusFile::new(status_path));
        tracker
    }

    /// A tracker that keeps state but writes nothing.
    pub fn disabled(unit_count: usize, max_attempts: u32) -> Self {
        Self {
            file: None,
            pid: std::process::id(),
            unit: None,
            unit_index: 0,
            unit_count,
            attempt: 0,
            max_attempts,
            monitor_state: None,
            records: 0,
            monitor_elapsed: Duration::ZERO,
            idle: Duration::ZERO,
            attempt_start: None,
            completed: Vec::new(),
            abandoned: Vec::new(),
        }
    }

    pub fn snapshot(&self, state: HarnessState) -> StatusData {
        StatusData {
            pid: self.pid,
            state,
            unit: self.unit,
            unit_index: self.unit_index,
            unit_count: self.unit_count,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            monitor_state: self.monitor_state,
            records: self.records,
            monitor_elapsed_secs: self.monitor_elapsed.as_secs(),
            idle_secs: self.idle.as_secs(),
            attempt_start: self.attempt_start,
            last_update: Utc::now(),
            completed: self.completed.clone(),
            abandoned: self.abandoned.clone(),
        }
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: HarnessState) {
        let Some(file) = &self.file else { return };
        if let Err(e) = file.write(&self.snapshot(state)) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_unit(&mut self, index: usize, unit: Season) {
        self.unit_index = index;
        self.unit = Some(unit);
        self.attempt = 0;
        self.monitor_state = None;
        self.records = 0;
        self.monitor_elapsed = Duration::ZERO;
        self.idle = Duration::ZERO;
    }

    /// Mark the start of an attempt (1-based for display).
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.attempt_start = Some(Utc::now());
        self.monitor_elapsed = Duration::ZERO;
        self.idle = Duration::ZERO;
    }

    pub fn set_progress(&mut self, report: &ProgressReport<'_>) {
        self.monitor_state = Some(report.state);
        self.records = report.snapshot.line_count;
        self.monitor_elapsed = report.elapsed;
        self.idle = report.idle;
    }

    pub fn record_completed(&mut self, unit: Season) {
        self.completed.push(unit);
    }

    pub fn record_abandoned(&mut self, unit: Season) {
        self.abandoned.push(unit);
    }
}
