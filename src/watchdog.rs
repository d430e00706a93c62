/// Activity & completion monitor.
///
/// Polls the sentinel file and the worker's liveness, classifying each poll
/// into a [`MonitorState`]. Only inactivity ends a healthy-looking session:
/// a worker that keeps appending is never timed out, however long it runs.
use crate::config::HarnessConfig;
use crate::process::ResourceUsage;
use crate::sentinel::{DeletionMark, ProgressSnapshot, SentinelFile};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Assumed kernel clock ticks per second (USER_HZ).
const TICKS_PER_SEC: f64 = 100.0;

/// Liveness and resource usage of the supervised worker.
pub trait WorkerProbe {
    fn is_running(&mut self) -> bool;
    fn usage(&mut self) -> Option<ResourceUsage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Initializing,
    Active,
    Stalled,
    Completed,
    Interrupted,
    TimedOut,
    ProcessCrashed,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MonitorState::Completed
                | MonitorState::Interrupted
                | MonitorState::TimedOut
                | MonitorState::ProcessCrashed
        )
    }
}

#[derive(Debug, Clone)]
pub struct HangSettings {
    pub cpu_threshold_percent: f64,
    pub samples: u32,
    pub sample_interval: Duration,
    pub memory_delta_bytes: u64,
    pub recheck: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub stall_warning: Duration,
    pub inactivity_timeout: Duration,
    pub report_interval: Duration,
    /// None disables the CPU-sampling hang check.
    pub hang: Option<HangSettings>,
    pub crash_log_globs: Vec<String>,
    pub crash_log_lines: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let m = &config.monitor;
        let hang = m.hang.enabled.then(|| HangSettings {
            cpu_threshold_percent: m.hang.cpu_threshold_percent,
            samples: m.hang.samples.max(1),
            sample_interval: Duration::from_secs(m.hang.sample_interval_secs.max(1)),
            memory_delta_bytes: m.hang.memory_delta_bytes,
            recheck: Duration::from_secs(m.hang.recheck_secs),
        });
        Self {
            poll_interval: Duration::from_secs(m.poll_interval_secs),
            stall_warning: Duration::from_secs(m.stall_warning_secs),
            inactivity_timeout: config.inactivity_timeout(),
            report_interval: Duration::from_secs(m.report_interval_secs),
            hang,
            crash_log_globs: m
                .crash_log_globs
                .iter()
                .map(|g| {
                    config
                        .install_path(Path::new(g))
                        .to_string_lossy()
                        .to_string()
                })
                .collect(),
            crash_log_lines: m.crash_log_lines,
        }
    }
}

/// Passed to the progress callback after every poll.
#[derive(Debug)]
pub struct ProgressReport<'a> {
    pub state: MonitorState,
    pub snapshot: &'a ProgressSnapshot,
    pub elapsed: Duration,
    pub idle: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub state: MonitorState,
    pub final_snapshot: ProgressSnapshot,
    pub elapsed: Duration,
    /// The timeout came from the CPU-sampling check, not the inactivity bound.
    pub hang_suspected: bool,
    /// Tail of the newest crash log, for diagnostics only.
    pub crash_log_tail: Option<Vec<String>>,
}

/// One monitoring session. Create a fresh one per attempt.
pub struct ActivityMonitor {
    settings: MonitorSettings,
    state: MonitorState,
    last: Option<ProgressSnapshot>,
    started: Instant,
    last_activity: Instant,
    last_report: Instant,
    last_hang_check: Option<Instant>,
}

impl ActivityMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let now = Instant::now();
        Self {
            settings,
            state: MonitorState::Initializing,
            last: None,
            started: now,
            last_activity: now,
            last_report: now,
            last_hang_check: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Advance the state machine with one poll's observations.
    pub fn observe(
        &mut self,
        snapshot: &ProgressSnapshot,
        running: bool,
        deletion_marked: bool,
        now: Instant,
    ) -> MonitorState {
        let changed = self
            .last
            .as_ref()
            .map_or(true, |prev| snapshot.differs_from(prev));
        self.last = Some(snapshot.clone());

        let next = if !snapshot.exists {
            if deletion_marked {
                MonitorState::Interrupted
            } else {
                MonitorState::Completed
            }
        } else if !running {
            MonitorState::ProcessCrashed
        } else if changed {
            self.last_activity = now;
            MonitorState::Active
        } else {
            let idle = now.duration_since(self.last_activity);
            if idle >= self.settings.inactivity_timeout {
                MonitorState::TimedOut
            } else if idle >= self.settings.stall_warning {
                MonitorState::Stalled
            } else {
                self.state
            }
        };

        if next != self.state {
            self.log_transition(next, snapshot, now);
        }
        self.state = next;
        next
    }

    fn log_transition(&self, next: MonitorState, snapshot: &ProgressSnapshot, now: Instant) {
        let idle_secs = now.duration_since(self.last_activity).as_secs();
        match next {
            MonitorState::Stalled => warn!(
                idle_secs,
                records = snapshot.line_count,
                "no sentinel activity, worker may be stalled"
            ),
            MonitorState::Active if self.state == MonitorState::Stalled => {
                info!(records = snapshot.line_count, "sentinel activity resumed")
            }
            MonitorState::Completed => info!("sentinel removed by worker, generation complete"),
            MonitorState::Interrupted => {
                warn!("sentinel removed by the harness, not counting as completion")
            }
            MonitorState::TimedOut => warn!(
                idle_secs,
                records = snapshot.line_count,
                "inactivity timeout reached"
            ),
            MonitorState::ProcessCrashed => warn!(
                records = snapshot.line_count,
                last = snapshot.last_record.as_deref().unwrap_or(""),
                "worker exited before removing the sentinel"
            ),
            _ => debug!(state = ?next, "monitor state changed"),
        }
    }

    /// Poll until a terminal state.
    ///
    /// `on_progress` runs after every poll. The caller clears `mark` before
    /// starting the session.
    pub async fn run(
        mut self,
        sentinel: &SentinelFile,
        mark: &DeletionMark,
        probe: &mut dyn WorkerProbe,
        on_progress: &mut dyn FnMut(&ProgressReport),
    ) -> MonitorOutcome {
        info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            timeout_secs = self.settings.inactivity_timeout.as_secs(),
            "monitoring sentinel"
        );
        loop {
            let mut snapshot = sentinel.snapshot();
            let running = snapshot.exists && probe.is_running();
            if snapshot.exists && !running {
                // The worker may delete the sentinel and exit between reads.
                snapshot = sentinel.snapshot();
            }
            let now = Instant::now();
            let state = self.observe(&snapshot, running, mark.is_marked(), now);

            on_progress(&ProgressReport {
                state,
                snapshot: &snapshot,
                elapsed: now.duration_since(self.started),
                idle: now.duration_since(self.last_activity),
            });
            self.maybe_report(&snapshot, now);

            if state.is_terminal() {
                return self.finish(state, snapshot, false);
            }

            if state == MonitorState::Stalled && self.hang_check_due(now) {
                self.last_hang_check = Some(now);
                if let Some(hang) = self.settings.hang.clone() {
                    if sample_for_hang(probe, &hang).await == Some(true) {
                        warn!(
                            idle_secs = now.duration_since(self.last_activity).as_secs(),
                            "worker appears hung (no CPU or memory activity)"
                        );
                        self.state = MonitorState::TimedOut;
                        return self.finish(MonitorState::TimedOut, snapshot, true);
                    }
                }
            }

            sleep(self.settings.poll_interval).await;
        }
    }

    fn hang_check_due(&self, now: Instant) -> bool {
        let Some(hang) = &self.settings.hang else {
            return false;
        };
        self.last_hang_check
            .map_or(true, |at| now.duration_since(at) >= hang.recheck)
    }

    fn maybe_report(&mut self, snapshot: &ProgressSnapshot, now: Instant) {
        if self.settings.report_interval.is_zero()
            || now.duration_since(self.last_report) < self.settings.report_interval
        {
            return;
        }
        self.last_report = now;
        info!(
            elapsed_mins = now.duration_since(self.started).as_secs() / 60,
            records = snapshot.line_count,
            idle_secs = now.duration_since(self.last_activity).as_secs(),
            last = snapshot.last_record.as_deref().unwrap_or(""),
            "generation progress"
        );
    }

    fn finish(
        &self,
        state: MonitorState,
        final_snapshot: ProgressSnapshot,
        hang_suspected: bool,
    ) -> MonitorOutcome {
        let crash_log_tail = if state == MonitorState::ProcessCrashed {
            capture_crash_log(&self.settings.crash_log_globs, self.settings.crash_log_lines)
        } else {
            None
        };
        MonitorOutcome {
            state,
            final_snapshot,
            elapsed: self.started.elapsed(),
            hang_suspected,
            crash_log_tail,
        }
    }
}

/// Take `samples` CPU readings. `None` when usage is unavailable.
async fn sample_for_hang(probe: &mut dyn WorkerProbe, hang: &HangSettings) -> Option<bool> {
    let mut readings = vec![probe.usage()?];
    for _ in 0..hang.samples {
        sleep(hang.sample_interval).await;
        readings.push(probe.usage()?);
    }
    Some(looks_hung(&readings, hang))
}

/// Average CPU below the threshold and RSS within the memory delta.
pub fn looks_hung(readings: &[ResourceUsage], hang: &HangSettings) -> bool {
    let (Some(first), Some(last)) = (readings.first(), readings.last()) else {
        return false;
    };
    if readings.len() < 2 {
        return false;
    }
    let intervals = (readings.len() - 1) as f64;
    let ticks = last.cpu_ticks.saturating_sub(first.cpu_ticks) as f64;
    let seconds = hang.sample_interval.as_secs_f64() * intervals;
    let avg_percent = ticks / (seconds * TICKS_PER_SEC) * 100.0;
    let rss_delta = last.rss_bytes.abs_diff(first.rss_bytes);
    debug!(avg_percent, rss_delta, "hang sample");
    avg_percent < hang.cpu_threshold_percent && rss_delta < hang.memory_delta_bytes
}

/// Last `lines` lines of the newest file matching any of `patterns`.
pub fn capture_crash_log(patterns: &[String], lines: usize) -> Option<Vec<String>> {
    let newest: PathBuf = patterns
        .iter()
        .filter_map(|p| glob::glob(p).ok())
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).ok()?.modified().ok()?;
            path.is_file().then_some((modified, path))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)?;

    let bytes = std::fs::read(&newest).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let tail = all[all.len().saturating_sub(lines)..]
        .iter()
        .map(|l| l.to_string())
        .collect();
    info!(path = %newest.display(), "captured crash log tail");
    Some(tail)
}
