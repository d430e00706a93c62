//! Retry & resume orchestrator.
//!
//! Units run strictly one after another. For each unit the runner launches
//! the worker, watches the sentinel until a terminal state, and either
//! hands the unit to the collaborators or tries again, up to the retry
//! bound. An abandoned unit does not stop the ones after it.

use crate::collab::{ArchiveMetadata, Collaborators, RenameSummary};
use crate::config::HarnessConfig;
use crate::lock::GenerationLock;
use crate::process::{LifecycleManager, LifecycleSettings, ProcessHandle, ProcessHost};
use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicy};
use crate::sentinel::{DeletionMark, SentinelFile};
use crate::signals::Shutdown;
use crate::status::{HarnessState, StatusTracker};
use crate::unit::Season;
use crate::watchdog::{
    ActivityMonitor, MonitorOutcome, MonitorSettings, MonitorState, ProgressReport,
};
use crate::workdir::WorkDir;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    NotStarted,
    Launching,
    Monitoring,
    Retrying,
    Succeeded,
    Abandoned,
    /// Cut short by an operator interrupt.
    Interrupted,
    /// Never reached because the run was interrupted first.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: Season,
    pub state: UnitState,
    pub outcomes: Vec<AttemptOutcome>,
    /// Sentinel records seen in the last monitoring session.
    pub records: usize,
    pub elapsed: Duration,
    /// Outputs already existed, so nothing was launched.
    pub short_circuited: bool,
    pub renamed: Option<RenameSummary>,
    pub archive: Option<ArchiveMetadata>,
    pub cleaned: usize,
    /// Post-processing problems. They never undo a success.
    pub warnings: Vec<String>,
}

impl UnitReport {
    fn new(unit: Season) -> Self {
        Self {
            unit,
            state: UnitState::NotStarted,
            outcomes: Vec::new(),
            records: 0,
            elapsed: Duration::ZERO,
            short_circuited: false,
            renamed: None,
            archive: None,
            cleaned: 0,
            warnings: Vec::new(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// True only when every unit succeeded and nobody pulled the plug.
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.units.iter().all(|u| u.state == UnitState::Succeeded)
    }

    pub fn units_in(&self, state: UnitState) -> Vec<Season> {
        self.units
            .iter()
            .filter(|u| u.state == state)
            .map(|u| u.unit)
            .collect()
    }

    /// Human-readable summary, one line per unit.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.units.len() + 2);
        for u in &self.units {
            let mut line = format!(
                "{:<11} {:<11} attempts={}",
                u.unit.display_name(),
                format!("{:?}", u.state).to_lowercase(),
                u.attempts()
            );
            if u.short_circuited {
                line.push_str(" (already generated)");
            }
            if let Some(archive) = &u.archive {
                line.push_str(&format!(" archive={}", archive.path.display()));
            }
            lines.push(line);
            for w in &u.warnings {
                lines.push(format!("  warning: {w}"));
            }
        }
        let verdict = if self.succeeded() {
            "all units succeeded"
        } else if self.interrupted {
            "run interrupted"
        } else {
            "run failed"
        };
        let secs = self.elapsed.as_secs();
        lines.push(format!("{verdict} in {}m{:02}s", secs / 60, secs % 60));
        lines
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub units: Vec<Season>,
    pub retry: RetryPolicy,
    pub startup_grace: Duration,
    pub exit_linger: Duration,
    pub resume_interrupted: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            units: config.seasons.units.clone(),
            retry: RetryPolicy::new(
                config.retry.max_attempts,
                Duration::from_secs(config.retry.retry_delay_secs),
            ),
            startup_grace: Duration::from_secs(config.sentinel.startup_grace_secs),
            exit_linger: Duration::from_secs(config.worker.exit_linger_secs),
            resume_interrupted: config.retry.resume_interrupted,
        }
    }
}

/// Result of one launch-and-monitor attempt, or an operator interrupt.
enum Attempt {
    Finished(AttemptOutcome),
    ShutdownRequested,
}

pub struct Runner<H: ProcessHost> {
    lifecycle: LifecycleManager<H>,
    monitor: MonitorSettings,
    settings: RunnerSettings,
    workdir: WorkDir,
    collab: Collaborators,
    status: StatusTracker,
    shutdown: Shutdown,
    emergency_done: bool,
}

impl<H: ProcessHost> Runner<H> {
    pub fn new(
        host: H,
        config: &HarnessConfig,
        collab: Collaborators,
        status: StatusTracker,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            lifecycle: LifecycleManager::new(host, LifecycleSettings::from_config(config)),
            monitor: MonitorSettings::from_config(config),
            settings: RunnerSettings::from_config(config),
            workdir: WorkDir::from_config(config),
            collab,
            status,
            shutdown,
            emergency_done: false,
        }
    }

    /// Process every unit in order and report how each ended.
    pub async fn run(&mut self) -> RunReport {
        let started = Instant::now();
        self.status.update(HarnessState::Starting);
        info!(
            units = ?self.settings.units,
            max_attempts = self.settings.retry.max_attempts,
            "starting generation run"
        );

        if let Err(e) = self.collab.patcher.backup() {
            warn!(error = %e, "config backup failed, continuing without one");
        }

        let units = self.settings.units.clone();
        let mut reports = Vec::with_capacity(units.len());
        for (index, unit) in units.into_iter().enumerate() {
            if self.shutdown.is_requested() {
                let mut report = UnitReport::new(unit);
                report.state = UnitState::Skipped;
                reports.push(report);
                continue;
            }
            let report = self.run_unit(index, unit).await;
            match report.state {
                UnitState::Succeeded => self.status.record_completed(unit),
                UnitState::Abandoned => self.status.record_abandoned(unit),
                _ => {}
            }
            reports.push(report);
        }

        let interrupted = self.shutdown.is_requested();
        if interrupted {
            self.emergency_cleanup().await;
        } else if let Err(e) = self.collab.patcher.restore() {
            warn!(error = %e, "failed to restore config");
        }

        self.status.update(HarnessState::Finished);
        let report = RunReport {
            units: reports,
            interrupted,
            elapsed: started.elapsed(),
        };
        info!(
            succeeded = ?report.units_in(UnitState::Succeeded),
            abandoned = ?report.units_in(UnitState::Abandoned),
            interrupted,
            "generation run finished"
        );
        report
    }

    /// Stop every worker and put the config back. Runs at most once.
    ///
    /// The sentinel and generation lock are left alone so the next run can
    /// resume.
    pub async fn emergency_cleanup(&mut self) {
        if self.emergency_done {
            return;
        }
        self.emergency_done = true;
        self.status.update(HarnessState::ShuttingDown);
        warn!("emergency cleanup: stopping worker and restoring config");

        let killed = self.lifecycle.terminate_all().await;
        if killed > 0 {
            info!(killed, "worker processes stopped");
        }
        if let Err(e) = self.collab.patcher.restore() {
            error!(error = %e, "failed to restore config during emergency cleanup");
        }
    }

    async fn run_unit(&mut self, index: usize, unit: Season) -> UnitReport {
        let started = Instant::now();
        let mut report = UnitReport::new(unit);
        self.status.set_unit(index, unit);

        let sentinel = SentinelFile::new(self.workdir.sentinel());
        let lock = GenerationLock::new(self.workdir.generation_lock());
        let grass = self.workdir.grass_dir();

        info!(%unit, index = index + 1, total = self.settings.units.len(), "starting unit");

        if !sentinel.exists() && self.collab.files.has_outputs(&grass, unit) {
            info!(%unit, "outputs already present and no sentinel, skipping generation");
            if let Err(e) = lock.release() {
                debug!(error = %e, "failed to clear stale generation lock");
            }
            report.short_circuited = true;
            report.state = UnitState::Succeeded;
            self.post_process(unit, &mut report);
            report.elapsed = started.elapsed();
            return report;
        }

        let resume_previous = self.settings.resume_interrupted
            && lock.is_present()
            && sentinel.snapshot().has_content();
        if resume_previous {
            info!(%unit, "previous run was interrupted mid-generation, resuming its progress");
        }

        let mut retry = self.settings.retry.start();
        let mut mark = DeletionMark::default();
        loop {
            let attempt = retry.next_attempt();
            let is_resume = attempt > 0 || resume_previous;
            report.state = UnitState::Launching;
            self.status.set_attempt(attempt + 1);

            let outcome = match self
                .attempt(unit, attempt, is_resume, &sentinel, &lock, &mut mark, &mut report)
                .await
            {
                Attempt::Finished(outcome) => outcome,
                Attempt::ShutdownRequested => {
                    report.state = UnitState::Interrupted;
                    report.elapsed = started.elapsed();
                    return report;
                }
            };
            report.outcomes.push(outcome);

            match retry.record(outcome) {
                RetryDecision::Proceed => {
                    report.state = UnitState::Succeeded;
                    info!(%unit, attempts = retry.attempts(), "unit generated");
                    self.post_process(unit, &mut report);
                    break;
                }
                RetryDecision::Retry { attempt } => {
                    report.state = UnitState::Retrying;
                    self.status.update(HarnessState::Retrying);
                    info!(
                        %unit,
                        next_attempt = attempt + 1,
                        delay_secs = self.settings.retry.delay.as_secs(),
                        "retrying unit"
                    );
                    let shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(self.settings.retry.delay) => {}
                        _ = shutdown.wait() => {
                            report.state = UnitState::Interrupted;
                            break;
                        }
                    }
                }
                RetryDecision::Abandon => {
                    report.state = UnitState::Abandoned;
                    error!(
                        %unit,
                        attempts = retry.attempts(),
                        history = ?retry.history(),
                        "unit abandoned"
                    );
                    if let Err(e) = lock.release() {
                        warn!(error = %e, "failed to remove generation lock");
                    }
                    break;
                }
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    /// One launch and monitoring session.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &mut self,
        unit: Season,
        attempt: u32,
        is_resume: bool,
        sentinel: &SentinelFile,
        lock: &GenerationLock,
        mark: &mut DeletionMark,
        report: &mut UnitReport,
    ) -> Attempt {
        let max = self.settings.retry.max_attempts;
        if let Err(e) = lock.acquire(&format!("{unit} (attempt {}/{max})", attempt + 1)) {
            warn!(path = %lock.path().display(), error = %e, "failed to create generation lock");
        }

        self.status.update(HarnessState::PatchingConfig);
        if !self.collab.patcher.set_active_unit(unit) {
            warn!(%unit, "could not point the worker at this unit");
            return Attempt::Finished(AttemptOutcome::LaunchFailed);
        }

        self.status.update(HarnessState::Launching);
        info!(%unit, attempt = attempt + 1, max, is_resume, "launching attempt");
        let shutdown = self.shutdown.clone();
        let launched = tokio::select! {
            r = self.lifecycle.launch(is_resume, sentinel, mark) => r,
            _ = shutdown.wait() => return Attempt::ShutdownRequested,
        };
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%unit, error = %e, "launch failed");
                return Attempt::Finished(AttemptOutcome::LaunchFailed);
            }
        };

        tokio::select! {
            _ = sleep(self.settings.startup_grace) => {}
            _ = shutdown.wait() => return Attempt::ShutdownRequested,
        }
        if !sentinel.exists() {
            warn!(
                path = %sentinel.path().display(),
                "sentinel missing after startup grace, worker may be slow to start"
            );
        }

        mark.clear();
        report.state = UnitState::Monitoring;
        self.status.update(HarnessState::Monitoring);
        let outcome = {
            let monitor = ActivityMonitor::new(self.monitor.clone());
            let status = &mut self.status;
            let mut probe = self.lifecycle.probe(&handle);
            let on_progress: &mut dyn FnMut(&ProgressReport) = &mut |r| {
                status.set_progress(r);
                status.update(HarnessState::Monitoring);
            };
            tokio::select! {
                outcome = monitor.run(sentinel, mark, &mut probe, on_progress) => outcome,
                _ = shutdown.wait() => return Attempt::ShutdownRequested,
            }
        };
        report.records = outcome.final_snapshot.line_count;

        Attempt::Finished(self.settle(unit, &handle, lock, outcome).await)
    }

    /// Turn a terminal monitor state into an attempt outcome and deal with
    /// the worker accordingly.
    async fn settle(
        &mut self,
        unit: Season,
        handle: &ProcessHandle,
        lock: &GenerationLock,
        outcome: MonitorOutcome,
    ) -> AttemptOutcome {
        let result = match outcome.state {
            MonitorState::Completed => AttemptOutcome::Succeeded,
            MonitorState::Interrupted => AttemptOutcome::Interrupted,
            MonitorState::TimedOut if outcome.hang_suspected => AttemptOutcome::Hung,
            MonitorState::TimedOut => AttemptOutcome::TimedOut,
            MonitorState::ProcessCrashed => AttemptOutcome::Crashed,
            other => {
                error!(state = ?other, "monitor ended in a non-terminal state");
                AttemptOutcome::Crashed
            }
        };

        if result == AttemptOutcome::Succeeded {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to remove generation lock");
            }
            if !self
                .lifecycle
                .wait_for_exit(handle, self.settings.exit_linger)
                .await
            {
                info!(
                    linger_secs = self.settings.exit_linger.as_secs(),
                    "worker still running after completion, closing it"
                );
                self.lifecycle.terminate(handle, false).await;
            }
            return result;
        }

        if let Some(tail) = &outcome.crash_log_tail {
            warn!(%unit, "crash log tail:\n{}", tail.join("\n"));
        }
        warn!(
            %unit,
            outcome = ?result,
            records = outcome.final_snapshot.line_count,
            elapsed_secs = outcome.elapsed.as_secs(),
            "attempt failed"
        );
        if !self.lifecycle.terminate(handle, true).await {
            error!(%unit, "worker could not be stopped");
        }
        result
    }

    /// Rename, package, then clean up. Failures are warnings only.
    fn post_process(&self, unit: Season, report: &mut UnitReport) {
        self.status.update(HarnessState::PostProcessing);
        let grass = self.workdir.grass_dir();

        match self.collab.files.rename_outputs(&grass, unit) {
            Ok(summary) => {
                if summary.failed > 0 {
                    report
                        .warnings
                        .push(format!("{} output files could not be renamed", summary.failed));
                }
                report.renamed = Some(summary);
            }
            Err(e) => {
                warn!(%unit, error = %e, "renaming outputs failed");
                report.warnings.push(format!("rename failed: {e}"));
            }
        }

        let Some(archiver) = &self.collab.archiver else {
            return;
        };
        let Some(archive) = archiver.package_unit(unit, &grass) else {
            report
                .warnings
                .push("no archive created, outputs left in place".to_string());
            return;
        };
        report.archive = Some(archive);

        if self.collab.cleanup_outputs {
            match self.collab.files.cleanup_outputs(&grass, unit) {
                Ok(n) => report.cleaned = n,
                Err(e) => {
                    warn!(%unit, error = %e, "cleaning up outputs failed");
                    report.warnings.push(format!("cleanup failed: {e}"));
                }
            }
        }
    }
}
