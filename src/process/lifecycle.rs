//! Owns the worker's process identity from launch to termination.
//!
//! A launch goes through a loader when one is installed: the loader starts
//! the real worker and exits, so the handle it produces starts out
//! [`Binding::Pending`] and is rebound once the worker shows up in the
//! process table.

use super::{matches_any, ProcessHost, ResourceUsage, StopSignal};
use crate::config::HarnessConfig;
use crate::sentinel::{DeletionMark, SentinelFile};
use crate::watchdog::WorkerProbe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Interval between liveness checks while waiting for a process to exit.
const EXIT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub install_dir: PathBuf,
    pub executable: Option<PathBuf>,
    pub loader_names: Vec<String>,
    pub worker_names: Vec<String>,
    pub existing_instance_wait: Duration,
    pub cooldown: Duration,
    pub spawn_discovery: Duration,
    pub discovery_poll: Duration,
    pub start_check: Duration,
    pub terminate_wait: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let w = &config.worker;
        Self {
            install_dir: w.install_dir.clone(),
            executable: w.executable.clone(),
            loader_names: w.loader_names.clone(),
            worker_names: w.worker_names.clone(),
            existing_instance_wait: Duration::from_secs(w.existing_instance_wait_secs),
            cooldown: Duration::from_secs(w.cooldown_secs),
            spawn_discovery: Duration::from_secs(w.spawn_discovery_secs),
            discovery_poll: Duration::from_millis(w.discovery_poll_millis.max(1)),
            start_check: Duration::from_secs(w.start_check_secs),
            terminate_wait: Duration::from_secs(w.terminate_wait_secs),
        }
    }

    fn all_names(&self) -> Vec<String> {
        self.worker_names
            .iter()
            .chain(self.loader_names.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableKind {
    /// Starts the worker and exits.
    Loader,
    /// Is the worker.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExecutable {
    pub path: PathBuf,
    pub kind: ExecutableKind,
}

/// Which process is doing the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Launched through a loader; the worker has not been seen yet.
    Pending,
    Resolved(u32),
    /// The loader ran but no worker appeared in time.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    launched_pid: u32,
    kind: ExecutableKind,
    binding: Binding,
}

impl ProcessHandle {
    fn launched(pid: u32, kind: ExecutableKind) -> Self {
        let binding = match kind {
            ExecutableKind::Loader => Binding::Pending,
            ExecutableKind::Direct => Binding::Resolved(pid),
        };
        Self {
            launched_pid: pid,
            kind,
            binding,
        }
    }

    /// A copy of this handle bound to `binding`.
    pub fn rebind(&self, binding: Binding) -> Self {
        Self {
            binding,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub fn launched_pid(&self) -> u32 {
        self.launched_pid
    }

    #[cfg(test)]
    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn via_loader(&self) -> bool {
        self.kind == ExecutableKind::Loader
    }

    pub fn worker_pid(&self) -> Option<u32> {
        match self.binding {
            Binding::Resolved(pid) => Some(pid),
            Binding::Pending | Binding::Failed => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no loader or worker executable found in {install_dir}")]
    ExecutableMissing { install_dir: PathBuf },
    #[error("{name} (pid {pid}) is still running after waiting {waited:?}")]
    AlreadyRunning {
        pid: u32,
        name: String,
        waited: Duration,
    },
    #[error("failed to prepare sentinel: {0}")]
    Sentinel(#[source] std::io::Error),
    #[error("failed to read process table: {0}")]
    ProcessTable(#[source] std::io::Error),
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("loader {loader} exited but no worker appeared within {waited:?}")]
    SpawnNotFound { loader: String, waited: Duration },
    #[error("worker exited immediately (exit code {code:?})")]
    ExitedImmediately { code: Option<i32> },
}

pub struct LifecycleManager<H: ProcessHost> {
    host: H,
    settings: LifecycleSettings,
}

impl<H: ProcessHost> LifecycleManager<H> {
    pub fn new(host: H, settings: LifecycleSettings) -> Self {
        Self { host, settings }
    }

    #[cfg(test)]
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// The configured executable, else the first installed loader, else the
    /// first installed worker.
    pub fn locate_executable(&self) -> Result<WorkerExecutable, LaunchError> {
        let dir = &self.settings.install_dir;
        if let Some(exe) = &self.settings.executable {
            let path = if exe.is_absolute() {
                exe.clone()
            } else {
                dir.join(exe)
            };
            if !path.is_file() {
                return Err(LaunchError::ExecutableMissing {
                    install_dir: dir.clone(),
                });
            }
            let kind = if matches_any(&file_name(&path), &self.settings.loader_names) {
                ExecutableKind::Loader
            } else {
                ExecutableKind::Direct
            };
            return Ok(WorkerExecutable { path, kind });
        }

        let candidates = self
            .settings
            .loader_names
            .iter()
            .map(|n| (n, ExecutableKind::Loader))
            .chain(
                self.settings
                    .worker_names
                    .iter()
                    .map(|n| (n, ExecutableKind::Direct)),
            );
        for (name, kind) in candidates {
            let path = dir.join(name);
            if path.is_file() {
                return Ok(WorkerExecutable { path, kind });
            }
        }
        Err(LaunchError::ExecutableMissing {
            install_dir: dir.clone(),
        })
    }

    /// Start the worker and return a handle to the process doing the work.
    ///
    /// `is_resume` keeps a non-empty sentinel intact; otherwise the sentinel
    /// is recreated empty, with any removal recorded in `mark`.
    pub async fn launch(
        &mut self,
        is_resume: bool,
        sentinel: &SentinelFile,
        mark: &mut DeletionMark,
    ) -> Result<ProcessHandle, LaunchError> {
        let exe = self.locate_executable()?;
        self.wait_for_conflicts().await?;

        let prep = sentinel
            .prepare_for_launch(is_resume, mark)
            .map_err(LaunchError::Sentinel)?;
        debug!(?prep, "sentinel ready");

        self.stop_leftovers().await;

        info!(
            path = %exe.path.display(),
            kind = ?exe.kind,
            is_resume,
            "launching worker"
        );
        let pid = self
            .host
            .spawn(&exe.path, &self.settings.install_dir)
            .map_err(|e| LaunchError::Spawn {
                path: exe.path.clone(),
                source: e,
            })?;
        let handle = ProcessHandle::launched(pid, exe.kind);

        match exe.kind {
            ExecutableKind::Loader => {
                let handle = self.resolve(handle).await;
                match handle.binding {
                    Binding::Resolved(_) => Ok(handle),
                    Binding::Pending | Binding::Failed => Err(LaunchError::SpawnNotFound {
                        loader: file_name(&exe.path),
                        waited: self.settings.spawn_discovery,
                    }),
                }
            }
            ExecutableKind::Direct => {
                sleep(self.settings.start_check).await;
                if !self.host.is_alive(pid) {
                    let code = self.host.exit_code(pid);
                    return Err(LaunchError::ExitedImmediately { code });
                }
                info!(pid, "worker started");
                Ok(handle)
            }
        }
    }

    /// Find the worker a loader started.
    ///
    /// Polls for up to the discovery window, picking the newest matching
    /// process. Returns a rebound handle; never mutates `pending`.
    pub async fn resolve(&mut self, pending: ProcessHandle) -> ProcessHandle {
        if pending.binding != Binding::Pending {
            return pending;
        }
        let deadline = Instant::now() + self.settings.spawn_discovery;
        loop {
            match self.host.processes() {
                Ok(list) => {
                    let newest = list
                        .into_iter()
                        .filter(|e| e.pid != pending.launched_pid)
                        .filter(|e| matches_any(&e.name, &self.settings.worker_names))
                        .max_by_key(|e| e.started_at);
                    if let Some(entry) = newest {
                        info!(
                            loader_pid = pending.launched_pid,
                            worker_pid = entry.pid,
                            name = %entry.name,
                            "worker discovered"
                        );
                        return pending.rebind(Binding::Resolved(entry.pid));
                    }
                }
                Err(e) => warn!(error = %e, "process table read failed during discovery"),
            }
            if Instant::now() >= deadline {
                warn!(
                    loader_pid = pending.launched_pid,
                    waited_secs = self.settings.spawn_discovery.as_secs(),
                    "no worker appeared after loader"
                );
                return pending.rebind(Binding::Failed);
            }
            sleep(self.settings.discovery_poll).await;
        }
    }

    /// Liveness of the worker behind `handle`.
    ///
    /// Loader launches are checked by name: the launched PID is long gone.
    pub fn is_running(&mut self, handle: &ProcessHandle) -> bool {
        match handle.binding {
            Binding::Failed => false,
            Binding::Pending => self.host.is_alive(handle.launched_pid),
            Binding::Resolved(pid) if !handle.via_loader() => self.host.is_alive(pid),
            Binding::Resolved(pid) => match self.host.processes() {
                Ok(list) => {
                    let pids: Vec<u32> = list
                        .into_iter()
                        .filter(|e| matches_any(&e.name, &self.settings.worker_names))
                        .map(|e| e.pid)
                        .collect();
                    pids.into_iter().any(|p| self.host.is_alive(p))
                }
                Err(e) => {
                    debug!(error = %e, "process table unavailable, checking pid directly");
                    self.host.is_alive(pid)
                }
            },
        }
    }

    /// Stop the worker. Returns true when every targeted process is gone.
    ///
    /// Without `force` this sends SIGTERM and escalates to SIGKILL after the
    /// terminate wait. Loader launches target every process matching a
    /// worker or loader name.
    pub async fn terminate(&mut self, handle: &ProcessHandle, force: bool) -> bool {
        let mut targets = Vec::new();
        match handle.binding {
            Binding::Resolved(pid) => targets.push(pid),
            Binding::Pending => targets.push(handle.launched_pid),
            Binding::Failed => {}
        }
        if handle.via_loader() {
            targets.extend(self.matching_pids(&self.settings.all_names()));
        }
        targets.sort_unstable();
        targets.dedup();

        let mut all_stopped = true;
        for pid in targets {
            all_stopped &= self.stop_process(pid, force).await;
        }
        all_stopped
    }

    /// Poll until the worker exits or `timeout` passes.
    pub async fn wait_for_exit(&mut self, handle: &ProcessHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(handle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }

    /// Force-kill every worker and loader process. Used on operator interrupt.
    pub async fn terminate_all(&mut self) -> usize {
        let pids = self.matching_pids(&self.settings.all_names());
        let count = pids.len();
        for pid in pids {
            self.stop_process(pid, true).await;
        }
        count
    }

    pub fn probe<'a>(&'a mut self, handle: &'a ProcessHandle) -> HandleProbe<'a, H> {
        HandleProbe {
            manager: self,
            handle,
        }
    }

    fn matching_pids(&self, names: &[String]) -> Vec<u32> {
        match self.host.processes() {
            Ok(list) => list
                .into_iter()
                .filter(|e| matches_any(&e.name, names))
                .map(|e| e.pid)
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to read process table");
                Vec::new()
            }
        }
    }

    /// Wait for a pre-existing instance to go away, then cool down.
    async fn wait_for_conflicts(&mut self) -> Result<(), LaunchError> {
        let names = self.settings.all_names();
        let running = self.running_instances(&names)?;
        let Some(first) = running.first() else {
            return Ok(());
        };
        warn!(
            pid = first.0,
            name = %first.1,
            wait_secs = self.settings.existing_instance_wait.as_secs(),
            "worker already running, waiting for it to exit"
        );

        let deadline = Instant::now() + self.settings.existing_instance_wait;
        loop {
            sleep(self.settings.discovery_poll).await;
            let running = self.running_instances(&names)?;
            match running.into_iter().next() {
                None => {
                    info!(
                        cooldown_secs = self.settings.cooldown.as_secs(),
                        "previous instance exited"
                    );
                    sleep(self.settings.cooldown).await;
                    return Ok(());
                }
                Some((pid, name)) if Instant::now() >= deadline => {
                    return Err(LaunchError::AlreadyRunning {
                        pid,
                        name,
                        waited: self.settings.existing_instance_wait,
                    });
                }
                Some(_) => {}
            }
        }
    }

    fn running_instances(&self, names: &[String]) -> Result<Vec<(u32, String)>, LaunchError> {
        let list = self.host.processes().map_err(LaunchError::ProcessTable)?;
        Ok(list
            .into_iter()
            .filter(|e| matches_any(&e.name, names))
            .map(|e| (e.pid, e.name))
            .collect())
    }

    async fn stop_leftovers(&mut self) {
        let pids = self.matching_pids(&self.settings.all_names());
        for pid in pids {
            warn!(pid, "stopping leftover worker before launch");
            self.stop_process(pid, false).await;
        }
    }

    async fn stop_process(&mut self, pid: u32, force: bool) -> bool {
        if !self.host.is_alive(pid) {
            return true;
        }
        if !force {
            if let Err(e) = self.host.signal(pid, StopSignal::Terminate) {
                warn!(pid, error = %e, "SIGTERM failed");
            }
            if self.wait_dead(pid, self.settings.terminate_wait).await {
                info!(pid, "worker terminated");
                return true;
            }
            warn!(pid, "worker ignored SIGTERM, killing");
        }
        if let Err(e) = self.host.signal(pid, StopSignal::Kill) {
            warn!(pid, error = %e, "SIGKILL failed");
        }
        let dead = self.wait_dead(pid, self.settings.terminate_wait).await;
        if dead {
            info!(pid, "worker killed");
        } else {
            error!(pid, "worker survived SIGKILL");
        }
        dead
    }

    async fn wait_dead(&mut self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.host.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }
}

/// Liveness and usage of one handle, as seen by the monitor.
pub struct HandleProbe<'a, H: ProcessHost> {
    manager: &'a mut LifecycleManager<H>,
    handle: &'a ProcessHandle,
}

impl<H: ProcessHost> WorkerProbe for HandleProbe<'_, H> {
    fn is_running(&mut self) -> bool {
        self.manager.is_running(self.handle)
    }

    fn usage(&mut self) -> Option<ResourceUsage> {
        let pid = self.handle.worker_pid()?;
        self.manager.host.usage(pid)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
