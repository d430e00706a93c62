//! Scripted process host for tests.
//!
//! Each spawn consumes one [`LaunchPlan`]. A worker's [`WorkerScript`] is
//! advanced one action per `is_alive` call on its PID, which is exactly one
//! call per monitor poll, so scenarios read as "poll 1 appends, poll 2
//! deletes the sentinel".

use super::{ProcessEntry, ProcessHost, ResourceUsage, StopSignal};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub enum Action {
    Alive,
    Append(String),
    DeleteSentinel,
    Die,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    StayAlive,
    Exit,
}

#[derive(Debug, Clone)]
pub struct WorkerScript {
    actions: VecDeque<Action>,
    after: After,
}

impl WorkerScript {
    pub fn new(actions: Vec<Action>, after: After) -> Self {
        Self {
            actions: actions.into(),
            after,
        }
    }

    /// Alive forever, never touching the sentinel.
    pub fn idle() -> Self {
        Self::new(Vec::new(), After::StayAlive)
    }

    /// Passes the start check, appends `cells` records, deletes the
    /// sentinel, then exits.
    pub fn completes(cells: usize) -> Self {
        let mut actions = vec![Action::Alive];
        actions.extend((0..cells).map(|i| Action::Append(format!("cell {i}"))));
        actions.push(Action::DeleteSentinel);
        Self::new(actions, After::Exit)
    }

    /// Passes the start check, appends `cells` records, then dies.
    pub fn crashes_after(cells: usize) -> Self {
        let mut actions = vec![Action::Alive];
        actions.extend((0..cells).map(|i| Action::Append(format!("cell {i}"))));
        actions.push(Action::Die);
        Self::new(actions, After::Exit)
    }
}

#[derive(Debug, Clone)]
pub enum LaunchPlan {
    /// The spawned program is the worker.
    Direct(WorkerScript),
    /// The spawned program exits at once; `worker_name` shows up after
    /// `appear_after` process-table reads.
    Loader {
        worker_name: String,
        appear_after: u32,
        script: WorkerScript,
    },
    /// The spawn itself fails.
    FailSpawn,
}

#[derive(Debug, Clone)]
struct FakeProcess {
    pid: u32,
    name: String,
    started_at: u64,
    alive: bool,
    exit_code: Option<i32>,
    script: Option<WorkerScript>,
    ignores_term: bool,
    usage: Option<ResourceUsage>,
}

#[derive(Debug, Default)]
struct Inner {
    sentinel: Option<PathBuf>,
    next_pid: u32,
    clock: u64,
    procs: Vec<FakeProcess>,
    pending: Vec<(u32, FakeProcess)>,
    plans: VecDeque<LaunchPlan>,
    spawned: Vec<PathBuf>,
    sentinel_at_spawn: Vec<Option<String>>,
    signals: Vec<(u32, StopSignal)>,
    usage_for_new: Option<ResourceUsage>,
    term_ignored_for_new: bool,
    loader_helper: Option<(String, WorkerScript)>,
}

/// Cheap to clone; clones share state so a test can inspect the host after
/// handing it to the code under test.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    inner: Arc<Mutex<Inner>>,
}

impl FakeHost {
    pub fn new(sentinel: impl Into<PathBuf>) -> Self {
        let host = Self::default();
        {
            let mut inner = host.lock();
            inner.sentinel = Some(sentinel.into());
            inner.next_pid = 1000;
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn plan(&self, plan: LaunchPlan) -> &Self {
        self.lock().plans.push_back(plan);
        self
    }

    /// Newly spawned workers report this fixed usage (zero CPU growth).
    pub fn frozen_usage(&self, usage: ResourceUsage) -> &Self {
        self.lock().usage_for_new = Some(usage);
        self
    }

    /// Newly spawned workers ignore SIGTERM.
    pub fn ignore_term(&self) -> &Self {
        self.lock().term_ignored_for_new = true;
        self
    }

    /// The next loader launch also starts a helper called `name`.
    ///
    /// The helper shows up together with the worker but is newer, so name
    /// discovery binds to it. It comes first in the process table, and its
    /// script advances ahead of the worker's.
    pub fn loader_helper(&self, name: &str, script: WorkerScript) -> &Self {
        self.lock().loader_helper = Some((name.to_string(), script));
        self
    }

    /// A process that was running before the harness started.
    pub fn add_running(&self, name: &str, ignores_term: bool) -> u32 {
        let mut inner = self.lock();
        let pid = inner.alloc_pid();
        let started_at = inner.tick();
        inner.procs.push(FakeProcess {
            pid,
            name: name.to_string(),
            started_at,
            alive: true,
            exit_code: None,
            script: None,
            ignores_term,
            usage: None,
        });
        pid
    }

    pub fn exit_process(&self, pid: u32) {
        if let Some(p) = self.lock().procs.iter_mut().find(|p| p.pid == pid) {
            p.alive = false;
        }
    }

    pub fn spawned(&self) -> Vec<PathBuf> {
        self.lock().spawned.clone()
    }

    pub fn sentinel_at_spawn(&self) -> Vec<Option<String>> {
        self.lock().sentinel_at_spawn.clone()
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.lock().signals.clone()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        self.lock()
            .procs
            .iter()
            .filter(|p| p.alive)
            .map(|p| p.pid)
            .collect()
    }
}

impl Inner {
    fn alloc_pid(&mut self) -> u32 {
        self.next_pid += 1;
        self.next_pid
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn new_process(&mut self, name: String, script: Option<WorkerScript>) -> FakeProcess {
        FakeProcess {
            pid: self.alloc_pid(),
            name,
            started_at: self.tick(),
            alive: true,
            exit_code: None,
            script,
            ignores_term: self.term_ignored_for_new,
            usage: self.usage_for_new,
        }
    }

    fn run_action(&self, action: &Action) {
        let Some(sentinel) = &self.sentinel else { return };
        match action {
            Action::Append(line) => {
                if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(sentinel) {
                    let _ = writeln!(f, "{line}");
                }
            }
            Action::DeleteSentinel => {
                let _ = std::fs::remove_file(sentinel);
            }
            Action::Alive | Action::Die => {}
        }
    }
}

impl ProcessHost for FakeHost {
    fn spawn(&mut self, program: &Path, _cwd: &Path) -> std::io::Result<u32> {
        let mut inner = self.lock();
        inner.spawned.push(program.to_path_buf());
        let snapshot = inner
            .sentinel
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok());
        inner.sentinel_at_spawn.push(snapshot);

        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let plan = inner.plans.pop_front().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no launch planned")
        })?;
        match plan {
            LaunchPlan::Direct(script) => {
                let proc = inner.new_process(name, Some(script));
                let pid = proc.pid;
                inner.procs.push(proc);
                Ok(pid)
            }
            LaunchPlan::Loader {
                worker_name,
                appear_after,
                script,
            } => {
                let mut loader = inner.new_process(name, None);
                loader.alive = false;
                loader.exit_code = Some(0);
                let pid = loader.pid;
                inner.procs.push(loader);
                let worker = inner.new_process(worker_name, Some(script));
                if let Some((name, script)) = inner.loader_helper.take() {
                    let helper = inner.new_process(name, Some(script));
                    inner.pending.push((appear_after, helper));
                }
                inner.pending.push((appear_after, worker));
                Ok(pid)
            }
            LaunchPlan::FailSpawn => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "spawn refused",
            )),
        }
    }

    fn processes(&self) -> std::io::Result<Vec<ProcessEntry>> {
        let mut inner = self.lock();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for (countdown, proc) in std::mem::take(&mut inner.pending) {
            if countdown <= 1 {
                ready.push(proc);
            } else {
                waiting.push((countdown - 1, proc));
            }
        }
        inner.pending = waiting;
        inner.procs.extend(ready);
        Ok(inner
            .procs
            .iter()
            .filter(|p| p.alive)
            .map(|p| ProcessEntry {
                pid: p.pid,
                name: p.name.clone(),
                started_at: p.started_at,
            })
            .collect())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let mut inner = self.lock();
        let Some(idx) = inner.procs.iter().position(|p| p.pid == pid) else {
            return false;
        };
        if !inner.procs[idx].alive {
            return false;
        }
        let next = inner.procs[idx]
            .script
            .as_mut()
            .map(|s| s.actions.pop_front().ok_or(s.after));
        match next {
            None => true,
            Some(Ok(action)) => {
                inner.run_action(&action);
                if matches!(action, Action::Die) {
                    inner.procs[idx].alive = false;
                    inner.procs[idx].exit_code = Some(-1);
                }
                inner.procs[idx].alive
            }
            Some(Err(After::StayAlive)) => true,
            Some(Err(After::Exit)) => {
                inner.procs[idx].alive = false;
                inner.procs[idx].exit_code = Some(0);
                false
            }
        }
    }

    fn exit_code(&mut self, pid: u32) -> Option<i32> {
        self.lock()
            .procs
            .iter()
            .find(|p| p.pid == pid && !p.alive)
            .and_then(|p| p.exit_code)
    }

    fn signal(&mut self, pid: u32, signal: StopSignal) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.signals.push((pid, signal));
        if let Some(p) = inner.procs.iter_mut().find(|p| p.pid == pid) {
            if signal == StopSignal::Kill || !p.ignores_term {
                p.alive = false;
            }
        }
        Ok(())
    }

    fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.lock()
            .procs
            .iter()
            .find(|p| p.pid == pid && p.alive)
            .and_then(|p| p.usage)
    }
}
