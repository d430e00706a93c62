/// The real process host: spawns through tokio, reads the process table from
/// procfs, and signals through nix.
use super::procfs::ProcFs;
use super::{ProcessEntry, ProcessHost, ResourceUsage, StopSignal};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

pub struct SystemHost {
    procfs: ProcFs,
    procfs_available: bool,
    children: HashMap<u32, Child>,
    exit_codes: HashMap<u32, Option<i32>>,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(ProcFs::default())
    }
}

impl SystemHost {
    pub fn new(procfs: ProcFs) -> Self {
        let procfs_available = procfs.list().is_ok();
        if !procfs_available {
            tracing::warn!("process table unavailable, name-based discovery will find nothing");
        }
        Self {
            procfs,
            procfs_available,
            children: HashMap::new(),
            exit_codes: HashMap::new(),
        }
    }

    /// Poll a child we spawned, moving it to `exit_codes` once it exits.
    fn reap(&mut self, pid: u32) -> Option<bool> {
        let child = self.children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                tracing::debug!(pid, code = ?status.code(), "child exited");
                self.children.remove(&pid);
                self.exit_codes.insert(pid, status.code());
                Some(false)
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to poll child");
                self.children.remove(&pid);
                self.exit_codes.insert(pid, None);
                Some(false)
            }
        }
    }
}

/// Signal-0 probe. EPERM means the process exists but is not ours.
fn kill_probe(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl ProcessHost for SystemHost {
    fn spawn(&mut self, program: &Path, cwd: &Path) -> std::io::Result<u32> {
        // Own process group so a stuck worker can be signalled without
        // hitting the harness.
        let child = Command::new(program)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("spawned process has no pid")
        })?;
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn processes(&self) -> std::io::Result<Vec<ProcessEntry>> {
        self.procfs.list()
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        if let Some(alive) = self.reap(pid) {
            return alive;
        }
        if self.exit_codes.contains_key(&pid) {
            return false;
        }
        if self.procfs_available {
            self.procfs.is_alive(pid)
        } else {
            kill_probe(pid)
        }
    }

    fn exit_code(&mut self, pid: u32) -> Option<i32> {
        self.reap(pid);
        self.exit_codes.get(&pid).copied().flatten()
    }

    fn signal(&mut self, pid: u32, signal: StopSignal) -> std::io::Result<()> {
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }

    fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.procfs.usage(pid)
    }
}
