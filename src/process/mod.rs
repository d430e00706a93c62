pub mod host;
pub mod lifecycle;
pub mod procfs;

#[cfg(test)]
pub mod fake;

use std::path::Path;

pub use host::SystemHost;
pub use lifecycle::{LaunchError, LifecycleManager, LifecycleSettings, ProcessHandle};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable name as reported by the OS.
    pub name: String,
    /// Monotonic start marker (boot-relative ticks); larger is newer.
    pub started_at: u64,
}

/// CPU and memory counters for a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    /// User + system CPU time in clock ticks.
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask politely (SIGTERM).
    Terminate,
    /// No negotiation (SIGKILL).
    Kill,
}

/// Everything the harness needs from the operating system's process layer.
///
/// Kept behind a trait so the lifecycle manager and the orchestrator can be
/// driven by a scripted host in tests.
pub trait ProcessHost: Send {
    /// Start `program` with `cwd` as working directory. Returns its PID.
    fn spawn(&mut self, program: &Path, cwd: &Path) -> std::io::Result<u32>;

    /// Snapshot of live processes.
    fn processes(&self) -> std::io::Result<Vec<ProcessEntry>>;

    /// Whether `pid` is alive. Reaps our own exited children.
    fn is_alive(&mut self, pid: u32) -> bool;

    /// Exit code of a child we spawned, once it has exited.
    fn exit_code(&mut self, pid: u32) -> Option<i32>;

    fn signal(&mut self, pid: u32, signal: StopSignal) -> std::io::Result<()>;

    fn usage(&self, pid: u32) -> Option<ResourceUsage>;
}

/// Maximum length the kernel keeps of a process name.
pub const COMM_MAX: usize = 15;

/// Case-insensitive process name match.
///
/// The kernel truncates names to 15 bytes, so a reported name of exactly
/// that length also matches a longer configured name with the same prefix.
pub fn name_matches(reported: &str, wanted: &str) -> bool {
    if reported.eq_ignore_ascii_case(wanted) {
        return true;
    }
    reported.len() == COMM_MAX
        && wanted.len() > COMM_MAX
        && wanted.is_char_boundary(COMM_MAX)
        && reported.eq_ignore_ascii_case(&wanted[..COMM_MAX])
}

pub fn matches_any(reported: &str, names: &[String]) -> bool {
    names.iter().any(|n| name_matches(reported, n))
}
