//! Process table read straight from procfs.
//!
//! Each live process contributes `/proc/<pid>/stat` (state, CPU ticks, start
//! time, RSS), `/proc/<pid>/comm` (name, truncated by the kernel) and
//! `/proc/<pid>/cmdline` (used to recover the full name when `comm` was
//! cut). The root is configurable so tests can build a fake tree.

use super::{ProcessEntry, ResourceUsage, COMM_MAX};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Assumed page size for converting RSS pages to bytes.
const PAGE_SIZE: u64 = 4096;

/// Upper bound on bytes read from any single procfs file.
const MAX_PROC_READ: u64 = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub start_time: u64,
    pub rss_pages: u64,
}

impl StatFields {
    pub fn is_dead(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse the single line of `/proc/<pid>/stat`.
///
/// The name sits in parentheses and may itself contain spaces or `)`, so the
/// split happens at the last closing parenthesis.
pub fn parse_stat(content: &str) -> Option<StatFields> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state); field N lives at rest[N - 3].
    let field = |n: usize| -> Option<u64> { rest.get(n - 3)?.parse().ok() };
    Some(StatFields {
        comm,
        state: rest.first()?.chars().next()?,
        utime: field(14)?,
        stime: field(15)?,
        start_time: field(22)?,
        rss_pages: field(24)?,
    })
}

/// Basename of `argv[0]` from a NUL-separated cmdline.
///
/// Handles both `/` and `\` separators; Wine reports Windows paths.
pub fn argv0_basename(cmdline: &[u8]) -> Option<String> {
    let first = cmdline.split(|b| *b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(first);
    let base = text.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}

/// Pick the best name: `comm`, or the cmdline basename when `comm` was
/// truncated and the basename extends it.
pub fn resolve_name(comm: &str, argv0: Option<&str>) -> String {
    if comm.len() >= COMM_MAX {
        if let Some(full) = argv0 {
            if full.len() > comm.len()
                && full.is_char_boundary(comm.len())
                && full[..comm.len()].eq_ignore_ascii_case(comm)
            {
                return full.to_string();
            }
        }
    }
    comm.to_string()
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_bounded(&self, path: &Path) -> Option<Vec<u8>> {
        let file = File::open(path).ok()?;
        let mut reader = BufReader::new(file).take(MAX_PROC_READ);
        let mut bytes = Vec::with_capacity(256);
        reader.read_to_end(&mut bytes).ok()?;
        Some(bytes)
    }

    pub fn stat(&self, pid: u32) -> Option<StatFields> {
        let bytes = self.read_bounded(&self.root.join(pid.to_string()).join("stat"))?;
        parse_stat(&String::from_utf8_lossy(&bytes))
    }

    /// All live (non-zombie) processes.
    pub fn list(&self) -> std::io::Result<Vec<ProcessEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(p) if p > 0 => p,
                _ => continue,
            };
            // Processes exit between read_dir and read; skip them silently.
            let Some(stat) = self.stat(pid) else { continue };
            if stat.is_dead() {
                continue;
            }
            let dir = self.root.join(pid.to_string());
            let comm = self
                .read_bounded(&dir.join("comm"))
                .map(|b| String::from_utf8_lossy(&b).trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| stat.comm.clone());
            let argv0 = self
                .read_bounded(&dir.join("cmdline"))
                .and_then(|b| argv0_basename(&b));
            entries.push(ProcessEntry {
                pid,
                name: resolve_name(&comm, argv0.as_deref()),
                started_at: stat.start_time,
            });
        }
        Ok(entries)
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.stat(pid).is_some_and(|s| !s.is_dead())
    }

    pub fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let stat = self.stat(pid)?;
        Some(ResourceUsage {
            cpu_ticks: stat.utime + stat.stime,
            rss_bytes: stat.rss_pages * PAGE_SIZE,
        })
    }
}
