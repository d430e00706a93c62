//! Steps around generation that have no state machine of their own: patching
//! the seasons INI before launch, tagging the worker's output files, and
//! packaging them as an installable mod folder.

pub mod package;
pub mod rename;
pub mod seasons_ini;

use crate::unit::Season;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use package::ModFolderArchiver;
pub use rename::TagRenamer;
pub use seasons_ini::SeasonsIni;

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to scan {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("failed to write manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl CollabError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CollabError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Points the worker at the next unit.
pub trait ConfigPatcher {
    /// Save the files about to be patched. Called once before the first unit.
    fn backup(&mut self) -> Result<(), CollabError>;

    /// Make `unit` the one the worker generates. Called before every launch.
    fn set_active_unit(&mut self, unit: Season) -> bool;

    /// Undo everything `set_active_unit` did.
    fn restore(&mut self) -> Result<(), CollabError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenameSummary {
    pub processed: usize,
    pub failed: usize,
}

pub trait FileProcessor {
    /// Give every raw output file in `dir` the unit's extension.
    fn rename_outputs(&self, dir: &Path, unit: Season) -> Result<RenameSummary, CollabError>;

    /// Whether `dir` already holds files carrying the unit's extension.
    fn has_outputs(&self, dir: &Path, unit: Season) -> bool;

    /// Delete the unit's files from `dir`. Returns how many went.
    fn cleanup_outputs(&self, dir: &Path, unit: Season) -> Result<usize, CollabError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveMetadata {
    pub unit: Season,
    pub path: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub trait Archiver {
    /// Package the unit's files from `source_dir`. `None` when nothing was
    /// packaged.
    fn package_unit(&self, unit: Season, source_dir: &Path) -> Option<ArchiveMetadata>;
}

/// The collaborator set a run uses.
pub struct Collaborators {
    pub patcher: Box<dyn ConfigPatcher>,
    pub files: Box<dyn FileProcessor>,
    /// None disables packaging (and with it, output cleanup).
    pub archiver: Option<Box<dyn Archiver>>,
    pub cleanup_outputs: bool,
}

/// True if `name` ends with `suffix`, ignoring ASCII case.
pub(crate) fn has_suffix(name: &str, suffix: &str) -> bool {
    name.len() >= suffix.len()
        && name.is_char_boundary(name.len() - suffix.len())
        && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// Whether a file name belongs to `unit`.
///
/// Seasonal units own files ending in their tagged extension. `NoSeasons`
/// owns raw files that carry no season tag.
pub fn belongs_to(name: &str, unit: Season) -> bool {
    match unit {
        Season::NoSeasons => is_raw_output(name),
        seasonal => has_suffix(name, seasonal.extension()),
    }
}

/// A worker output file that has not been tagged yet.
pub fn is_raw_output(name: &str) -> bool {
    has_suffix(name, crate::unit::RAW_EXTENSION)
        && !Season::SEASONAL
            .iter()
            .any(|s| has_suffix(name, s.extension()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_output_detection() {
        assert!(is_raw_output("Tamriel_x0_y0.cgid"));
        assert!(is_raw_output("Tamriel_x0_y0.CGID"));
        assert!(!is_raw_output("Tamriel_x0_y0.WIN.cgid"));
        assert!(!is_raw_output("Tamriel_x0_y0.aut.cgid"));
        assert!(!is_raw_output("readme.txt"));
    }

    #[test]
    fn test_belongs_to_unit() {
        assert!(belongs_to("a.WIN.cgid", Season::Winter));
        assert!(!belongs_to("a.WIN.cgid", Season::Spring));
        assert!(!belongs_to("a.WIN.cgid", Season::NoSeasons));
        assert!(belongs_to("a.cgid", Season::NoSeasons));
        assert!(!belongs_to("a.cgid", Season::Summer));
    }
}
