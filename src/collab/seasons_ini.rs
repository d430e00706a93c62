/// Seasons plugin INI patching.
///
/// The plugin reads its active season from a `Season Type` key. Edits are
/// made line by line so comments and layout survive the round trip.
use super::{CollabError, ConfigPatcher};
use crate::unit::{Season, SEASONAL_MODE};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{error, info, warn};

/// `Season Type = 3`, also accepting the `SeasonType` and `Season` spellings.
static SEASON_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\s*(?:season\s*type|season)\s*=\s*)([^;#\r\n]*?)(\s*(?:[;#].*)?)$")
        .unwrap()
});

static SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[([^\]]+)\]\s*$").unwrap());

const DEFAULT_SECTION: &str = "Settings";
const DEFAULT_KEY: &str = "Season Type";

/// Set the season type in INI text.
///
/// The first existing key wins, in whatever section holds it. Without one,
/// the key is added to `[Settings]`, which is created if missing.
pub fn set_season_type(content: &str, value: u8) -> String {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    if let Some(i) = lines.iter().position(|l| SEASON_KEY.is_match(l)) {
        lines[i] = SEASON_KEY
            .replace(&lines[i], format!("${{1}}{value}${{3}}"))
            .into_owned();
    } else {
        let settings = lines.iter().position(|l| {
            SECTION
                .captures(l)
                .is_some_and(|c| c[1].trim().eq_ignore_ascii_case(DEFAULT_SECTION))
        });
        match settings {
            Some(i) => lines.insert(i + 1, format!("{DEFAULT_KEY} = {value}")),
            None => {
                if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                    lines.push(String::new());
                }
                lines.push(format!("[{DEFAULT_SECTION}]"));
                lines.push(format!("{DEFAULT_KEY} = {value}"));
            }
        }
    }

    let mut out = lines.join(newline);
    out.push_str(newline);
    out
}

/// Current season type, if the key is present and numeric.
#[cfg(test)]
pub fn read_season_type(content: &str) -> Option<u8> {
    content
        .lines()
        .find_map(|l| SEASON_KEY.captures(l))
        .and_then(|c| c[2].trim().parse().ok())
}

pub struct SeasonsIni {
    path: PathBuf,
    backup_dir: PathBuf,
    backup_enabled: bool,
    original: Option<String>,
}

impl SeasonsIni {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, backup_enabled: bool) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            backup_enabled,
            original: None,
        }
    }

    pub fn backup_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "seasons.ini".to_string());
        self.backup_dir.join(format!("{name}.bak"))
    }

    fn write_type(&self, value: u8) -> Result<(), CollabError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| CollabError::io(&self.path, e))?;
        std::fs::write(&self.path, set_season_type(&content, value))
            .map_err(|e| CollabError::io(&self.path, e))
    }
}

impl ConfigPatcher for SeasonsIni {
    fn backup(&mut self) -> Result<(), CollabError> {
        if !self.backup_enabled {
            return Ok(());
        }
        if !self.path.exists() {
            warn!(path = %self.path.display(), "seasons INI not found, nothing to back up");
            return Ok(());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| CollabError::io(&self.path, e))?;
        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|e| CollabError::io(&self.backup_dir, e))?;
        let backup = self.backup_path();
        std::fs::write(&backup, &content).map_err(|e| CollabError::io(&backup, e))?;
        self.original = Some(content);
        info!(backup = %backup.display(), "backed up seasons INI");
        Ok(())
    }

    fn set_active_unit(&mut self, unit: Season) -> bool {
        if !unit.is_seasonal() {
            info!("non-seasonal unit, leaving seasons INI alone");
            return true;
        }
        if !self.path.exists() {
            error!(path = %self.path.display(), "seasons INI not found; seasonal generation needs the seasons plugin");
            return false;
        }
        match self.write_type(unit.season_type()) {
            Ok(()) => {
                info!(%unit, season_type = unit.season_type(), "season set");
                true
            }
            Err(e) => {
                error!(%unit, error = %e, "failed to set season");
                false
            }
        }
    }

    /// Put back the backed-up file, or fall back to seasonal mode when there
    /// is no backup.
    fn restore(&mut self) -> Result<(), CollabError> {
        let backup = self.backup_path();
        if backup.exists() {
            std::fs::copy(&backup, &self.path).map_err(|e| CollabError::io(&self.path, e))?;
            info!(path = %self.path.display(), "restored seasons INI from backup");
        } else if let Some(original) = &self.original {
            std::fs::write(&self.path, original).map_err(|e| CollabError::io(&self.path, e))?;
            info!(path = %self.path.display(), "restored seasons INI from memory");
        } else if self.path.exists() {
            self.write_type(SEASONAL_MODE)?;
            info!("no backup, switched seasons INI to seasonal mode");
        } else {
            warn!(path = %self.path.display(), "seasons INI not found, nothing to restore");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "; Seasons of Skyrim\n[Settings]\n; 1-4 fixed, 5 seasonal\nSeason Type = 5 ; comment\nbEnableGrass=1\n";

    #[test]
    fn test_replaces_existing_key_keeping_layout() {
        let out = set_season_type(SAMPLE, 2);
        assert_eq!(
            out,
            "; Seasons of Skyrim\n[Settings]\n; 1-4 fixed, 5 seasonal\nSeason Type = 2 ; comment\nbEnableGrass=1\n"
        );
        assert_eq!(read_season_type(&out), Some(2));
    }

    #[test]
    fn test_key_in_other_section_and_alternate_spelling() {
        let ini = "[General]\nseasontype=1\n[Settings]\nfoo=bar\n";
        let out = set_season_type(ini, 4);
        assert_eq!(out, "[General]\nseasontype=4\n[Settings]\nfoo=bar\n");
    }

    #[test]
    fn test_missing_key_goes_into_settings() {
        let out = set_season_type("[Settings]\nfoo=bar\n", 3);
        assert_eq!(out, "[Settings]\nSeason Type = 3\nfoo=bar\n");
    }

    #[test]
    fn test_missing_section_is_appended() {
        let out = set_season_type("[Other]\nx=1", 1);
        assert_eq!(out, "[Other]\nx=1\n\n[Settings]\nSeason Type = 1\n");
        assert_eq!(set_season_type("", 1), "[Settings]\nSeason Type = 1\n");
    }

    #[test]
    fn test_crlf_preserved() {
        let out = set_season_type("[Settings]\r\nSeason Type=5\r\n", 1);
        assert_eq!(out, "[Settings]\r\nSeason Type=1\r\n");
    }

    #[test]
    fn test_patcher_backup_patch_restore() {
        let dir = tempdir().unwrap();
        let ini = dir.path().join("po3_SeasonsOfSkyrim.ini");
        std::fs::write(&ini, SAMPLE).unwrap();
        let mut patcher = SeasonsIni::new(&ini, dir.path().join("backups"), true);

        patcher.backup().unwrap();
        assert!(patcher.backup_path().is_file());

        assert!(patcher.set_active_unit(Season::Summer));
        assert_eq!(read_season_type(&std::fs::read_to_string(&ini).unwrap()), Some(3));

        patcher.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&ini).unwrap(), SAMPLE);
    }

    #[test]
    fn test_restore_without_backup_sets_seasonal_mode() {
        let dir = tempdir().unwrap();
        let ini = dir.path().join("po3_SeasonsOfSkyrim.ini");
        std::fs::write(&ini, "[Settings]\nSeason Type = 1\n").unwrap();
        let mut patcher = SeasonsIni::new(&ini, dir.path().join("backups"), false);
        patcher.backup().unwrap();
        assert!(!patcher.backup_path().exists());

        patcher.restore().unwrap();
        assert_eq!(
            read_season_type(&std::fs::read_to_string(&ini).unwrap()),
            Some(SEASONAL_MODE)
        );
    }

    #[test]
    fn test_missing_ini_fails_seasonal_but_not_no_seasons() {
        let dir = tempdir().unwrap();
        let mut patcher = SeasonsIni::new(dir.path().join("missing.ini"), dir.path(), true);
        assert!(!patcher.set_active_unit(Season::Winter));
        assert!(patcher.set_active_unit(Season::NoSeasons));
        patcher.backup().unwrap();
        patcher.restore().unwrap();
    }
}
