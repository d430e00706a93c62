use super::{belongs_to, ArchiveMetadata, Archiver, CollabError};
use crate::unit::Season;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Stages each unit as a mod folder a mod manager can install:
///
/// ```text
/// <output_dir>/Grass_Cache_Winter/
///     Data/Grass/*.WIN.cgid
///     meta.ini
///     manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct ModFolderArchiver {
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct Manifest<'a> {
    #[serde(flatten)]
    metadata: &'a ArchiveMetadata,
    display_name: &'static str,
    season_type: u8,
    extension: &'static str,
    generator: String,
    files: Vec<String>,
}

impl ModFolderArchiver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn mod_root(&self, unit: Season) -> PathBuf {
        self.output_dir
            .join(format!("Grass_Cache_{}", unit.display_name().replace(' ', "_")))
    }

    fn build(&self, unit: Season, source_dir: &Path) -> Result<Option<ArchiveMetadata>, CollabError> {
        let files: Vec<PathBuf> = WalkDir::new(source_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| belongs_to(&e.file_name().to_string_lossy(), unit))
            .map(|e| e.into_path())
            .collect();
        if files.is_empty() {
            warn!(%unit, dir = %source_dir.display(), "no files to package");
            return Ok(None);
        }

        let root = self.mod_root(unit);
        if root.exists() {
            std::fs::remove_dir_all(&root).map_err(|e| CollabError::io(&root, e))?;
        }
        let grass = root.join("Data").join("Grass");
        std::fs::create_dir_all(&grass).map_err(|e| CollabError::io(&grass, e))?;

        let mut names = Vec::with_capacity(files.len());
        let mut total_bytes = 0;
        for src in &files {
            let Some(name) = src.file_name() else { continue };
            let dest = grass.join(name);
            total_bytes += std::fs::copy(src, &dest).map_err(|e| CollabError::io(src, e))?;
            names.push(name.to_string_lossy().to_string());
        }
        names.sort();

        let metadata = ArchiveMetadata {
            unit,
            path: root.clone(),
            file_count: names.len(),
            total_bytes,
            created_at: Utc::now(),
        };

        let meta_ini = root.join("meta.ini");
        std::fs::write(&meta_ini, meta_ini_content(unit, &metadata))
            .map_err(|e| CollabError::io(&meta_ini, e))?;

        let manifest = Manifest {
            metadata: &metadata,
            display_name: unit.display_name(),
            season_type: unit.season_type(),
            extension: unit.extension(),
            generator: format!("cachesmith {}", env!("CARGO_PKG_VERSION")),
            files: names,
        };
        let manifest_path = root.join("manifest.json");
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .map_err(|e| CollabError::io(&manifest_path, e))?;

        Ok(Some(metadata))
    }
}

/// Mod Organizer 2 metadata.
fn meta_ini_content(unit: Season, metadata: &ArchiveMetadata) -> String {
    format!(
        "[General]\nmodid=0\nversion=1.0\nnewestVersion=1.0\ncategory=23\n\
         installationFile=Generated by cachesmith\n\n\
         [comments]\nGrass cache for {} ({} files)\nGenerated: {}\nSeason Type: {}\nExtension: {}\n",
        unit.display_name(),
        metadata.file_count,
        metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
        unit.season_type(),
        unit.extension(),
    )
}

impl Archiver for ModFolderArchiver {
    fn package_unit(&self, unit: Season, source_dir: &Path) -> Option<ArchiveMetadata> {
        match self.build(unit, source_dir) {
            Ok(Some(metadata)) => {
                info!(
                    %unit,
                    path = %metadata.path.display(),
                    files = metadata.file_count,
                    mb = metadata.total_bytes / (1024 * 1024),
                    "packaged mod folder"
                );
                Some(metadata)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%unit, error = %e, "packaging failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_package_stages_mod_folder() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        std::fs::write(src.path().join("a.WIN.cgid"), b"1234").unwrap();
        std::fs::write(src.path().join("b.WIN.cgid"), b"56").unwrap();
        std::fs::write(src.path().join("c.SPR.cgid"), b"x").unwrap();

        let archiver = ModFolderArchiver::new(out.path());
        let meta = archiver.package_unit(Season::Winter, src.path()).unwrap();
        assert_eq!(meta.file_count, 2);
        assert_eq!(meta.total_bytes, 6);
        assert_eq!(meta.path, out.path().join("Grass_Cache_Winter"));
        assert!(meta.path.join("Data/Grass/a.WIN.cgid").is_file());
        assert!(!meta.path.join("Data/Grass/c.SPR.cgid").exists());
        assert!(meta.path.join("meta.ini").is_file());

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(meta.path.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["unit"], "winter");
        assert_eq!(manifest["season_type"], 1);
        assert_eq!(manifest["file_count"], 2);
        assert_eq!(manifest["files"][0], "a.WIN.cgid");

        // The source files stay put; cleanup is a separate step.
        assert!(src.path().join("a.WIN.cgid").exists());
    }

    #[test]
    fn test_package_without_files_is_none() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        std::fs::write(src.path().join("a.cgid"), b"raw").unwrap();
        let archiver = ModFolderArchiver::new(out.path());
        assert!(archiver.package_unit(Season::Summer, src.path()).is_none());
        assert!(!archiver.mod_root(Season::Summer).exists());
    }

    #[test]
    fn test_repackaging_replaces_previous_folder() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let archiver = ModFolderArchiver::new(out.path());
        std::fs::write(src.path().join("old.AUT.cgid"), b"o").unwrap();
        archiver.package_unit(Season::Autumn, src.path()).unwrap();

        std::fs::remove_file(src.path().join("old.AUT.cgid")).unwrap();
        std::fs::write(src.path().join("new.AUT.cgid"), b"n").unwrap();
        let meta = archiver.package_unit(Season::Autumn, src.path()).unwrap();
        assert_eq!(meta.file_count, 1);
        assert!(!meta.path.join("Data/Grass/old.AUT.cgid").exists());
    }

    #[test]
    fn test_no_seasons_folder_name() {
        let archiver = ModFolderArchiver::new("/out");
        assert_eq!(
            archiver.mod_root(Season::NoSeasons),
            PathBuf::from("/out/Grass_Cache_No_Seasons")
        );
    }
}
