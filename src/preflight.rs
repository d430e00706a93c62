//! Environment checks run once before the first launch.
//!
//! A missing plugin or a full disk would otherwise surface as one failed
//! attempt after another for every unit, so everything that can be known
//! up front is checked here and reported together.

use crate::config::HarnessConfig;
use crate::process::{LaunchError, LifecycleManager, ProcessHost};
use crate::workdir::WorkDir;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Scratch file written and removed to prove the output tree is writable.
const WRITE_CHECK_NAME: &str = ".cachesmith_write_check";

#[derive(Debug, thiserror::Error)]
pub enum Issue {
    #[error("install directory {0} does not exist")]
    MissingInstall(PathBuf),
    #[error("{0}")]
    NoExecutable(#[from] LaunchError),
    #[error("required file missing: {0}")]
    MissingFile(PathBuf),
    #[error("output directory {0} does not exist")]
    MissingOutputDir(PathBuf),
    #[error("no write permission in {path}: {source}")]
    NotWritable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to query free space on {path}: {source}")]
    SpaceQuery {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("low disk space on {path}: {available} bytes free, {required} required")]
    LowSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("environment check failed: {}", summarize(.0))]
pub struct PreflightError(pub Vec<Issue>);

fn summarize(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every problem found, in check order. Empty means ready to launch.
///
/// With checks disabled only the install directory is verified.
pub fn find_issues<H: ProcessHost>(
    config: &HarnessConfig,
    workdir: &WorkDir,
    lifecycle: &LifecycleManager<H>,
) -> Vec<Issue> {
    let root = workdir.root();
    if !root.is_dir() {
        return vec![Issue::MissingInstall(root.to_path_buf())];
    }
    let checks = &config.preflight;
    if !checks.enabled {
        return Vec::new();
    }

    let mut issues = Vec::new();
    if let Err(e) = lifecycle.locate_executable() {
        issues.push(Issue::from(e));
    }

    let seasonal = config.seasons.units.iter().any(|u| u.is_seasonal());
    let ini = seasonal.then(|| config.install_path(&config.seasons.ini_file));
    for path in checks
        .required_files
        .iter()
        .map(|f| config.install_path(f))
        .chain(ini)
    {
        if !path.is_file() {
            issues.push(Issue::MissingFile(path));
        }
    }

    if let Some(issue) = check_writable(&workdir.grass_dir()) {
        issues.push(issue);
    }

    let required = checks.min_free_gb.saturating_mul(GIB);
    match fs2::available_space(root) {
        Ok(available) if available < required => issues.push(Issue::LowSpace {
            path: root.to_path_buf(),
            available,
            required,
        }),
        Ok(available) => {
            info!(free_gb = available / GIB, "disk space ok");
        }
        Err(e) => issues.push(Issue::SpaceQuery {
            path: root.to_path_buf(),
            source: e,
        }),
    }
    issues
}

/// Run all checks, logging each problem. Fails if any were found.
pub fn check<H: ProcessHost>(
    config: &HarnessConfig,
    workdir: &WorkDir,
    lifecycle: &LifecycleManager<H>,
) -> Result<(), PreflightError> {
    let issues = find_issues(config, workdir, lifecycle);
    if issues.is_empty() {
        info!("environment checks passed");
        return Ok(());
    }
    for issue in &issues {
        warn!("{issue}");
    }
    Err(PreflightError(issues))
}

/// The output directory, or its parent when the worker has yet to create it.
fn check_writable(grass_dir: &Path) -> Option<Issue> {
    let target = if grass_dir.is_dir() {
        grass_dir
    } else {
        match grass_dir.parent() {
            Some(p) if p.is_dir() => p,
            _ => return Some(Issue::MissingOutputDir(grass_dir.to_path_buf())),
        }
    };
    let scratch = target.join(WRITE_CHECK_NAME);
    if let Err(e) = std::fs::write(&scratch, b"") {
        return Some(Issue::NotWritable {
            path: target.to_path_buf(),
            source: e,
        });
    }
    let _ = std::fs::remove_file(&scratch);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeHost;
    use crate::process::LifecycleSettings;
    use crate::unit::Season;
    use tempfile::TempDir;

    struct Install {
        dir: TempDir,
        config: HarnessConfig,
    }

    impl Install {
        /// A complete install: loader, worker, plugins and seasons INI.
        fn complete() -> Self {
            let dir = tempfile::tempdir().unwrap();
            for file in [
                "SkyrimSE.exe",
                "skse64_loader.exe",
                "Data/SKSE/Plugins/GrassControl.ini",
                "Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini",
            ] {
                let path = dir.path().join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"").unwrap();
            }
            let mut config = HarnessConfig::default();
            config.worker.install_dir = dir.path().to_path_buf();
            config.preflight.min_free_gb = 0;
            Self { dir, config }
        }

        fn remove(&self, file: &str) {
            std::fs::remove_file(self.dir.path().join(file)).unwrap();
        }

        fn issues(&self) -> Vec<Issue> {
            let workdir = WorkDir::from_config(&self.config);
            let lifecycle = LifecycleManager::new(
                FakeHost::new(workdir.sentinel()),
                LifecycleSettings::from_config(&self.config),
            );
            find_issues(&self.config, &workdir, &lifecycle)
        }
    }

    #[test]
    fn test_complete_install_passes() {
        let install = Install::complete();
        assert!(install.issues().is_empty());
        // The scratch file does not linger.
        assert!(!install.dir.path().join("Data").join(WRITE_CHECK_NAME).exists());
    }

    #[test]
    fn test_missing_grass_plugin_is_reported() {
        let install = Install::complete();
        install.remove("Data/SKSE/Plugins/GrassControl.ini");
        let issues = install.issues();
        assert_eq!(issues.len(), 1);
        assert!(
            matches!(&issues[0], Issue::MissingFile(p) if p.ends_with("GrassControl.ini")),
            "{issues:?}"
        );
    }

    #[test]
    fn test_seasons_ini_only_required_for_seasonal_units() {
        let mut install = Install::complete();
        install.remove("Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini");
        assert!(matches!(
            install.issues().as_slice(),
            [Issue::MissingFile(p)] if p.ends_with("po3_SeasonsOfSkyrim.ini")
        ));

        install.config.seasons.units = vec![Season::NoSeasons];
        assert!(install.issues().is_empty());
    }

    #[test]
    fn test_low_disk_space_is_reported() {
        let mut install = Install::complete();
        install.config.preflight.min_free_gb = u64::MAX;
        let issues = install.issues();
        assert!(
            matches!(&issues[..], [Issue::LowSpace { required: u64::MAX, .. }]),
            "{issues:?}"
        );
    }

    #[test]
    fn test_all_problems_reported_together() {
        let mut install = Install::complete();
        install.remove("SkyrimSE.exe");
        install.remove("skse64_loader.exe");
        install.remove("Data/SKSE/Plugins/GrassControl.ini");
        install.config.preflight.min_free_gb = u64::MAX;
        let issues = install.issues();
        // No executable, two missing files, low space.
        assert_eq!(issues.len(), 4, "{issues:?}");
        assert!(matches!(issues[0], Issue::NoExecutable(_)));
        let err = PreflightError(issues);
        assert!(err.to_string().contains("GrassControl.ini"));
    }

    #[test]
    fn test_missing_install_short_circuits() {
        let mut install = Install::complete();
        install.config.worker.install_dir = install.dir.path().join("nope");
        assert!(matches!(
            install.issues().as_slice(),
            [Issue::MissingInstall(_)]
        ));
    }

    #[test]
    fn test_disabled_checks_only_need_install_dir() {
        let mut install = Install::complete();
        install.remove("Data/SKSE/Plugins/GrassControl.ini");
        install.config.preflight.enabled = false;
        assert!(install.issues().is_empty());
    }

    #[test]
    fn test_missing_output_parent_is_reported() {
        let mut install = Install::complete();
        install.config.output.grass_dir = PathBuf::from("Nowhere/Grass");
        assert!(matches!(
            install.issues().as_slice(),
            [Issue::MissingOutputDir(_)]
        ));
    }
}
