mod collab;
mod config;
mod lock;
mod preflight;
mod process;
mod retry;
mod runner;
mod sentinel;
mod signals;
mod status;
mod unit;
mod watchdog;
mod workdir;

use anyhow::Context;
use clap::Parser;
use collab::{Archiver, Collaborators, ModFolderArchiver, SeasonsIni, TagRenamer};
use config::{HarnessConfig, Overrides};
use lock::HarnessLock;
use process::{LifecycleManager, LifecycleSettings, SystemHost};
use runner::Runner;
use signals::Shutdown;
use status::{StatusFile, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use unit::Season;
use workdir::WorkDir;

/// Runs a game engine through unattended grass cache generation, one
/// season at a time: launch, watch the sentinel file, retry and resume
/// until every season is done.
#[derive(Parser, Debug)]
#[command(name = "cachesmith", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "cachesmith.toml")]
    config: PathBuf,

    /// Game install directory (overrides config)
    #[arg(short, long)]
    install_dir: Option<PathBuf>,

    /// Season to generate; repeat for several (overrides config)
    #[arg(short, long = "season", value_name = "SEASON")]
    seasons: Vec<Season>,

    /// Max attempts per season (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Inactivity timeout in minutes (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (monitor polls, process discovery)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings, errors and the final report
    #[arg(short, long)]
    quiet: bool,

    /// Print the last run's status file and exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = HarnessConfig::load(&cli.config)?;
    config.apply(Overrides {
        install_dir: cli.install_dir,
        seasons: cli.seasons,
        max_attempts: cli.retries,
        inactivity_timeout_mins: cli.timeout,
    });
    config.validate()?;
    let workdir = WorkDir::from_config(&config);

    if cli.status {
        match StatusFile::new(workdir.status()).read_raw()? {
            Some(raw) => println!("{raw}"),
            None => println!("No status file at {} (no run yet)", workdir.status().display()),
        }
        return Ok(true);
    }

    if cli.dry_run {
        print_resolved(&config, &workdir);
        return Ok(true);
    }

    let locator = LifecycleManager::new(
        SystemHost::default(),
        LifecycleSettings::from_config(&config),
    );
    preflight::check(&config, &workdir, &locator)?;
    workdir
        .init()
        .with_context(|| format!("failed to create {}", workdir.data_dir().display()))?;
    let _lock = HarnessLock::acquire(&workdir.harness_lock())?;

    let shutdown = Shutdown::new();
    signals::install(shutdown.clone()).context("failed to install signal handlers")?;

    let status = StatusTracker::new(
        workdir.status(),
        config.seasons.units.len(),
        config.retry.max_attempts,
    );
    let collab = build_collaborators(&config, &workdir);
    let mut runner = Runner::new(SystemHost::default(), &config, collab, status, shutdown);
    let report = runner.run().await;

    for line in report.summary_lines() {
        println!("{line}");
    }
    Ok(report.succeeded())
}

fn build_collaborators(config: &HarnessConfig, workdir: &WorkDir) -> Collaborators {
    let archiver = config.output.archive.then(|| {
        Box::new(ModFolderArchiver::new(
            config.install_path(&config.output.archive_dir),
        )) as Box<dyn Archiver>
    });
    Collaborators {
        patcher: Box::new(SeasonsIni::new(
            config.install_path(&config.seasons.ini_file),
            workdir.backups_dir(),
            config.seasons.backup,
        )),
        files: Box::new(TagRenamer::new(config.output.rename_workers)),
        archiver,
        cleanup_outputs: config.output.cleanup_outputs,
    }
}

fn print_resolved(config: &HarnessConfig, workdir: &WorkDir) {
    println!("cachesmith v{}", env!("CARGO_PKG_VERSION"));
    println!("install dir:  {}", workdir.root().display());
    let lifecycle = LifecycleManager::new(
        SystemHost::default(),
        LifecycleSettings::from_config(config),
    );
    match lifecycle.locate_executable() {
        Ok(exe) => println!("executable:   {} ({:?})", exe.path.display(), exe.kind),
        Err(e) => println!("executable:   {e}"),
    }
    println!("sentinel:     {}", workdir.sentinel().display());
    let issues = preflight::find_issues(config, workdir, &lifecycle);
    if issues.is_empty() {
        println!("environment:  ok");
    }
    for issue in issues {
        println!("environment:  {issue}");
    }
    println!("output dir:   {}", workdir.grass_dir().display());
    let units: Vec<String> = config
        .seasons
        .units
        .iter()
        .map(|s| format!("{} ({})", s, s.extension()))
        .collect();
    println!("seasons:      {}", units.join(", "));
    println!(
        "monitor:      poll {}s, stall warning {}s, inactivity timeout {}m",
        config.monitor.poll_interval_secs,
        config.monitor.stall_warning_secs,
        config.monitor.inactivity_timeout_mins
    );
    println!(
        "retry:        {} attempts, {}s apart, resume interrupted: {}",
        config.retry.max_attempts, config.retry.retry_delay_secs, config.retry.resume_interrupted
    );
    if config.output.archive {
        println!(
            "archive dir:  {}",
            config.install_path(&config.output.archive_dir).display()
        );
    }
    println!("Dry run, config validated, not running.");
}
