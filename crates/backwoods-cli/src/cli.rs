use anyhow::{bail, Context, Result};
use backwoods_store::manifest::list_manifest_backups;
use backwoods_store::{BackupWriter, Cleaner, Restorer, StoragePath, StoreConfig};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;
use tracing::info;

/// Command line arguments
#[derive(Parser)]
#[command(name = "backwoods")]
#[command(about = "Encrypted, deduplicating backup store", long_about = None)]
pub struct Cli {
    /// Store configuration (.toml or .json)
    #[arg(short, long, env = "BACKWOODS_CONFIG", default_value = "/etc/backwoods/backwoods.toml")]
    pub config: PathBuf,

    /// Log filter, e.g. `debug` or `backwoods_store=trace`; defaults to RUST_LOG, then `info`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Repair, prune manifests and delete unreferenced blocks
    Clean,
    /// Run the consistency passes only
    Check,
    /// Back up files and directories into a new manifest
    Backup {
        /// Paths to record; directories are walked
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Override the configured host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured set name
        #[arg(long = "set")]
        set_name: Option<String>,
    },
    /// Print every manifest path with its age
    ListManifests,
    /// Recreate the entries of one manifest below a directory
    Restore {
        /// Manifest path, e.g. `manifests/host/set/1700000000`
        manifest: String,
        /// Directory to restore into
        target: PathBuf,
        /// Only restore stored paths matching this regex
        #[arg(long)]
        filter: Option<String>,
    },
}

impl Cli {
    /// Execute the selected subcommand.
    pub fn run(self) -> Result<()> {
        let config = StoreConfig::from_file(&self.config)
            .with_context(|| format!("loading configuration {}", self.config.display()))?;
        match self.command {
            Command::Clean => clean(&config, false),
            Command::Check => clean(&config, true),
            Command::Backup {
                paths,
                host,
                set_name,
            } => backup(&config, paths, host, set_name),
            Command::ListManifests => list_manifests(&config),
            Command::Restore {
                manifest,
                target,
                filter,
            } => restore(&config, &manifest, target, filter.as_deref()),
        }
    }
}

fn clean(config: &StoreConfig, check_only: bool) -> Result<()> {
    let communicator = config.communicator()?;
    let cleaner = Cleaner::new(config.manifest_engine(communicator)?, config.cleaner_config());
    let report = if check_only {
        cleaner.check()?
    } else {
        cleaner.clean()?
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn backup(
    config: &StoreConfig,
    paths: Vec<PathBuf>,
    host: Option<String>,
    set_name: Option<String>,
) -> Result<()> {
    let communicator = config.communicator()?;
    let mut options = config.backup_options();
    if let Some(host) = host {
        options.host = host;
    }
    if let Some(set_name) = set_name {
        options.set_name = set_name;
    }
    let mut writer = BackupWriter::new(
        options,
        config.checksum_engine(),
        config.compression_engine(),
        config.data_engine(communicator.clone())?,
        config.manifest_engine(communicator)?,
    )?;

    let cwd = std::env::current_dir()?;
    for path in paths {
        let path = if path.is_relative() { cwd.join(path) } else { path };
        writer
            .backup_path(&path)
            .with_context(|| format!("backing up {}", path.display()))?;
    }
    let partial = writer.manifest().is_partial();
    let (manifest, stats) = writer.finish()?;
    info!(manifest = %manifest, "backup uploaded");
    println!("{manifest}");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if partial {
        bail!("backup {manifest} is incomplete: {} path(s) failed", stats.failures);
    }
    Ok(())
}

fn list_manifests(config: &StoreConfig) -> Result<()> {
    let communicator = config.communicator()?;
    for path in list_manifest_backups(&communicator)? {
        let age = communicator.age(&path)?;
        println!("{path}\t{}", age.as_secs());
    }
    Ok(())
}

fn restore(config: &StoreConfig, manifest: &str, target: PathBuf, filter: Option<&str>) -> Result<()> {
    let filter = filter
        .map(Regex::new)
        .transpose()
        .context("invalid --filter")?;
    std::fs::create_dir_all(&target)
        .with_context(|| format!("creating {}", target.display()))?;
    let communicator = config.communicator()?;
    let restorer = Restorer::new(config.manifest_engine(communicator)?);
    let stats = restorer.restore_manifest(&StoragePath::from(manifest), &target, filter.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
