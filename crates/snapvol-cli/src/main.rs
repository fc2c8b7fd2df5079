//! # snapvol CLI
//!
//! Operator entry points for snapshot volume images: integrity checks,
//! agent injection, stale clone cleanup and report maintenance.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapvol_check::{CheckStatus, IntegrityCheckJob};
use snapvol_config::logging::{init_logging, LogLevel};
use snapvol_config::Config;
use snapvol_image::{ClonePurpose, CloneSpec, SnapshotImageSession};
use snapvol_inject::ScriptManifest;
use snapvol_manifest::{validate_asset, InvalidAsset};

mod reports;
mod wiring;

use wiring::Services;

/// snapvol - block-device access to snapshot volumes
#[derive(Parser)]
#[command(name = "snapvol")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the standard locations
    #[arg(long, global = true, env = "SNAPVOL_CONFIG")]
    config: Option<PathBuf>,

    /// Log more (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a snapshot, check its volumes' filesystems and record the result
    Check {
        #[arg(value_parser = parse_asset)]
        asset: String,
        epoch: u64,

        /// Check only these volume GUIDs instead of the manifest's included set
        #[arg(long = "include", value_name = "GUID")]
        include: Vec<String>,
    },

    /// Inject the diagnostic agent into a snapshot's OS volume
    Inject {
        #[arg(value_parser = parse_asset)]
        asset: String,
        epoch: u64,

        /// Script to auto-run after boot; relative paths resolve against the scripts dir
        #[arg(long = "script", value_name = "PATH")]
        scripts: Vec<PathBuf>,
    },

    /// Tear down a clone left behind by an interrupted run
    Cleanup {
        #[arg(value_parser = parse_asset)]
        asset: String,
        epoch: u64,

        /// verification, integrityCheck or export
        purpose: ClonePurpose,
    },

    /// Maintain stored check reports
    Reports {
        #[command(subcommand)]
        command: reports::ReportsCommands,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Asset keys become report paths and dataset names; refuse malformed ones
/// before anything touches the disk.
fn parse_asset(value: &str) -> std::result::Result<String, InvalidAsset> {
    validate_asset(value)?;
    Ok(value.to_string())
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file locations, in load order
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    });

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };

    match cli.command {
        Commands::Check {
            asset,
            epoch,
            include,
        } => cmd_check(&config, &asset, epoch, include),
        Commands::Inject {
            asset,
            epoch,
            scripts,
        } => cmd_inject(&config, &asset, epoch, &scripts),
        Commands::Cleanup {
            asset,
            epoch,
            purpose,
        } => cmd_cleanup(&config, &asset, epoch, purpose),
        Commands::Reports { command } => reports::run(&config, command),
        Commands::Config { command } => cmd_config(&config, command),
    }
}

fn warn_if_unprivileged() {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root; clone and loop device operations will likely fail");
    }
}

fn cmd_check(config: &Config, asset: &str, epoch: u64, include: Vec<String>) -> Result<()> {
    warn_if_unprivileged();
    let services = Services::from_config(config);
    let integrity = wiring::integrity_checker(config);
    let job = IntegrityCheckJob::new(
        &services.clones,
        &services.factory,
        &integrity,
        services.options.clone(),
    );

    let include: Option<BTreeSet<String>> = if include.is_empty() {
        None
    } else {
        Some(include.into_iter().collect())
    };
    let report = job
        .run(asset, epoch, include.as_ref())
        .with_context(|| format!("Integrity check of {}@{} failed", asset, epoch))?;

    println!();
    println!("  Filesystem check: {}@{}", asset, epoch);
    for result in &report.results {
        let mark = match result.status {
            CheckStatus::Pass => "ok  ",
            CheckStatus::Fail => "FAIL",
        };
        println!("    [{}] {}", mark, result.guid);
    }
    let report_path = integrity.reports().path_for(asset, epoch)?;
    println!("  Report: {}", report_path.display());
    println!();

    let failed = report.results.iter().filter(|r| !r.passed()).count();
    if failed > 0 {
        anyhow::bail!("{} volume(s) failed the filesystem check", failed);
    }
    Ok(())
}

fn cmd_inject(config: &Config, asset: &str, epoch: u64, scripts: &[PathBuf]) -> Result<()> {
    warn_if_unprivileged();
    let services = Services::from_config(config);
    let scripts = ScriptManifest::resolve(&config.inject.scripts_dir, scripts)
        .context("Invalid script list")?;

    wiring::injector(config)
        .inject_snapshot(
            &services.clones,
            &services.factory,
            asset,
            epoch,
            services.options.clone(),
            &scripts,
        )
        .with_context(|| format!("Injection into {}@{} failed", asset, epoch))?;

    println!(
        "Injected diagnostic agent into {}@{} ({} script(s))",
        asset,
        epoch,
        scripts.scripts.len()
    );
    Ok(())
}

fn cmd_cleanup(config: &Config, asset: &str, epoch: u64, purpose: ClonePurpose) -> Result<()> {
    warn_if_unprivileged();
    let services = Services::from_config(config);
    let spec = CloneSpec::from_asset(asset, epoch, purpose);

    let existed = services
        .clones
        .exists(&spec)
        .with_context(|| format!("Failed to query clone {}", spec.dataset_name()))?;
    SnapshotImageSession::cleanup_for(&services.clones, &spec, &mut []);

    if !existed {
        println!("No clone {} to clean up", spec.dataset_name());
    } else if services.clones.exists(&spec).unwrap_or(true) {
        anyhow::bail!("Clone {} could not be removed; see log", spec.dataset_name());
    } else {
        println!("Removed clone {}", spec.dataset_name());
    }
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let text = toml::to_string_pretty(config).context("Failed to render config")?;
            print!("{}", text);
        }
        ConfigCommands::Path => {
            println!("{}", snapvol_config::SYSTEM_CONFIG_PATH);
            if let Some(path) = Config::user_config_path() {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
