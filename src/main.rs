// src/main.rs

use anyhow::Result;
use burrow::cache::{Cache, DEFAULT_LOCK_DEADLINE};
use burrow::manifest::PackageReference;
use burrow::platform::Platform;
use burrow::resolver;
use burrow::sources::{Config, Source, SourceLocator, SourceSet};
use burrow::state::StateStore;
use burrow::upgrade::{self, UpgradeOutcome};
use clap::{Parser, Subcommand};
use semver::Version;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_STATE_DIR: &str = "/var/lib/burrow";

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about = "Per-project isolated toolchain manager", long_about = None)]
struct Cli {
    /// State directory holding the database, cache, and active links
    #[arg(short = 'd', long, default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Environment name records are scoped to
    #[arg(short, long, default_value = "default", global = true)]
    env: String,

    /// Manifest source (local path or repository URL); repeatable, later
    /// sources shadow earlier ones
    #[arg(short, long = "source", global = true)]
    sources: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory and database
    Init,
    /// Synchronize manifest sources (and self-upgrade if channel-bound)
    Sync {
        /// Re-fetch remote sources even if their TTL has not elapsed
        #[arg(short, long)]
        force: bool,
    },
    /// Install a package reference (name, name@version, or name@channel)
    Install {
        /// Package reference to install
        reference: String,
    },
    /// Uninstall a package from the environment
    Uninstall {
        /// Package name to uninstall
        name: String,
    },
    /// List installed packages in the environment
    List,
    /// Upgrade a channel-bound package to its channel's current version
    Upgrade {
        /// Package name to upgrade
        name: String,
    },
}

/// Build the source overlay: the built-in source first, then each
/// configured locator in order.
fn open_sources(locators: &[String]) -> Result<SourceSet> {
    let config = Config {
        sources: locators
            .iter()
            .map(|locator| {
                if locator.starts_with("http://") || locator.starts_with("https://") {
                    SourceLocator::RemoteUrl(locator.clone())
                } else {
                    SourceLocator::LocalPath(PathBuf::from(locator))
                }
            })
            .collect(),
        ..Config::default()
    };
    let builtin = Source::builtin("builtin", Vec::new())?;
    Ok(SourceSet::from_config(&config, builtin)?)
}

fn open_cache(state_dir: &Path) -> Result<Cache> {
    Ok(Cache::open(state_dir.join("cache"))?)
}

fn active_root(state_dir: &Path) -> PathBuf {
    state_dir.join("active")
}

fn print_sync_report(report: &burrow::sources::SyncReport) {
    for name in &report.synced {
        println!("Synced source: {}", name);
    }
    for failure in &report.failures {
        eprintln!("Warning: {}", failure);
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let platform = Platform::host();

    match cli.command {
        Some(Commands::Init) => {
            info!("Initializing state directory at {}", cli.state_dir.display());
            let store = StateStore::open(&cli.state_dir)?;
            open_cache(&cli.state_dir)?;
            println!("Initialized state at: {}", store.path().display());
            Ok(())
        }
        Some(Commands::Sync { force }) => {
            let mut sources = open_sources(&cli.sources)?;
            let report = sources.sync(force);
            print_sync_report(&report);

            // Upgrade the tool itself if it was installed from a channel
            let exe = std::env::current_exe()?;
            if let Some(reference) = upgrade::self_reference(&exe) {
                let cache = open_cache(&cli.state_dir)?;
                let current = Version::parse(env!("CARGO_PKG_VERSION"))?;
                match upgrade::self_upgrade(
                    &mut sources,
                    &cache,
                    &reference,
                    &current,
                    &exe,
                    &platform,
                    DEFAULT_LOCK_DEADLINE,
                ) {
                    Ok(UpgradeOutcome::Upgraded { from, to }) => {
                        println!("Upgraded {} from {} to {}; restart to use it", reference, from, to);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Self-upgrade failed: {}", e),
                }
            }
            Ok(())
        }
        Some(Commands::Install { reference }) => {
            let reference = PackageReference::parse(&reference)?;
            let mut sources = open_sources(&cli.sources)?;
            let report = sources.sync(false);
            print_sync_report(&report);

            let resolved = resolver::resolve(&sources.snapshot(), &reference, &platform)?;
            info!("Resolved {} to {}-{}", reference, resolved.name, resolved.version);

            let cache = open_cache(&cli.state_dir)?;
            let artifact_dir =
                cache.fetch_resolved(&resolved, sources.http_client(), DEFAULT_LOCK_DEADLINE)?;

            let link = upgrade::activate(
                &active_root(&cli.state_dir),
                &upgrade::active_link_name(&resolved),
                &artifact_dir,
            )?;

            let mut store = StateStore::open(&cli.state_dir)?;
            store.record(&cli.env, &resolved, resolved.channel.as_deref())?;

            println!("Installed {} {}", resolved.name, resolved.version);
            println!("  Active at: {}", link.display());
            if let Some(channel) = &resolved.channel {
                println!("  Tracking channel: {}", channel);
            }
            Ok(())
        }
        Some(Commands::Uninstall { name }) => {
            let mut store = StateStore::open(&cli.state_dir)?;
            let Some(record) = store.get(&cli.env, &name)? else {
                return Err(anyhow::anyhow!(
                    "Package '{}' is not installed in environment '{}'",
                    name,
                    cli.env
                ));
            };

            let link = active_root(&cli.state_dir).join(record.reference());
            if link.symlink_metadata().is_ok() {
                std::fs::remove_file(&link)?;
            }
            store.remove(&cli.env, &name)?;

            println!("Uninstalled {} {}", record.name, record.version);
            Ok(())
        }
        Some(Commands::List) => {
            let store = StateStore::open(&cli.state_dir)?;
            let records = store.list(&cli.env)?;

            if records.is_empty() {
                println!("No packages installed in environment '{}'.", cli.env);
            } else {
                println!("Installed packages ({}):", cli.env);
                for record in &records {
                    print!("  {} {}", record.name, record.version);
                    if let Some(channel) = &record.channel {
                        print!(" (channel: {})", channel);
                    }
                    println!();
                }
                println!("\nTotal: {} package(s)", records.len());
            }
            Ok(())
        }
        Some(Commands::Upgrade { name }) => {
            let mut store = StateStore::open(&cli.state_dir)?;
            let Some(record) = store.get(&cli.env, &name)? else {
                return Err(anyhow::anyhow!(
                    "Package '{}' is not installed in environment '{}'",
                    name,
                    cli.env
                ));
            };

            let mut sources = open_sources(&cli.sources)?;
            let cache = open_cache(&cli.state_dir)?;

            let outcome = upgrade::upgrade_channel(
                &mut sources,
                &cache,
                &mut store,
                &active_root(&cli.state_dir),
                &record,
                &platform,
                DEFAULT_LOCK_DEADLINE,
            )?;

            match outcome {
                UpgradeOutcome::Upgraded { from, to } => {
                    println!("Upgraded {} from {} to {}", name, from, to);
                }
                UpgradeOutcome::UpToDate => {
                    println!("{} is up to date ({})", name, record.version);
                }
                UpgradeOutcome::Pinned => {
                    println!(
                        "{} is pinned to {} and does not track a channel",
                        name, record.version
                    );
                }
            }
            Ok(())
        }
        None => {
            println!("Burrow Toolchain Manager v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'burrow --help' for usage information");
            Ok(())
        }
    }
}
