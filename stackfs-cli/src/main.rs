use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use stackfs_core::{MountOptions, StackConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stackfs")]
#[command(about = "A stacking filesystem that forwards every operation to one lower directory")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a stackfs filesystem over a lower directory
    Mount {
        /// Lower directory to stack on
        #[arg(short, long)]
        source: String,

        /// Mount point for the stacked filesystem
        #[arg(short, long)]
        mount: PathBuf,

        #[command(flatten)]
        flags: MountFlags,
    },

    /// Attach to a lower directory without mounting, bootstrap the working
    /// directories and print what a mount would see
    Check {
        /// Lower directory to stack on
        source: String,

        #[command(flatten)]
        flags: MountFlags,
    },
}

#[derive(Args, Debug, Default)]
struct MountFlags {
    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Refuse lower directories that are not on an overlay filesystem
    #[arg(long)]
    require_overlay: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Suppress the mount banner
    #[arg(long)]
    silent: bool,
}

/// Options from the configuration file, with command line flags switched on
/// over them.
fn mount_options(config: &StackConfig, flags: &MountFlags) -> MountOptions {
    let mut options = config.mount.clone();
    options.read_only |= flags.read_only;
    options.require_overlay |= flags.require_overlay;
    options.allow_other |= flags.allow_other;
    options.silent |= flags.silent;
    options
}

fn init_tracing(config: &StackConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stackfs={}", config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);
    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => registry.with(fmt::layer()).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StackConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => StackConfig::default(),
    };
    init_tracing(&config)?;

    match cli.command {
        Commands::Mount { source, mount, flags } => {
            info!("Mounting {} on {}", source, mount.display());
            mount_filesystem(&source, mount, mount_options(&config, &flags)).await?;
        }
        Commands::Check { source, flags } => {
            check_filesystem(&source, mount_options(&config, &flags))?;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn mount_filesystem(source: &str, mountpoint: PathBuf, options: MountOptions) -> Result<()> {
    use stackfs_core::StackFs;

    let fs = StackFs::mount(source, options).with_context(|| format!("attaching to {}", source))?;
    let session = stackfs_linux::mount(fs.clone(), &mountpoint)
        .with_context(|| format!("mounting on {}", mountpoint.display()))?;
    info!("Mounted; press Ctrl-C to unmount");

    tokio::signal::ctrl_c().await?;
    info!("Unmounting {}", mountpoint.display());
    fs.umount_begin();
    drop(session);

    let snapshot = fs.stats().snapshot();
    info!(
        "lookups: {} positive, {} negative; {} nodes created, {} bytes read, {} bytes written",
        snapshot.positive_lookups,
        snapshot.negative_lookups,
        snapshot.nodes_created,
        snapshot.bytes_read,
        snapshot.bytes_written
    );
    fs.detach();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn mount_filesystem(_source: &str, _mountpoint: PathBuf, _options: MountOptions) -> Result<()> {
    anyhow::bail!("mounting is only supported on Linux");
}

#[cfg(target_os = "linux")]
fn check_filesystem(source: &str, options: MountOptions) -> Result<()> {
    use stackfs_core::StackFs;

    let fs = StackFs::mount(source, options).with_context(|| format!("attaching to {}", source))?;
    let work = fs
        .superblock()
        .work()
        .map(|triad| triad.lower_paths())
        .unwrap_or_default();
    let report = serde_json::json!({
        "id": fs.superblock().id().to_string(),
        "options": fs.show_options(),
        "workdirs": work,
        "statfs": fs.statfs()?,
        "stats": fs.stats().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    fs.detach();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_filesystem(_source: &str, _options: MountOptions) -> Result<()> {
    anyhow::bail!("host lower directories are only supported on Linux");
}
