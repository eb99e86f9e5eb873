use std::sync::Arc;

use anyhow::Context;
use bucketfs::client::{ClientDefaults, StoreClient};
use bucketfs::common::MountConfig;
use bucketfs::drive::Drive;
use bucketfs::fuse::BucketFuse;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bucketfs")]
#[command(version, about = "Mount an object-storage bucket as a filesystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a bucket
    Mount {
        /// Directory to mount the bucket at
        #[arg(value_name = "MOUNTPOINT")]
        mountpoint: String,

        /// Path to the configuration file
        #[arg(long, default_value = "bucketfs.toml")]
        config: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mount { mountpoint, config } => mount(&mountpoint, &config),
    }
}

fn mount(mountpoint: &str, config_path: &str) -> anyhow::Result<()> {
    let config = MountConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path))?;

    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    let defaults = ClientDefaults {
        uid,
        gid,
        file_mode: config.options.default_file_mode,
        dir_mode: config.options.default_dir_mode,
    };

    let client = Arc::new(
        StoreClient::from_config(&config.store, defaults).context("building object client")?,
    );
    let drive = Drive::new(client, config.options.clone(), uid, gid);

    let fuse = BucketFuse::new(drive);
    fuse.connect().context("connecting to bucket")?;

    tracing::info!(mountpoint, "mounting bucket filesystem");
    fuse.mount(mountpoint)
}
