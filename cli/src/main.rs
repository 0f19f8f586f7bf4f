mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, init::InitCommand, key::KeyAddCommand, ls::LsCommand,
    rebuild_index::RebuildIndexCommand, restore::RestoreCommand, snapshots::SnapshotsCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "packrat",
    about = "Deduplicating, encrypted backups",
    long_about = "Packrat splits files into content-defined chunks, stores each chunk once in encrypted pack files, and records every backup as a snapshot"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, env = "PACKRAT_REPO", help = "Repository path")]
    repo: Option<PathBuf>,

    #[arg(long, global = true, env = "PACKRAT_PASSWORD", hide_env_values = true, help = "Repository password")]
    password: Option<String>,

    #[arg(long, global = true, help = "Settings file (default: config.toml in the user config directory)")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Add a password to the repository")]
    KeyAdd(KeyAddCommand),

    #[command(about = "Create a new backup")]
    Backup(BackupCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "List files in a snapshot")]
    Ls(LsCommand),

    #[command(about = "Restore files from a snapshot")]
    Restore(RestoreCommand),

    #[command(about = "Rewrite the index as a single file, dropping packs that are gone")]
    RebuildIndex(RebuildIndexCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    debug!("starting packrat");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::KeyAdd(ref cmd) => cmd.run(&cli).await,
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli).await,
        Commands::Ls(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::RebuildIndex(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "packrat={level},packrat_core={level},packrat_backends={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
