use super::{Settings, format_bytes, open_repository};
use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use packrat_core::restorer::Restorer;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot ID, ID prefix or \"latest\"")]
    snapshot_id: String,

    #[arg(long, short, help = "Target directory for restore")]
    target: PathBuf,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;
        let snapshot = repo.find_snapshot(&self.snapshot_id).await?;

        info!("Restoring {}", snapshot.summary());

        let pb = if cli.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.set_message(format!("Restoring to {}", self.target.display()));
        pb.enable_steady_tick(Duration::from_millis(120));

        let result = Restorer::new(&repo)
            .restore(&snapshot.tree, &self.target)
            .await;
        pb.finish_and_clear();
        let summary = result?;

        println!("Restored snapshot {} to {}", snapshot.short_id(), self.target.display());
        println!(
            "Files: {}, dirs: {}, symlinks: {}, {} written",
            summary.files,
            summary.dirs,
            summary.symlinks,
            format_bytes(summary.bytes)
        );
        if summary.skipped > 0 {
            println!("Skipped {} entries (errors at backup time or special files)", summary.skipped);
        }
        Ok(())
    }
}
