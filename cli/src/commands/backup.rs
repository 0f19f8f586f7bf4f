use super::{Settings, format_bytes, open_repository};
use anyhow::{Context, Result, anyhow};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use packrat_core::{Archiver, Shutdown, SnapshotOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(required = true, help = "Paths to backup")]
    paths: Vec<PathBuf>,

    #[arg(long, help = "Backup tags")]
    tag: Vec<String>,

    #[arg(long, help = "Exclude patterns (gitignore syntax), added to the configured ones")]
    exclude: Vec<String>,

    #[arg(long, help = "Parent snapshot ID (default: latest snapshot of the same paths)")]
    parent: Option<String>,

    #[arg(long, help = "Read every file even if the parent says it is unchanged")]
    force: bool,

    #[arg(long, help = "Hostname override")]
    hostname: Option<String>,

    #[arg(long, help = "Print the summary as JSON")]
    json: bool,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;

        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => hostname::get()
                .context("reading hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        let mut absolute = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            absolute.push(std::path::absolute(path)?);
        }

        let parent = if self.force {
            None
        } else if let Some(prefix) = &self.parent {
            Some(repo.find_snapshot(prefix).await?)
        } else {
            repo.find_latest_snapshot(&absolute, &hostname).await?
        };
        if let Some(parent) = &parent {
            info!("Using parent snapshot {}", parent.short_id());
        }

        let mut options = settings.archiver;
        options.excludes.extend(self.exclude.iter().cloned());
        let archiver = Archiver::new(repo.clone(), options);

        let (stop, shutdown) = Shutdown::new();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping backup");
                let _ = stop.send(true);
            }
        });

        let pb = if cli.quiet || self.json {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(120));

        let progress = {
            let pb = pb.clone();
            let stats = archiver.stats();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(250));
                loop {
                    ticker.tick().await;
                    let s = stats.summary();
                    pb.set_message(format!(
                        "{} files, {} dirs, {} read, {} written",
                        s.files_new + s.files_changed + s.files_unchanged,
                        s.dirs,
                        format_bytes(s.bytes_read),
                        format_bytes(s.bytes_written),
                    ));
                }
            })
        };

        let snapshot_options = SnapshotOptions {
            parent: parent.and_then(|p| p.id),
            tags: self.tag.clone(),
            hostname: Some(hostname),
        };
        let result = archiver
            .snapshot(&self.paths, snapshot_options, shutdown)
            .await;
        progress.abort();
        pb.finish_and_clear();
        let (snapshot, summary) = result?;

        if self.json {
            let out = serde_json::json!({
                "snapshot": snapshot.id.map(|id| id.to_hex()),
                "tree": snapshot.tree.to_hex(),
                "summary": summary,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            return Ok(());
        }

        println!("Snapshot {} saved", snapshot.short_id());
        println!(
            "Files: {} new, {} changed, {} unmodified",
            summary.files_new, summary.files_changed, summary.files_unchanged
        );
        println!("Dirs: {}, removed since parent: {}", summary.dirs, summary.deleted);
        println!(
            "Read {}, added {} in {} blobs",
            format_bytes(summary.bytes_read),
            format_bytes(summary.bytes_written),
            summary.blobs_written
        );
        if summary.errors > 0 {
            println!("{} entries could not be read and were recorded as errors", summary.errors);
        }
        Ok(())
    }
}
