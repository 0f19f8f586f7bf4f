use super::{Settings, open_repository};
use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Filter by hostname")]
    hostname: Option<String>,

    #[arg(long, help = "Filter by tag")]
    tag: Vec<String>,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;

        let mut snapshots = repo.list_snapshots().await?;
        let format = self.format.as_deref().unwrap_or("table");

        if let Some(hostname) = &self.hostname {
            snapshots.retain(|s| s.hostname == *hostname);
        }
        if !self.tag.is_empty() {
            snapshots.retain(|s| s.tags.iter().any(|tag| self.tag.contains(tag)));
        }
        if let Some(latest) = self.latest {
            let skip = snapshots.len().saturating_sub(latest);
            snapshots.drain(..skip);
        }

        match format {
            "table" => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                println!(
                    "{:<10} {:<20} {:<15} {:<20} Paths",
                    "ID", "Date", "Host", "Tags"
                );
                println!("{:-<90}", "");
                for snapshot in &snapshots {
                    let paths = snapshot
                        .paths
                        .iter()
                        .map(|p| p.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(",");
                    println!(
                        "{:<10} {:<20} {:<15} {:<20} {}",
                        snapshot.short_id(),
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.tags.join(","),
                        paths
                    );
                }
            }
            "json" => {
                let mut out = Vec::with_capacity(snapshots.len());
                for snapshot in &snapshots {
                    let mut value = serde_json::to_value(snapshot)?;
                    value["id"] = serde_json::json!(snapshot.id.map(|id| id.to_hex()));
                    out.push(value);
                }
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            _ => return Err(anyhow!("Unsupported format: {}", format)),
        }
        Ok(())
    }
}
