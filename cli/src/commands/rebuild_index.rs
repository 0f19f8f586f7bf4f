use super::{Settings, open_repository};
use anyhow::Result;
use clap::Args;
use packrat_core::PackID;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Args)]
pub struct RebuildIndexCommand {
    #[arg(long, help = "Also read the headers of packs the index does not know about")]
    read_all_packs: bool,
}

impl RebuildIndexCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;

        let stored: HashSet<PackID> = repo
            .list_packs()
            .await?
            .into_iter()
            .filter_map(|info| info.name.parse().ok())
            .collect();
        let missing: HashSet<PackID> = repo
            .index()
            .packs()
            .into_iter()
            .filter(|id| !stored.contains(id))
            .collect();
        for id in &missing {
            warn!(pack = %id.short_string(), "indexed pack is missing from the repository");
        }

        let mut damaged = None;
        if self.read_all_packs {
            match repo.index_missing_packs().await {
                Ok(added) => info!(packs = added, "indexed unreferenced packs"),
                Err(e) if e.is_integrity() => {
                    warn!(error = %e, "some unreferenced packs are damaged; indexing the rest");
                    damaged = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = repo.rebuild_index(&missing).await?;
        println!(
            "Wrote index {} ({} missing packs dropped)",
            id.short_string(),
            missing.len()
        );
        match damaged {
            Some(e) => Err(anyhow::anyhow!("damaged packs were left out of the index: {}", e)),
            None => Ok(()),
        }
    }
}
