use super::{Settings, format_bytes, open_repository};
use anyhow::Result;
use clap::Args;
use packrat_core::restorer::walk_tree;
use packrat_core::tree::NodeType;
use std::path::PathBuf;

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Snapshot ID, ID prefix or \"latest\"")]
    snapshot_id: String,

    #[arg(help = "Only list entries below this path within the snapshot")]
    path: Option<PathBuf>,

    #[arg(short, long, help = "Show type, mode, size and modification time")]
    long: bool,
}

impl LsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;
        let snapshot = repo.find_snapshot(&self.snapshot_id).await?;

        for (path, node) in walk_tree(&repo, &snapshot.tree).await? {
            if let Some(prefix) = &self.path {
                if !path.starts_with(prefix) {
                    continue;
                }
            }

            if !self.long {
                println!("{}", path.display());
                continue;
            }
            let kind = match node.node_type {
                NodeType::File => '-',
                NodeType::Dir => 'd',
                NodeType::Symlink => 'l',
                NodeType::Dev => 'b',
                NodeType::CharDev => 'c',
                NodeType::Fifo => 'p',
                NodeType::Socket => 's',
            };
            let mut line = format!(
                "{}{:04o} {:>12} {} {}",
                kind,
                node.mode & 0o7777,
                format_bytes(node.size),
                node.mtime.format("%Y-%m-%d %H:%M:%S"),
                path.display()
            );
            if let Some(target) = &node.link_target {
                line.push_str(&format!(" -> {}", target));
            }
            if let Some(error) = &node.error {
                line.push_str(&format!(" (error: {})", error));
            }
            println!("{}", line);
        }
        Ok(())
    }
}
