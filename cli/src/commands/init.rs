use super::{Settings, prompt_new_password, repo_path};
use anyhow::Result;
use clap::Args;
use packrat_backends::LocalBackend;
use packrat_core::{ChunkerParams, Repository};
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Average chunk size in bytes (fixed for the life of the repository)")]
    chunk_size: Option<u32>,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let path = repo_path(cli)?;
        let password = match &cli.password {
            Some(password) => password.clone(),
            None => prompt_new_password("Enter password for the new repository: ")?,
        };

        let mut init = settings.init;
        if let Some(avg) = self.chunk_size {
            init.chunker = ChunkerParams::new(avg);
        }

        info!("Initializing repository at: {}", path.display());
        let backend = Arc::new(LocalBackend::new(path));
        let repo = Repository::init(backend, &password, init, settings.repository).await?;

        println!(
            "Created repository {} at {}",
            repo.config().id,
            path.display()
        );
        Ok(())
    }
}
