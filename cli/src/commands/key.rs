use super::{Settings, open_repository, prompt_new_password};
use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct KeyAddCommand {}

impl KeyAddCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let repo = open_repository(cli, &settings).await?;

        let password = prompt_new_password("Enter the new password: ")?;
        let id = repo.add_key(&password, settings.init.kdf()).await?;
        println!("Added key {}", id.short_string());
        Ok(())
    }
}
