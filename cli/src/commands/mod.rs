pub mod backup;
pub mod init;
pub mod key;
pub mod ls;
pub mod rebuild_index;
pub mod restore;
pub mod snapshots;

use crate::Cli;
use anyhow::{Context, Result, anyhow};
use packrat_backends::LocalBackend;
use packrat_core::{ArchiverOptions, BlobType, InitOptions, Repository, RepositoryOptions};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Contents of the optional settings file.
///
/// ```toml
/// [repository]
/// min_pack_size = 16777216
///
/// [archiver]
/// file_workers = 4
/// excludes = ["*.tmp", ".cache/"]
///
/// [init]
/// kdf_memory = 65536
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub repository: RepositoryOptions,
    pub archiver: ArchiverOptions,
    pub init: InitOptions,
}

impl Settings {
    /// Reads `--config` if given, otherwise `config.toml` from the user config
    /// directory when it exists.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => match default_settings_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings = toml::from_str(&text)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }
}

fn default_settings_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "packrat").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn repo_path(cli: &Cli) -> Result<&Path> {
    cli.repo
        .as_deref()
        .ok_or_else(|| anyhow!("Repository path required (--repo or PACKRAT_REPO)"))
}

pub fn read_password(cli: &Cli, prompt: &str) -> Result<String> {
    if let Some(password) = &cli.password {
        return Ok(password.clone());
    }
    prompt_password(prompt)
}

pub fn prompt_password(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let password = rpassword::read_password().context("reading password")?;
    if password.is_empty() {
        return Err(anyhow!("Password required"));
    }
    Ok(password)
}

/// Asks for a new password twice.
pub fn prompt_new_password(prompt: &str) -> Result<String> {
    let first = prompt_password(prompt)?;
    let second = prompt_password("Enter the password again: ")?;
    if first != second {
        return Err(anyhow!("Passwords do not match"));
    }
    Ok(first)
}

/// Opens the repository named on the command line and loads its index.
pub async fn open_repository(cli: &Cli, settings: &Settings) -> Result<Arc<Repository>> {
    let path = repo_path(cli)?;
    let password = read_password(cli, "Enter repository password: ")?;

    info!("Opening repository at: {}", path.display());
    let backend = Arc::new(LocalBackend::new(path));
    let repo = Repository::open(backend, &password, settings.repository.clone()).await?;
    let loaded = repo.load_index().await?;
    debug!(index_files = loaded, data_blobs = repo.index().count(BlobType::Data), "loaded index");
    Ok(Arc::new(repo))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
