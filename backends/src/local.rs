use async_trait::async_trait;
use bytes::Bytes;
use packrat_core::backend::{Backend, FileInfo, check_range};
use packrat_core::{Error, FileType, Handle, Result};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

const FILE_TYPES: [FileType; 5] = [
    FileType::Data,
    FileType::Key,
    FileType::Lock,
    FileType::Snapshot,
    FileType::Index,
];

/// Files are written under this prefix next to their final path, then moved
/// into place. Listings skip them.
const TEMP_PREFIX: &str = ".tmp-";

/// A repository in a local directory. Pack files are spread over 256
/// subdirectories of `data/` by the first byte of their name.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, handle: &Handle) -> PathBuf {
        match handle.file_type {
            FileType::Config => self.base_path.join(Handle::CONFIG_NAME),
            FileType::Data => {
                let prefix = handle.name.get(..2).unwrap_or("00");
                self.base_path
                    .join(FileType::Data.dir_name())
                    .join(prefix)
                    .join(&handle.name)
            }
            other => self.base_path.join(other.dir_name()).join(&handle.name),
        }
    }

    fn not_found(handle: &Handle, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::FileNotFound {
                handle: handle.to_string(),
            }
        } else {
            Error::Io(e)
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        for file_type in FILE_TYPES {
            fs::create_dir_all(self.base_path.join(file_type.dir_name())).await?;
        }
        let data = self.base_path.join(FileType::Data.dir_name());
        for byte in 0..=255u8 {
            fs::create_dir_all(data.join(format!("{:02x}", byte))).await?;
        }
        debug!(path = %self.base_path.display(), "initialized local backend");
        Ok(())
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        let path = self.full_path(handle);
        let parent = path.parent().unwrap_or(&self.base_path).to_path_buf();
        fs::create_dir_all(&parent).await?;
        if fs::try_exists(&path).await? {
            return Err(Error::FileExists {
                handle: handle.to_string(),
            });
        }

        // atomic write: temp file -> fsync -> link into place
        let temp = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)
                .await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            publish(&temp, &path).await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                if e.kind() == ErrorKind::AlreadyExists {
                    return Err(Error::FileExists {
                        handle: handle.to_string(),
                    });
                }
                warn!(handle = %handle, error = %e, "failed to write file");
                Err(e.into())
            }
        }
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        let path = self.full_path(handle);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(handle, e))?;
        let size = file.metadata().await?.len();
        let (start, end) = check_range(handle, size, length, offset)?;

        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let metadata = fs::metadata(self.full_path(handle))
            .await
            .map_err(|e| Self::not_found(handle, e))?;
        Ok(FileInfo {
            name: handle.name.clone(),
            size: metadata.len(),
        })
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(handle)).await?)
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        fs::remove_file(self.full_path(handle))
            .await
            .map_err(|e| Self::not_found(handle, e))
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<String>> {
        if file_type == FileType::Config {
            let exists = self.test(&Handle::config()).await?;
            return Ok(if exists {
                vec![Handle::CONFIG_NAME.to_string()]
            } else {
                Vec::new()
            });
        }

        let dir = self.base_path.join(file_type.dir_name());
        let mut names = Vec::new();
        if file_type == FileType::Data {
            for sub in read_dir_names(&dir, true).await? {
                names.extend(read_dir_names(&dir.join(sub), false).await?);
            }
        } else {
            names = read_dir_names(&dir, false).await?;
        }
        Ok(names)
    }

    fn location(&self) -> String {
        self.base_path.display().to_string()
    }
}

/// Moves a fully written temp file to `path` without replacing an existing file.
/// Falls back to a rename where the file system has no hard links.
async fn publish(temp: &Path, path: &Path) -> std::io::Result<()> {
    match fs::hard_link(temp, path).await {
        Ok(()) => fs::remove_file(temp).await,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!(error = %e, "hard link failed, renaming");
            fs::rename(temp, path).await
        }
    }
}

/// Entry names of `dir` that are directories (or files, when `dirs` is false).
/// A missing directory lists as empty.
async fn read_dir_names(dir: &Path, dirs: bool) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() != dirs {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with(TEMP_PREFIX) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
