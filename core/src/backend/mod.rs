//! Storage abstraction the repository writes packs, indexes, snapshots and keys to.

mod mem;

pub use mem::MemoryBackend;

use crate::Result;
use crate::types::{FileType, Handle};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepares the storage location. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Stores `data` under `handle`. Fails with `Error::FileExists` if the handle is taken.
    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()>;

    /// Reads `length` bytes starting at `offset`; a `length` of 0 reads to the end.
    /// A range past the end of the file is an error, never a short read.
    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes>;

    async fn stat(&self, handle: &Handle) -> Result<FileInfo>;

    async fn test(&self, handle: &Handle) -> Result<bool>;

    async fn remove(&self, handle: &Handle) -> Result<()>;

    /// Names of every file of the given type, in no particular order.
    async fn list(&self, file_type: FileType) -> Result<Vec<String>>;

    fn location(&self) -> String;
}

/// Checks a requested range against the file size the way every backend must.
pub fn check_range(handle: &Handle, size: u64, length: usize, offset: u64) -> Result<(u64, u64)> {
    let end = if length == 0 {
        size
    } else {
        offset.saturating_add(length as u64)
    };
    if offset > size || end > size {
        return Err(crate::Error::Backend(format!(
            "range {}..{} out of bounds for {} ({} bytes)",
            offset, end, handle, size
        )));
    }
    Ok((offset, end))
}
