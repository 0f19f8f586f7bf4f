use super::{Backend, FileInfo, check_range};
use crate::types::{FileType, Handle};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps every file in memory. Used by tests and throwaway repositories.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<Handle, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a file in place, bypassing the create-only rule of `save`.
    pub fn replace(&self, handle: &Handle, data: Bytes) {
        self.files.write().insert(handle.clone(), data);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        let mut files = self.files.write();
        if files.contains_key(handle) {
            return Err(Error::FileExists {
                handle: handle.to_string(),
            });
        }
        files.insert(handle.clone(), data);
        Ok(())
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        let files = self.files.read();
        let data = files.get(handle).ok_or_else(|| Error::FileNotFound {
            handle: handle.to_string(),
        })?;
        let (start, end) = check_range(handle, data.len() as u64, length, offset)?;
        Ok(data.slice(start as usize..end as usize))
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let files = self.files.read();
        let data = files.get(handle).ok_or_else(|| Error::FileNotFound {
            handle: handle.to_string(),
        })?;
        Ok(FileInfo {
            name: handle.name.clone(),
            size: data.len() as u64,
        })
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        Ok(self.files.read().contains_key(handle))
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        self.files
            .write()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| Error::FileNotFound {
                handle: handle.to_string(),
            })
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|h| h.file_type == file_type)
            .map(|h| h.name.clone())
            .collect())
    }

    fn location(&self) -> String {
        "memory:".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_is_create_only() {
        let backend = MemoryBackend::new();
        let handle = Handle::new(FileType::Snapshot, "abc");

        backend.save(&handle, Bytes::from_static(b"one")).await.unwrap();
        let err = backend
            .save(&handle, Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileExists { .. }));
    }

    #[tokio::test]
    async fn test_ranged_load() {
        let backend = MemoryBackend::new();
        let handle = Handle::new(FileType::Data, "pack");
        backend
            .save(&handle, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert_eq!(&backend.load(&handle, 0, 0).await.unwrap()[..], b"0123456789");
        assert_eq!(&backend.load(&handle, 3, 2).await.unwrap()[..], b"234");
        assert_eq!(&backend.load(&handle, 0, 7).await.unwrap()[..], b"789");
        assert!(backend.load(&handle, 5, 8).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let backend = MemoryBackend::new();
        let handle = Handle::new(FileType::Index, "missing");

        assert!(!backend.test(&handle).await.unwrap());
        assert!(backend.load(&handle, 0, 0).await.unwrap_err().is_not_found());
        assert!(backend.remove(&handle).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let backend = MemoryBackend::new();
        backend
            .save(&Handle::new(FileType::Index, "a"), Bytes::new())
            .await
            .unwrap();
        backend
            .save(&Handle::new(FileType::Snapshot, "b"), Bytes::new())
            .await
            .unwrap();

        assert_eq!(backend.list(FileType::Index).await.unwrap(), vec!["a"]);
    }
}
