use super::ArchiveStats;
use crate::crypto::EXTENSION;
use crate::repository::Repository;
use crate::types::{BlobType, FileType, Handle, ObjectID, PackID};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Blobs queued for saving during the current run.
#[derive(Debug, Default)]
pub struct KnownBlobs {
    set: Mutex<HashSet<(ObjectID, BlobType)>>,
}

impl KnownBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the blob as known. Returns true for the single caller that saw it first.
    pub fn check_and_insert(&self, id: ObjectID, blob_type: BlobType) -> bool {
        self.set.lock().insert((id, blob_type))
    }

    /// Drops a blob whose save failed so a later caller may try again.
    pub fn forget(&self, id: ObjectID, blob_type: BlobType) {
        self.set.lock().remove(&(id, blob_type));
    }
}

/// Saves blobs at most once per run, skipping those already in the index unless
/// their pack turned out to be missing from the backend.
pub struct BlobSaver {
    repo: Arc<Repository>,
    known: KnownBlobs,
    packs: Mutex<HashMap<PackID, bool>>,
    stats: Arc<ArchiveStats>,
}

impl BlobSaver {
    pub fn new(repo: Arc<Repository>, stats: Arc<ArchiveStats>) -> Self {
        Self {
            repo,
            known: KnownBlobs::new(),
            packs: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub async fn save(&self, blob_type: BlobType, data: Vec<u8>) -> Result<ObjectID> {
        let id = ObjectID::from_data(&data);
        if self.is_indexed(&id, blob_type) || !self.known.check_and_insert(id, blob_type) {
            return Ok(id);
        }

        match self.repo.save_blob(blob_type, &data, Some(id)).await {
            Ok(id) => {
                ArchiveStats::add(&self.stats.blobs_written, 1);
                ArchiveStats::add(&self.stats.bytes_written, (data.len() + EXTENSION) as u64);
                Ok(id)
            }
            Err(e) => {
                self.known.forget(id, blob_type);
                Err(e)
            }
        }
    }

    /// Indexed in at least one pack not known to be missing.
    fn is_indexed(&self, id: &ObjectID, blob_type: BlobType) -> bool {
        let locations = self.repo.index().lookup(id, blob_type);
        let packs = self.packs.lock();
        locations
            .iter()
            .any(|pb| packs.get(&pb.pack_id) != Some(&false))
    }

    /// Checks a pack's presence in the backend once per run.
    pub async fn pack_exists(&self, pack_id: &PackID) -> Result<bool> {
        if let Some(exists) = self.packs.lock().get(pack_id) {
            return Ok(*exists);
        }
        let exists = self
            .repo
            .backend()
            .test(&Handle::for_id(FileType::Data, pack_id))
            .await?;
        if !exists {
            debug!(pack = %pack_id.short_string(), "indexed pack is missing");
        }
        self.packs.lock().insert(*pack_id, exists);
        Ok(exists)
    }

    /// First data blob of `content` without a location in an existing pack.
    pub async fn first_missing_blob(&self, content: &[ObjectID]) -> Result<Option<ObjectID>> {
        for id in content {
            let mut available = false;
            for location in self.repo.index().lookup(id, BlobType::Data) {
                if self.pack_exists(&location.pack_id).await? {
                    available = true;
                    break;
                }
            }
            if !available {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::repository::{InitOptions, RepositoryOptions};
    use crate::types::ChunkerParams;

    async fn test_repo() -> Arc<Repository> {
        let init = InitOptions {
            kdf_memory: 64,
            kdf_iterations: 1,
            kdf_parallelism: 1,
            chunker: ChunkerParams::new(1024),
        };
        let options = RepositoryOptions {
            min_pack_size: 1,
            ..RepositoryOptions::default()
        };
        Arc::new(
            Repository::init(Arc::new(MemoryBackend::new()), "pw", init, options)
                .await
                .unwrap(),
        )
    }

    #[test]
    fn test_known_blobs_first_caller_wins() {
        let known = KnownBlobs::new();
        let id = ObjectID::from_data(b"x");
        assert!(known.check_and_insert(id, BlobType::Data));
        assert!(!known.check_and_insert(id, BlobType::Data));
        assert!(known.check_and_insert(id, BlobType::Tree));

        known.forget(id, BlobType::Data);
        assert!(known.check_and_insert(id, BlobType::Data));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_store_one_location() {
        let repo = test_repo().await;
        let stats = Arc::new(ArchiveStats::default());
        let saver = Arc::new(BlobSaver::new(repo.clone(), stats.clone()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let saver = saver.clone();
            tasks.push(tokio::spawn(async move {
                saver.save(BlobType::Data, b"same content".to_vec()).await
            }));
        }
        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap());
        }
        repo.flush().await.unwrap();

        assert_eq!(ids.len(), 1);
        let id = ids.into_iter().next().unwrap();
        assert_eq!(repo.index().lookup(&id, BlobType::Data).len(), 1);
        assert_eq!(stats.summary().blobs_written, 1);
    }

    #[tokio::test]
    async fn test_missing_pack_allows_resave() {
        let repo = test_repo().await;
        let id = repo.save_blob(BlobType::Data, b"lost", None).await.unwrap();
        let pack = repo.index().lookup(&id, BlobType::Data)[0].pack_id;
        repo.backend()
            .remove(&Handle::for_id(FileType::Data, &pack))
            .await
            .unwrap();

        let saver = BlobSaver::new(repo.clone(), Arc::new(ArchiveStats::default()));
        assert_eq!(saver.first_missing_blob(&[id]).await.unwrap(), Some(id));

        saver.save(BlobType::Data, b"lost".to_vec()).await.unwrap();
        assert_eq!(repo.index().lookup(&id, BlobType::Data).len(), 2);
        assert_eq!(saver.first_missing_blob(&[id]).await.unwrap(), None);
    }
}
