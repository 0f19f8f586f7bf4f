use crate::backend::{Backend, FileInfo};
use crate::chunker::Chunker;
use crate::crypto::{Encryptor, KeyFile, MasterKey};
use crate::index::Index;
use crate::master_index::MasterIndex;
use crate::pack::{self, Packer};
use crate::packer_manager::PackerManager;
use crate::snapshot::Snapshot;
use crate::tree::Tree;
use crate::types::{
    BlobType, ChunkerParams, FileType, Handle, IndexID, KdfParams, ObjectID, PackID, RepoConfig,
    SnapshotID,
};
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning knobs for an opened repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryOptions {
    /// Packers smaller than this go back to the pool instead of being uploaded.
    pub min_pack_size: usize,
    pub max_packers: usize,
    /// An open index generation is saved by checkpoints once it holds this many blobs.
    pub index_full_blobs: usize,
    /// ...or once it has been collecting entries for this many seconds.
    pub index_full_age_secs: u64,
    pub index_load_workers: usize,
}

impl RepositoryOptions {
    pub fn index_full_age(&self) -> Duration {
        Duration::from_secs(self.index_full_age_secs)
    }
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            min_pack_size: 4 * 1024 * 1024,
            max_packers: 16,
            index_full_blobs: 50_000,
            index_full_age_secs: 600,
            index_load_workers: 20,
        }
    }
}

/// Parameters fixed when a repository is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    pub kdf_memory: u32,
    pub kdf_iterations: u32,
    pub kdf_parallelism: u32,
    pub chunker: ChunkerParams,
}

impl InitOptions {
    pub fn kdf(&self) -> KdfParams {
        KdfParams::new(self.kdf_memory, self.kdf_iterations, self.kdf_parallelism)
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            kdf_memory: kdf.memory,
            kdf_iterations: kdf.iterations,
            kdf_parallelism: kdf.parallelism,
            chunker: ChunkerParams::default(),
        }
    }
}

/// An unlocked repository.
///
/// All data is stored through a [`Backend`] under these file types:
///
/// ```text
/// config          # encrypted RepoConfig
/// keys/           # password-protected copies of the master key (plain JSON)
/// data/           # pack files, named by the hash of their contents
/// index/          # encrypted index generations
/// snapshots/      # encrypted snapshot records
/// ```
///
/// Blobs are buffered in packers and uploaded in packs; their locations become
/// visible to [`Repository::load_blob`] once the pack is written, and durable once
/// the index is saved.
///
/// # Examples
///
/// ```no_run
/// use packrat_core::backend::MemoryBackend;
/// use packrat_core::repository::{InitOptions, RepositoryOptions};
/// use packrat_core::Repository;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> packrat_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     let repo = Repository::init(
///         backend.clone(),
///         "my-password",
///         InitOptions::default(),
///         RepositoryOptions::default(),
///     )
///     .await?;
///     drop(repo);
///
///     let repo = Repository::open(backend, "my-password", RepositoryOptions::default()).await?;
///     repo.load_index().await?;
///     Ok(())
/// }
/// ```
pub struct Repository {
    backend: Arc<dyn Backend>,
    key: MasterKey,
    encryptor: Encryptor,
    config: RepoConfig,
    options: RepositoryOptions,
    index: MasterIndex,
    packers: PackerManager,
}

impl Repository {
    /// Creates a new repository in `backend`.
    ///
    /// Generates a random master key, stores it under `password` in a key file and
    /// writes the encrypted configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::RepositoryExists` if the backend already holds a config file.
    /// Returns `Error::Chunker` if the chunker parameters are unusable.
    pub async fn init(
        backend: Arc<dyn Backend>,
        password: &str,
        init: InitOptions,
        options: RepositoryOptions,
    ) -> Result<Self> {
        backend.init().await?;

        if backend.test(&Handle::config()).await? {
            return Err(Error::RepositoryExists {
                path: backend.location(),
            });
        }
        init.chunker.validate()?;

        let key = MasterKey::generate();
        let key_file = KeyFile::seal(&key, password, init.kdf())?;
        let key_json = serde_json::to_vec_pretty(&key_file)?;
        let key_id = ObjectID::from_data(&key_json);
        backend
            .save(&Handle::for_id(FileType::Key, &key_id), Bytes::from(key_json))
            .await?;

        let config = RepoConfig::new(init.chunker);
        let repo = Self::assemble(backend, key, config, options);
        let config_json = serde_json::to_vec(&repo.config)?;
        let sealed = repo.encryptor.encrypt(&config_json)?;
        repo.backend
            .save(&Handle::config(), Bytes::from(sealed))
            .await?;

        info!(location = %repo.backend.location(), id = %repo.config.id, "initialized repository");
        Ok(repo)
    }

    /// Opens an existing repository, trying `password` against every key file.
    ///
    /// The index is not loaded; call [`Repository::load_index`] before relying on lookups.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - no config file in the backend
    /// * `Error::InvalidPassword` - no key file opens with `password`
    /// * `Error::InvalidFormatVersion` - unsupported repository version
    pub async fn open(
        backend: Arc<dyn Backend>,
        password: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        if !backend.test(&Handle::config()).await? {
            return Err(Error::RepositoryNotFound {
                path: backend.location(),
            });
        }

        let key = Self::unlock(backend.as_ref(), password).await?;

        let sealed = backend.load(&Handle::config(), 0, 0).await?;
        let config_json = key.encryptor().decrypt(&sealed)?;
        let config: RepoConfig = serde_json::from_slice(&config_json)?;
        if config.version != RepoConfig::VERSION {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }

        debug!(location = %backend.location(), id = %config.id, "opened repository");
        Ok(Self::assemble(backend, key, config, options))
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        key: MasterKey,
        config: RepoConfig,
        options: RepositoryOptions,
    ) -> Self {
        let packers = PackerManager::new(options.min_pack_size, options.max_packers);
        Self {
            backend,
            encryptor: key.encryptor(),
            key,
            config,
            options,
            index: MasterIndex::new(),
            packers,
        }
    }

    async fn unlock(backend: &dyn Backend, password: &str) -> Result<MasterKey> {
        for name in backend.list(FileType::Key).await? {
            let handle = Handle::new(FileType::Key, name);
            let data = backend.load(&handle, 0, 0).await?;
            let key_file: KeyFile = match serde_json::from_slice(&data) {
                Ok(key_file) => key_file,
                Err(e) => {
                    warn!(key = %handle, error = %e, "skipping unreadable key file");
                    continue;
                }
            };
            match key_file.open(password) {
                Ok(key) => {
                    debug!(key = %handle, "unlocked key file");
                    return Ok(key);
                }
                Err(Error::InvalidPassword) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::InvalidPassword)
    }

    /// Adds a key file so `password` also unlocks this repository.
    pub async fn add_key(&self, password: &str, kdf: KdfParams) -> Result<ObjectID> {
        let key_file = KeyFile::seal(&self.key, password, kdf)?;
        let key_json = serde_json::to_vec_pretty(&key_file)?;
        let key_id = ObjectID::from_data(&key_json);
        self.backend
            .save(&Handle::for_id(FileType::Key, &key_id), Bytes::from(key_json))
            .await?;
        info!(key = %key_id.short_string(), "added key");
        Ok(key_id)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn index(&self) -> &MasterIndex {
        &self.index
    }

    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::from_params(&self.config.chunker)
    }

    /// Encrypts `data` into a pack and returns its ID. The blob is not deduplicated
    /// here; callers check the index first.
    pub async fn save_blob(
        &self,
        blob_type: BlobType,
        data: &[u8],
        id: Option<ObjectID>,
    ) -> Result<ObjectID> {
        let id = id.unwrap_or_else(|| ObjectID::from_data(data));

        let mut packer = self.packers.take_packer();
        let added = packer.add_sealed(&self.encryptor, blob_type, id, data);
        if let Some(full) = self.packers.return_packer(packer) {
            self.write_pack(full).await?;
        }
        added?;
        Ok(id)
    }

    async fn write_pack(&self, packer: Packer) -> Result<()> {
        let pack = packer.finalize(&self.encryptor)?;
        let handle = Handle::for_id(FileType::Data, &pack.id);
        let size = pack.data.len();
        self.backend.save(&handle, pack.data).await?;
        self.index.store_pack(pack.id, &pack.blobs)?;
        debug!(pack = %pack.id.short_string(), blobs = pack.blobs.len(), size, "wrote pack");
        Ok(())
    }

    /// Uploads every open packer.
    pub async fn flush(&self) -> Result<()> {
        for packer in self.packers.drain() {
            self.write_pack(packer).await?;
        }
        Ok(())
    }

    /// Loads and verifies a blob. Each known location is tried in turn when the
    /// backend fails; a location that returns bad data fails the call at once.
    pub async fn load_blob(&self, blob_type: BlobType, id: &ObjectID) -> Result<Vec<u8>> {
        let locations = self.index.lookup(id, blob_type);
        let mut last_error = None;

        for location in locations {
            let handle = Handle::for_id(FileType::Data, &location.pack_id);
            let sealed = match self
                .backend
                .load(&handle, location.blob.length as usize, location.blob.offset)
                .await
            {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(blob = %id.short_string(), pack = %location.pack_id.short_string(), error = %e, "failed to load blob, trying next location");
                    last_error = Some(e);
                    continue;
                }
            };

            let plain = self.encryptor.decrypt(&sealed)?;
            let actual = ObjectID::from_data(&plain);
            if actual != *id {
                return Err(Error::IntegrityMismatch {
                    expected: *id,
                    actual,
                });
            }
            return Ok(plain);
        }

        Err(last_error.unwrap_or(Error::BlobNotFound {
            id: *id,
            blob_type,
        }))
    }

    /// Stores an encrypted file named by the hash of its stored bytes.
    pub async fn save_unpacked(&self, file_type: FileType, data: &[u8]) -> Result<ObjectID> {
        let sealed = self.encryptor.encrypt(data)?;
        let id = ObjectID::from_data(&sealed);
        self.backend
            .save(&Handle::for_id(file_type, &id), Bytes::from(sealed))
            .await?;
        Ok(id)
    }

    pub async fn load_unpacked(&self, file_type: FileType, id: &ObjectID) -> Result<Vec<u8>> {
        let sealed = self
            .backend
            .load(&Handle::for_id(file_type, id), 0, 0)
            .await?;
        let actual = ObjectID::from_data(&sealed);
        if actual != *id {
            return Err(Error::IntegrityMismatch {
                expected: *id,
                actual,
            });
        }
        self.encryptor.decrypt(&sealed)
    }

    pub async fn save_json_unpacked<T: Serialize>(
        &self,
        file_type: FileType,
        value: &T,
    ) -> Result<ObjectID> {
        let json = serde_json::to_vec(value)?;
        self.save_unpacked(file_type, &json).await
    }

    pub async fn load_json_unpacked<T: DeserializeOwned>(
        &self,
        file_type: FileType,
        id: &ObjectID,
    ) -> Result<T> {
        let json = self.load_unpacked(file_type, id).await?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Saves a tree blob unless the index already knows it.
    pub async fn save_tree(&self, tree: &Tree) -> Result<ObjectID> {
        let json = tree.to_json()?;
        let id = ObjectID::from_data(&json);
        if self.index.has(&id, BlobType::Tree) {
            return Ok(id);
        }
        self.save_blob(BlobType::Tree, &json, Some(id)).await
    }

    pub async fn load_tree(&self, id: &ObjectID) -> Result<Tree> {
        let json = self.load_blob(BlobType::Tree, id).await?;
        Tree::from_json(&json)
    }

    pub async fn save_snapshot(&self, snapshot: &mut Snapshot) -> Result<SnapshotID> {
        let id = self
            .save_json_unpacked(FileType::Snapshot, &*snapshot)
            .await?;
        snapshot.id = Some(id);
        info!(snapshot = %id.short_string(), tree = %snapshot.tree.short_string(), "saved snapshot");
        Ok(id)
    }

    pub async fn load_snapshot(&self, id: &SnapshotID) -> Result<Snapshot> {
        let mut snapshot: Snapshot = self
            .load_json_unpacked(FileType::Snapshot, id)
            .await
            .map_err(|e| match e {
                Error::FileNotFound { .. } => Error::SnapshotNotFound { id: id.to_hex() },
                other => other,
            })?;
        snapshot.id = Some(*id);
        Ok(snapshot)
    }

    /// Every snapshot in the repository, oldest first.
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for name in self.backend.list(FileType::Snapshot).await? {
            let id: SnapshotID = match name.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!(name = %name, "ignoring snapshot file with invalid name");
                    continue;
                }
            };
            snapshots.push(self.load_snapshot(&id).await?);
        }
        snapshots.sort_by(|a, b| a.time.cmp(&b.time));
        Ok(snapshots)
    }

    /// Newest snapshot of exactly `paths` taken on `hostname`, used as the parent
    /// of the next run.
    pub async fn find_latest_snapshot(
        &self,
        paths: &[PathBuf],
        hostname: &str,
    ) -> Result<Option<Snapshot>> {
        let snapshots = self.list_snapshots().await?;
        Ok(snapshots
            .into_iter()
            .rev()
            .find(|s| s.hostname == hostname && s.has_paths(paths)))
    }

    /// Resolves `latest` or a unique prefix of a snapshot ID.
    pub async fn find_snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let snapshots = self.list_snapshots().await?;
        if prefix == "latest" {
            return snapshots
                .into_iter()
                .next_back()
                .ok_or_else(|| Error::SnapshotNotFound {
                    id: prefix.to_string(),
                });
        }

        let mut matches = snapshots
            .into_iter()
            .filter(|s| s.id.is_some_and(|id| id.to_hex().starts_with(prefix)));
        match (matches.next(), matches.next()) {
            (Some(snapshot), None) => Ok(snapshot),
            (Some(_), Some(_)) => Err(Error::Other(format!(
                "snapshot prefix {} is ambiguous",
                prefix
            ))),
            _ => Err(Error::SnapshotNotFound {
                id: prefix.to_string(),
            }),
        }
    }

    /// Loads every index file not yet known, `index_load_workers` at a time. Files
    /// that load are merged even when others fail; the first failure is returned
    /// once all have been tried.
    pub async fn load_index(&self) -> Result<usize> {
        let known: HashSet<IndexID> = self.index.ids().into_iter().collect();
        let names: Vec<String> = self
            .backend
            .list(FileType::Index)
            .await?
            .into_iter()
            .filter(|name| {
                name.parse::<IndexID>()
                    .map(|id| !known.contains(&id))
                    .unwrap_or(true)
            })
            .collect();

        let workers = self.options.index_load_workers.max(1);
        let results: Vec<(String, Result<Index>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.load_index_file(&name).await;
                (name, result)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut loaded = 0;
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(index) => {
                    self.index.insert(index)?;
                    loaded += 1;
                }
                Err(e) => {
                    warn!(index = %name, error = %e, "failed to load index file");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(loaded, "loaded index files");
        match first_error {
            Some(e) => Err(e),
            None => Ok(loaded),
        }
    }

    async fn load_index_file(&self, name: &str) -> Result<Index> {
        let id: IndexID = name
            .parse()
            .map_err(|_| Error::Other(format!("invalid index file name {}", name)))?;
        let data = self.load_unpacked(FileType::Index, &id).await?;
        let mut index = match Index::decode(&data) {
            Err(Error::OldIndexFormat) => {
                debug!(index = %id.short_string(), "index uses the old format");
                Index::decode_legacy(&data)?
            }
            other => other?,
        };
        index.set_id(id)?;
        Ok(index)
    }

    /// Saves every index generation that is not stored yet.
    pub async fn save_index(&self) -> Result<Vec<IndexID>> {
        self.save_generations(false).await
    }

    /// Saves only full generations; used for periodic checkpoints.
    pub async fn save_full_index(&self) -> Result<Vec<IndexID>> {
        self.save_generations(true).await
    }

    async fn save_generations(&self, full_only: bool) -> Result<Vec<IndexID>> {
        let unsaved = self.index.finalize_unsaved(
            full_only,
            self.options.index_full_blobs,
            self.options.index_full_age(),
        )?;

        let mut ids = Vec::with_capacity(unsaved.len());
        for generation in unsaved {
            let id = self.save_unpacked(FileType::Index, &generation.data).await?;
            self.index.mark_saved(generation.serial, id)?;
            debug!(index = %id.short_string(), full_only, "saved index");
            ids.push(id);
        }
        Ok(ids)
    }

    /// Writes one index covering every generation except locations in `blacklist`,
    /// then removes the index files it supersedes.
    pub async fn rebuild_index(&self, blacklist: &HashSet<PackID>) -> Result<IndexID> {
        let (mut rebuilt, watermark) = self.index.rebuild(blacklist)?;
        let superseded = rebuilt.supersedes().to_vec();

        let id = self
            .save_unpacked(FileType::Index, &rebuilt.encode()?)
            .await?;
        rebuilt.set_id(id)?;
        self.index.replace(watermark, rebuilt)?;

        for old in &superseded {
            if let Err(e) = self
                .backend
                .remove(&Handle::for_id(FileType::Index, old))
                .await
            {
                warn!(index = %old.short_string(), error = %e, "failed to remove superseded index");
            }
        }

        info!(index = %id.short_string(), superseded = superseded.len(), "rebuilt index");
        Ok(id)
    }

    /// Every pack file in the backend with its size.
    pub async fn list_packs(&self) -> Result<Vec<FileInfo>> {
        let mut packs = Vec::new();
        for name in self.backend.list(FileType::Data).await? {
            packs.push(self.backend.stat(&Handle::new(FileType::Data, name)).await?);
        }
        Ok(packs)
    }

    /// Reads the headers of packs the index does not reference and indexes their
    /// blobs. Returns how many packs were added. Damaged packs are skipped; the
    /// first such error is returned once every readable pack is indexed.
    pub async fn index_missing_packs(&self) -> Result<usize> {
        let known = self.index.packs();
        let mut added = 0;
        let mut first_error = None;

        for info in self.list_packs().await? {
            let pack_id: PackID = match info.name.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!(name = %info.name, "ignoring pack file with invalid name");
                    continue;
                }
            };
            if known.contains(&pack_id) {
                continue;
            }

            let handle = Handle::for_id(FileType::Data, &pack_id);
            let blobs =
                match pack::load_header(self.backend.as_ref(), &self.encryptor, &handle, info.size)
                    .await
                {
                    Ok(blobs) => blobs,
                    Err(e) if e.is_integrity() => {
                        warn!(pack = %pack_id.short_string(), error = %e, "skipping damaged pack");
                        first_error.get_or_insert(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            self.index.store_pack(pack_id, &blobs)?;
            debug!(pack = %pack_id.short_string(), blobs = blobs.len(), "indexed pack");
            added += 1;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(added),
        }
    }
}
