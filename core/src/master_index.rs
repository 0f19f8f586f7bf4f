use crate::index::Index;
use crate::pack::{Blob, PackedBlob};
use crate::types::{BlobType, IndexID, ObjectID, PackID};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::debug;

struct Generation {
    serial: u64,
    index: Index,
}

#[derive(Default)]
struct Generations {
    list: Vec<Generation>,
    next_serial: u64,
}

impl Generations {
    fn push(&mut self, index: Index) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.list.push(Generation { serial, index });
        serial
    }

    fn open_mut(&mut self) -> &mut Index {
        let has_open = self.list.last().is_some_and(|g| !g.index.is_final());
        if !has_open {
            self.push(Index::new());
        }
        let last = self.list.len() - 1;
        &mut self.list[last].index
    }
}

/// Encoded generation waiting to be written, tagged with its serial for `mark_saved`.
pub struct UnsavedIndex {
    pub serial: u64,
    pub data: Vec<u8>,
}

/// All index generations known to a repository.
#[derive(Default)]
pub struct MasterIndex {
    generations: RwLock<Generations>,
}

impl MasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, packed: PackedBlob) -> Result<()> {
        self.generations.write().open_mut().store(packed)
    }

    pub fn store_pack(&self, pack_id: PackID, blobs: &[Blob]) -> Result<()> {
        self.generations.write().open_mut().store_pack(pack_id, blobs)
    }

    /// Every distinct location of a blob across all generations.
    pub fn lookup(&self, id: &ObjectID, blob_type: BlobType) -> Vec<PackedBlob> {
        let generations = self.generations.read();
        let mut found: Vec<PackedBlob> = Vec::new();
        for generation in &generations.list {
            for pb in generation.index.lookup(id, blob_type) {
                if !found.contains(pb) {
                    found.push(*pb);
                }
            }
        }
        found
    }

    pub fn has(&self, id: &ObjectID, blob_type: BlobType) -> bool {
        self.generations
            .read()
            .list
            .iter()
            .any(|g| g.index.has(id, blob_type))
    }

    pub fn lookup_size(&self, id: &ObjectID, blob_type: BlobType) -> Option<u32> {
        self.generations
            .read()
            .list
            .iter()
            .find_map(|g| g.index.lookup_size(id, blob_type))
    }

    /// Distinct blobs of a type.
    pub fn count(&self, blob_type: BlobType) -> usize {
        let generations = self.generations.read();
        let mut ids = HashSet::new();
        for generation in &generations.list {
            for pb in generation.index.each() {
                if pb.blob.blob_type == blob_type {
                    ids.insert(pb.blob.id);
                }
            }
        }
        ids.len()
    }

    pub fn packs(&self) -> BTreeSet<PackID> {
        let generations = self.generations.read();
        generations
            .list
            .iter()
            .flat_map(|g| g.index.packs())
            .collect()
    }

    pub fn generation_count(&self) -> usize {
        self.generations.read().list.len()
    }

    /// IDs of the stored generations.
    pub fn ids(&self) -> Vec<IndexID> {
        self.generations
            .read()
            .list
            .iter()
            .filter_map(|g| g.index.id())
            .collect()
    }

    /// Adds a generation loaded from the backend.
    pub fn insert(&self, index: Index) -> Result<()> {
        if !index.is_final() {
            return Err(Error::Other("only final indexes can be inserted".to_string()));
        }
        self.generations.write().push(index);
        Ok(())
    }

    /// Finalizes and encodes the generations that still need to be written. With
    /// `full_only`, open generations are only taken once they are full.
    pub fn finalize_unsaved(
        &self,
        full_only: bool,
        max_blobs: usize,
        max_age: Duration,
    ) -> Result<Vec<UnsavedIndex>> {
        let mut generations = self.generations.write();
        let mut unsaved = Vec::new();
        for generation in generations.list.iter_mut() {
            let index = &mut generation.index;
            if index.id().is_some() {
                continue;
            }
            if !index.is_final() {
                if index.is_empty() || (full_only && !index.is_full(max_blobs, max_age)) {
                    continue;
                }
                index.finalize();
            }
            unsaved.push(UnsavedIndex {
                serial: generation.serial,
                data: index.encode()?,
            });
        }
        Ok(unsaved)
    }

    pub fn mark_saved(&self, serial: u64, id: IndexID) -> Result<()> {
        let mut generations = self.generations.write();
        let generation = generations
            .list
            .iter_mut()
            .find(|g| g.serial == serial)
            .ok_or_else(|| Error::Other(format!("no index generation {}", serial)))?;
        generation.index.set_id(id)
    }

    /// Merges every generation into one fresh index, dropping locations in
    /// `blacklist` and keeping a single location per blob. Open generations are
    /// finalized so later stores land in a generation past the returned watermark.
    pub fn rebuild(&self, blacklist: &HashSet<PackID>) -> Result<(Index, u64)> {
        let mut generations = self.generations.write();
        let mut merged = Index::new();

        for generation in generations.list.iter_mut() {
            if !generation.index.is_final() {
                generation.index.finalize();
            }
            if let Some(id) = generation.index.id() {
                merged.add_supersedes(id)?;
            }
            for pb in generation.index.each() {
                if blacklist.contains(&pb.pack_id) || merged.has(&pb.blob.id, pb.blob.blob_type) {
                    continue;
                }
                merged.store(*pb)?;
            }
        }

        debug!(
            generations = generations.list.len(),
            blobs = merged.len(),
            "rebuilt index"
        );
        merged.finalize();
        Ok((merged, generations.next_serial))
    }

    /// Replaces every generation older than `watermark` with `index`.
    pub fn replace(&self, watermark: u64, index: Index) -> Result<()> {
        if !index.is_final() {
            return Err(Error::Other("replacement index must be final".to_string()));
        }
        let mut generations = self.generations.write();
        generations.list.retain(|g| g.serial >= watermark);
        let serial = generations.next_serial;
        generations.next_serial += 1;
        generations.list.insert(0, Generation { serial, index });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(pack: &str, data: &str, offset: u64) -> PackedBlob {
        PackedBlob {
            pack_id: ObjectID::from_data(pack.as_bytes()),
            blob: Blob {
                blob_type: BlobType::Data,
                id: ObjectID::from_data(data.as_bytes()),
                offset,
                length: 64,
            },
        }
    }

    fn final_index(entries: &[PackedBlob], id: Option<&str>) -> Index {
        let mut index = Index::new();
        for e in entries {
            index.store(*e).unwrap();
        }
        index.finalize();
        if let Some(id) = id {
            index.set_id(ObjectID::from_data(id.as_bytes())).unwrap();
        }
        index
    }

    #[test]
    fn test_store_creates_open_generation() {
        let master = MasterIndex::new();
        master
            .insert(final_index(&[packed("p1", "a", 0)], Some("i1")))
            .unwrap();
        master.store(packed("p2", "b", 0)).unwrap();
        master.store(packed("p2", "c", 64)).unwrap();

        assert_eq!(master.generation_count(), 2);
        assert!(master.has(&ObjectID::from_data(b"a"), BlobType::Data));
        assert!(master.has(&ObjectID::from_data(b"c"), BlobType::Data));
        assert_eq!(master.count(BlobType::Data), 3);
        assert_eq!(master.packs().len(), 2);
    }

    #[test]
    fn test_lookup_collects_distinct_locations() {
        let master = MasterIndex::new();
        let first = packed("p1", "a", 0);
        let second = packed("p2", "a", 0);
        master.insert(final_index(&[first], Some("i1"))).unwrap();
        master.insert(final_index(&[first, second], Some("i2"))).unwrap();

        let found = master.lookup(&first.blob.id, BlobType::Data);
        assert_eq!(found, vec![first, second]);
        assert_eq!(master.lookup_size(&first.blob.id, BlobType::Data), Some(36));
    }

    #[test]
    fn test_finalize_unsaved_and_mark_saved() {
        let master = MasterIndex::new();
        master.store(packed("p1", "a", 0)).unwrap();

        assert!(
            master
                .finalize_unsaved(true, 10, Duration::from_secs(3600))
                .unwrap()
                .is_empty()
        );

        let unsaved = master
            .finalize_unsaved(false, 10, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(unsaved.len(), 1);
        let id = ObjectID::from_data(&unsaved[0].data);
        master.mark_saved(unsaved[0].serial, id).unwrap();
        assert_eq!(master.ids(), vec![id]);

        // stores after finalizing open a new generation
        master.store(packed("p2", "b", 0)).unwrap();
        assert_eq!(master.generation_count(), 2);
        assert_eq!(
            master
                .finalize_unsaved(false, 10, Duration::from_secs(3600))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_rebuild_excludes_blacklist_and_collapses() {
        let master = MasterIndex::new();
        let a1 = packed("p1", "a", 0);
        let a2 = packed("p2", "a", 0);
        let b = packed("p3", "b", 0);
        master.insert(final_index(&[a1, b], Some("i1"))).unwrap();
        master.insert(final_index(&[a2], Some("i2"))).unwrap();
        master.store(packed("p4", "c", 0)).unwrap();

        let blacklist: HashSet<PackID> = [b.pack_id].into_iter().collect();
        let (rebuilt, watermark) = master.rebuild(&blacklist).unwrap();

        assert_eq!(rebuilt.lookup(&a1.blob.id, BlobType::Data).len(), 1);
        assert!(!rebuilt.has(&b.blob.id, BlobType::Data));
        assert!(rebuilt.has(&ObjectID::from_data(b"c"), BlobType::Data));
        let supersedes: HashSet<IndexID> = rebuilt.supersedes().iter().copied().collect();
        assert_eq!(
            supersedes,
            [ObjectID::from_data(b"i1"), ObjectID::from_data(b"i2")]
                .into_iter()
                .collect()
        );

        master.store(packed("p5", "d", 0)).unwrap();
        master.replace(watermark, rebuilt).unwrap();

        assert_eq!(master.generation_count(), 2);
        assert!(!master.has(&b.blob.id, BlobType::Data));
        assert!(master.has(&ObjectID::from_data(b"d"), BlobType::Data));
        assert_eq!(master.lookup(&a1.blob.id, BlobType::Data).len(), 1);
    }
}
