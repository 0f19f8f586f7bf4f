use crate::pack::{Blob, PackedBlob};
use crate::types::{BlobType, IndexID, ObjectID, PackID};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Accepting new entries since `created`.
    Open { created: Instant },
    /// Serialized or loaded; never modified again.
    Final,
}

/// One generation of blob locations.
#[derive(Debug, Clone)]
pub struct Index {
    entries: HashMap<(ObjectID, BlobType), Vec<PackedBlob>>,
    supersedes: Vec<IndexID>,
    state: IndexState,
    id: Option<IndexID>,
}

#[derive(Serialize, Deserialize)]
struct JsonIndex {
    #[serde(default)]
    supersedes: Vec<IndexID>,
    packs: Vec<JsonPack>,
}

#[derive(Serialize, Deserialize)]
struct JsonPack {
    id: PackID,
    blobs: Vec<JsonBlob>,
}

#[derive(Serialize, Deserialize)]
struct JsonBlob {
    id: ObjectID,
    #[serde(rename = "type")]
    blob_type: BlobType,
    offset: u64,
    length: u32,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            supersedes: Vec::new(),
            state: IndexState::Open {
                created: Instant::now(),
            },
            id: None,
        }
    }

    pub fn store(&mut self, packed: PackedBlob) -> Result<()> {
        if self.is_final() {
            return Err(Error::IndexFinalized);
        }
        let locations = self
            .entries
            .entry((packed.blob.id, packed.blob.blob_type))
            .or_default();
        if !locations.contains(&packed) {
            locations.push(packed);
        }
        Ok(())
    }

    /// Stores every blob of one pack.
    pub fn store_pack(&mut self, pack_id: PackID, blobs: &[Blob]) -> Result<()> {
        for blob in blobs {
            self.store(PackedBlob {
                pack_id,
                blob: *blob,
            })?;
        }
        Ok(())
    }

    pub fn lookup(&self, id: &ObjectID, blob_type: BlobType) -> &[PackedBlob] {
        self.entries
            .get(&(*id, blob_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has(&self, id: &ObjectID, blob_type: BlobType) -> bool {
        self.entries.contains_key(&(*id, blob_type))
    }

    /// Plaintext size of a blob.
    pub fn lookup_size(&self, id: &ObjectID, blob_type: BlobType) -> Option<u32> {
        self.lookup(id, blob_type)
            .first()
            .map(|pb| pb.blob.plaintext_length())
    }

    pub fn count(&self, blob_type: BlobType) -> usize {
        self.entries.keys().filter(|(_, t)| *t == blob_type).count()
    }

    /// Number of distinct blobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn packs(&self) -> BTreeSet<PackID> {
        self.each().map(|pb| pb.pack_id).collect()
    }

    pub fn each(&self) -> impl Iterator<Item = &PackedBlob> + '_ {
        self.entries.values().flatten()
    }

    /// An open generation is full once it holds `max_blobs` blobs or has been
    /// accumulating entries for longer than `max_age`.
    pub fn is_full(&self, max_blobs: usize, max_age: Duration) -> bool {
        match self.state {
            IndexState::Final => false,
            IndexState::Open { created } => {
                self.len() >= max_blobs || (!self.is_empty() && created.elapsed() >= max_age)
            }
        }
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn is_final(&self) -> bool {
        matches!(self.state, IndexState::Final)
    }

    pub fn finalize(&mut self) {
        self.state = IndexState::Final;
    }

    pub fn id(&self) -> Option<IndexID> {
        self.id
    }

    pub fn set_id(&mut self, id: IndexID) -> Result<()> {
        if !self.is_final() {
            return Err(Error::Other("index must be final before it gets an id".to_string()));
        }
        if let Some(existing) = self.id {
            return Err(Error::Other(format!("index already has id {}", existing)));
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn supersedes(&self) -> &[IndexID] {
        &self.supersedes
    }

    pub fn add_supersedes(&mut self, id: IndexID) -> Result<()> {
        if self.is_final() {
            return Err(Error::IndexFinalized);
        }
        if !self.supersedes.contains(&id) {
            self.supersedes.push(id);
        }
        Ok(())
    }

    /// Serializes the index, grouping blobs by pack in offset order.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut by_pack: BTreeMap<PackID, Vec<JsonBlob>> = BTreeMap::new();
        for pb in self.each() {
            by_pack.entry(pb.pack_id).or_default().push(JsonBlob {
                id: pb.blob.id,
                blob_type: pb.blob.blob_type,
                offset: pb.blob.offset,
                length: pb.blob.length,
            });
        }

        let packs = by_pack
            .into_iter()
            .map(|(id, mut blobs)| {
                blobs.sort_by_key(|b| b.offset);
                JsonPack { id, blobs }
            })
            .collect();

        let json = JsonIndex {
            supersedes: self.supersedes.clone(),
            packs,
        };
        Ok(serde_json::to_vec(&json)?)
    }

    /// Parses the current format. A bare top-level array is the old format and
    /// yields `Error::OldIndexFormat` so the caller can retry with `decode_legacy`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = data.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'[') {
            return Err(Error::OldIndexFormat);
        }
        let json: JsonIndex = serde_json::from_slice(data)?;
        Self::from_json(json.supersedes, json.packs)
    }

    pub fn decode_legacy(data: &[u8]) -> Result<Self> {
        let packs: Vec<JsonPack> = serde_json::from_slice(data)?;
        Self::from_json(Vec::new(), packs)
    }

    fn from_json(supersedes: Vec<IndexID>, packs: Vec<JsonPack>) -> Result<Self> {
        let mut index = Index::new();
        index.supersedes = supersedes;
        for pack in packs {
            for blob in pack.blobs {
                index.store(PackedBlob {
                    pack_id: pack.id,
                    blob: Blob {
                        blob_type: blob.blob_type,
                        id: blob.id,
                        offset: blob.offset,
                        length: blob.length,
                    },
                })?;
            }
        }
        index.finalize();
        Ok(index)
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}
