use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Width of every content identifier, in bytes.
pub const ID_SIZE: usize = 32;

/// BLAKE3 digest used as the identity of blobs, packs, indexes, snapshots and keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectID([u8; ID_SIZE]);

impl ObjectID {
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Other(format!("invalid id length {}", bytes.len())))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ObjectID {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for ObjectID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut array = [0u8; ID_SIZE];
        hex::decode_to_slice(s, &mut array)?;
        Ok(Self(array))
    }
}

impl Serialize for ObjectID {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectID {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectID({})", self.short_string())
    }
}

pub type PackID = ObjectID;
pub type SnapshotID = ObjectID;
pub type IndexID = ObjectID;

/// Kind of a blob stored inside a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    pub fn to_u8(self) -> u8 {
        match self {
            BlobType::Data => 0,
            BlobType::Tree => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlobType::Data),
            1 => Some(BlobType::Tree),
            _ => None,
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Data => f.write_str("data"),
            BlobType::Tree => f.write_str("tree"),
        }
    }
}

/// Kind of a file stored in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Data,
    Key,
    Lock,
    Snapshot,
    Index,
    Config,
}

impl FileType {
    /// Directory (or key prefix) the backend keeps this kind of file under.
    pub fn dir_name(self) -> &'static str {
        match self {
            FileType::Data => "data",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Config => "config",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Names one file in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub const CONFIG_NAME: &'static str = "config";

    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    pub fn for_id(file_type: FileType, id: &ObjectID) -> Self {
        Self::new(file_type, id.to_hex())
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, Self::CONFIG_NAME)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_type, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker: ChunkerParams,
}

impl RepoConfig {
    pub const VERSION: u32 = 1;

    pub fn new(chunker: ChunkerParams) -> Self {
        Self {
            version: Self::VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            chunker,
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::new(ChunkerParams::default())
    }
}

/// Content-defined chunking bounds. Fixed per repository so boundaries stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkerParams {
    pub fn new(avg_size: u32) -> Self {
        Self {
            min_size: avg_size / 2,
            avg_size,
            max_size: avg_size * 8,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size < 64 || self.avg_size < 256 || self.max_size < 1024 {
            return Err(Error::Chunker(format!(
                "chunk sizes too small: min {} avg {} max {}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            return Err(Error::Chunker(format!(
                "chunk sizes out of order: min {} avg {} max {}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Argon2id parameters with a fresh random salt.
    pub fn new(memory: u32, iterations: u32, parallelism: u32) -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations,
            memory,
            parallelism,
            salt,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(65536, 1, 4)
    }
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
