use crate::types::{BlobType, ObjectID};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Authentication failed: ciphertext did not verify")]
    Authentication,

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: ObjectID, actual: ObjectID },

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Pack file corrupted: {id}: {reason}")]
    CorruptedPack { id: String, reason: String },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("File not found in backend: {handle}")]
    FileNotFound { handle: String },

    #[error("File already exists in backend: {handle}")]
    FileExists { handle: String },

    #[error("Blob not found: {blob_type} {id}")]
    BlobNotFound { id: ObjectID, blob_type: BlobType },

    #[error("Index is final and cannot be modified")]
    IndexFinalized,

    #[error("Index file uses the old format")]
    OldIndexFormat,

    #[error("Chunker error: {0}")]
    Chunker(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Missing data the caller may recover from, e.g. by rechunking instead of reusing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound { .. }
                | Error::BlobNotFound { .. }
                | Error::SnapshotNotFound { .. }
                | Error::RepositoryNotFound { .. }
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::Authentication | Error::IntegrityMismatch { .. } | Error::CorruptedPack { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
