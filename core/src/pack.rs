//! Pack files: many encrypted blobs followed by an encrypted header describing them.
//!
//! Layout: `[blob ciphertexts][encrypted header][u32 LE length of encrypted header]`.
//! Each header record is `type:u8, length:u32 LE, id:32`; offsets are implied by order.

use crate::backend::Backend;
use crate::crypto::{EXTENSION, Encryptor};
use crate::types::{BlobType, Handle, ID_SIZE, ObjectID, PackID};
use crate::{Error, Result};
use bytes::Bytes;
use tracing::debug;

pub const HEADER_ENTRY_SIZE: usize = 1 + 4 + ID_SIZE;
pub const HEADER_LENGTH_SIZE: usize = 4;
/// Bytes read from the tail of a pack in the hope of catching the whole header at once.
pub const EAGER_READ_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blob {
    pub blob_type: BlobType,
    pub id: ObjectID,
    pub offset: u64,
    pub length: u32,
}

impl Blob {
    /// Length of the blob once decrypted.
    pub fn plaintext_length(&self) -> u32 {
        self.length.saturating_sub(EXTENSION as u32)
    }
}

/// One location of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedBlob {
    pub pack_id: PackID,
    pub blob: Blob,
}

#[derive(Debug, Default)]
pub struct Packer {
    data: Vec<u8>,
    blobs: Vec<Blob>,
}

#[derive(Debug, Clone)]
pub struct FinishedPack {
    pub id: PackID,
    pub data: Bytes,
    pub blobs: Vec<Blob>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypts `plaintext` straight into the pack buffer.
    pub fn add_sealed(
        &mut self,
        encryptor: &Encryptor,
        blob_type: BlobType,
        id: ObjectID,
        plaintext: &[u8],
    ) -> Result<u32> {
        let offset = self.data.len();
        encryptor.encrypt_into(&mut self.data, plaintext)?;
        let written = self.data.len() - offset;
        let length = match u32::try_from(written) {
            Ok(length) => length,
            Err(_) => {
                self.data.truncate(offset);
                return Err(Error::Other(format!("blob {} too large for a pack", id)));
            }
        };
        self.blobs.push(Blob {
            blob_type,
            id,
            offset: offset as u64,
            length,
        });
        Ok(length)
    }

    /// Bytes of blob data buffered so far.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn finalize(mut self, encryptor: &Encryptor) -> Result<FinishedPack> {
        let header = encode_header(&self.blobs);
        let before = self.data.len();
        encryptor.encrypt_into(&mut self.data, &header)?;
        let encrypted_len = (self.data.len() - before) as u32;
        self.data.extend_from_slice(&encrypted_len.to_le_bytes());

        let id = ObjectID::from_data(&self.data);
        debug!(pack = %id.short_string(), blobs = self.blobs.len(), size = self.data.len(), "finalized pack");

        Ok(FinishedPack {
            id,
            data: Bytes::from(self.data),
            blobs: self.blobs,
        })
    }
}

fn encode_header(blobs: &[Blob]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blobs.len() * HEADER_ENTRY_SIZE);
    for blob in blobs {
        out.push(blob.blob_type.to_u8());
        out.extend_from_slice(&blob.length.to_le_bytes());
        out.extend_from_slice(blob.id.as_bytes());
    }
    out
}

fn corrupted(handle: &Handle, reason: impl Into<String>) -> Error {
    Error::CorruptedPack {
        id: handle.name.clone(),
        reason: reason.into(),
    }
}

/// Turns a decrypted header back into blobs, checking that they account for the whole pack.
fn parse_header(handle: &Handle, header: &[u8], pack_size: u64, encrypted_len: u64) -> Result<Vec<Blob>> {
    if header.len() % HEADER_ENTRY_SIZE != 0 {
        return Err(corrupted(
            handle,
            format!("header length {} is not a multiple of {}", header.len(), HEADER_ENTRY_SIZE),
        ));
    }

    let mut blobs = Vec::with_capacity(header.len() / HEADER_ENTRY_SIZE);
    let mut offset = 0u64;
    for record in header.chunks_exact(HEADER_ENTRY_SIZE) {
        let blob_type = BlobType::from_u8(record[0])
            .ok_or_else(|| corrupted(handle, format!("invalid blob type {}", record[0])))?;
        let length = u32::from_le_bytes([record[1], record[2], record[3], record[4]]);
        let id = ObjectID::from_slice(&record[5..])?;
        blobs.push(Blob {
            blob_type,
            id,
            offset,
            length,
        });
        offset += u64::from(length);
    }

    let expected = offset + encrypted_len + HEADER_LENGTH_SIZE as u64;
    if expected != pack_size {
        return Err(corrupted(
            handle,
            format!("blobs and header account for {} bytes, pack has {}", expected, pack_size),
        ));
    }
    Ok(blobs)
}

/// Reads and decrypts the header of a stored pack of `size` bytes.
pub async fn load_header(
    backend: &dyn Backend,
    encryptor: &Encryptor,
    handle: &Handle,
    size: u64,
) -> Result<Vec<Blob>> {
    load_header_with(backend, encryptor, handle, size, EAGER_READ_SIZE).await
}

pub(crate) async fn load_header_with(
    backend: &dyn Backend,
    encryptor: &Encryptor,
    handle: &Handle,
    size: u64,
    eager: usize,
) -> Result<Vec<Blob>> {
    let minimum = (HEADER_LENGTH_SIZE + EXTENSION) as u64;
    if size < minimum {
        return Err(corrupted(handle, format!("pack of {} bytes is too small", size)));
    }

    let read_len = (eager as u64).clamp(HEADER_LENGTH_SIZE as u64, size);
    let tail = backend.load(handle, read_len as usize, size - read_len).await?;
    if tail.len() as u64 != read_len {
        return Err(corrupted(handle, "short read of pack tail"));
    }

    let len_start = tail.len() - HEADER_LENGTH_SIZE;
    let encrypted_len = u64::from(u32::from_le_bytes([
        tail[len_start],
        tail[len_start + 1],
        tail[len_start + 2],
        tail[len_start + 3],
    ]));
    if encrypted_len < EXTENSION as u64 || encrypted_len + HEADER_LENGTH_SIZE as u64 > size {
        return Err(corrupted(
            handle,
            format!("header length {} invalid for pack of {} bytes", encrypted_len, size),
        ));
    }

    let header_start = size - HEADER_LENGTH_SIZE as u64 - encrypted_len;
    let encrypted = if encrypted_len + HEADER_LENGTH_SIZE as u64 <= tail.len() as u64 {
        tail.slice(len_start - encrypted_len as usize..len_start)
    } else {
        backend
            .load(handle, encrypted_len as usize, header_start)
            .await?
    };

    let header = encryptor.decrypt(&encrypted)?;
    parse_header(handle, &header, size, encrypted_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileInfo, MemoryBackend};
    use crate::crypto::MasterKey;
    use crate::types::FileType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        inner: MemoryBackend,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
            self.inner.save(handle, data).await
        }
        async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(handle, length, offset).await
        }
        async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
            self.inner.stat(handle).await
        }
        async fn test(&self, handle: &Handle) -> Result<bool> {
            self.inner.test(handle).await
        }
        async fn remove(&self, handle: &Handle) -> Result<()> {
            self.inner.remove(handle).await
        }
        async fn list(&self, file_type: FileType) -> Result<Vec<String>> {
            self.inner.list(file_type).await
        }
        fn location(&self) -> String {
            "counting:".to_string()
        }
    }

    fn build_pack(encryptor: &Encryptor, count: usize) -> FinishedPack {
        let mut packer = Packer::new();
        for i in 0..count {
            let data = format!("blob number {}", i).into_bytes();
            let blob_type = if i % 2 == 0 { BlobType::Data } else { BlobType::Tree };
            packer
                .add_sealed(encryptor, blob_type, ObjectID::from_data(&data), &data)
                .unwrap();
        }
        packer.finalize(encryptor).unwrap()
    }

    async fn store(backend: &dyn Backend, pack: &FinishedPack) -> Handle {
        let handle = Handle::for_id(FileType::Data, &pack.id);
        backend.save(&handle, pack.data.clone()).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_header_roundtrip() {
        let encryptor = MasterKey::generate().encryptor();
        let backend = MemoryBackend::new();

        for count in [0usize, 1, 1500] {
            let pack = build_pack(&encryptor, count);
            assert_eq!(pack.id, ObjectID::from_data(&pack.data));

            let handle = store(&backend, &pack).await;
            let blobs = load_header(&backend, &encryptor, &handle, pack.data.len() as u64)
                .await
                .unwrap();
            assert_eq!(blobs, pack.blobs);
        }
    }

    #[tokio::test]
    async fn test_blob_offsets_decrypt() {
        let encryptor = MasterKey::generate().encryptor();
        let pack = build_pack(&encryptor, 3);

        for (i, blob) in pack.blobs.iter().enumerate() {
            let start = blob.offset as usize;
            let end = start + blob.length as usize;
            let plain = encryptor.decrypt(&pack.data[start..end]).unwrap();
            assert_eq!(plain, format!("blob number {}", i).into_bytes());
            assert_eq!(blob.plaintext_length() as usize, plain.len());
        }
    }

    #[tokio::test]
    async fn test_eager_read_boundary() {
        let encryptor = MasterKey::generate().encryptor();
        let backend = CountingBackend {
            inner: MemoryBackend::new(),
            loads: AtomicUsize::new(0),
        };
        let pack = build_pack(&encryptor, 40);
        let handle = store(&backend, &pack).await;
        let size = pack.data.len() as u64;
        let header_total = 40 * HEADER_ENTRY_SIZE + EXTENSION + HEADER_LENGTH_SIZE;

        for (window, expected_loads) in [
            (header_total, 1),
            (header_total + 1, 1),
            (header_total - 1, 2),
        ] {
            backend.loads.store(0, Ordering::SeqCst);
            let blobs = load_header_with(&backend, &encryptor, &handle, size, window)
                .await
                .unwrap();
            assert_eq!(blobs.len(), 40);
            assert_eq!(
                backend.loads.load(Ordering::SeqCst),
                expected_loads,
                "window {}",
                window
            );
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_is_corruption() {
        let encryptor = MasterKey::generate().encryptor();
        let backend = MemoryBackend::new();
        let pack = build_pack(&encryptor, 2);

        let mut data = vec![0u8; 16];
        data.extend_from_slice(&pack.data);
        let handle = Handle::new(FileType::Data, "padded");
        backend.save(&handle, Bytes::from(data.clone())).await.unwrap();

        let err = load_header(&backend, &encryptor, &handle, data.len() as u64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptedPack { .. }));
    }

    #[tokio::test]
    async fn test_wrong_key_fails_authentication() {
        let encryptor = MasterKey::generate().encryptor();
        let other = MasterKey::generate().encryptor();
        let backend = MemoryBackend::new();
        let pack = build_pack(&encryptor, 2);
        let handle = store(&backend, &pack).await;

        let err = load_header(&backend, &other, &handle, pack.data.len() as u64)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }
}
