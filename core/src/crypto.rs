use crate::types::{KdfParams, base64_bytes};
use crate::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng},
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Bytes added by `Encryptor::encrypt` on top of the plaintext length.
pub const EXTENSION: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn derive_from_password(password: &str, params: &KdfParams) -> Result<Self> {
        if params.algorithm != "argon2id" {
            return Err(Error::Encryption(format!(
                "unsupported kdf algorithm: {}",
                params.algorithm
            )));
        }

        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(
                params.memory,
                params.iterations,
                params.parallelism,
                Some(KEY_SIZE),
            )
            .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut key = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password.as_bytes(), &params.salt, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Encryption("Key must be 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn encryptor(&self) -> Encryptor {
        Encryptor::from_key(&self.key)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Authenticated encryption producing `nonce || ciphertext || tag`.
#[derive(Clone)]
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + EXTENSION);
        self.encrypt_into(&mut out, plaintext)?;
        Ok(out)
    }

    /// Appends the sealed form of `plaintext` to `dst`. The two buffers can never
    /// overlap since `dst` is borrowed mutably.
    pub fn encrypt_into(&self, dst: &mut Vec<u8>, plaintext: &[u8]) -> Result<()> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        dst.reserve(plaintext.len() + EXTENSION);
        dst.extend_from_slice(&nonce);

        let start = dst.len();
        dst.extend_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut dst[start..])
            .map_err(|e| Error::Encryption(e.to_string()))?;
        dst.extend_from_slice(&tag);
        Ok(())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < EXTENSION {
            return Err(Error::Authentication);
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::Authentication)
    }
}

/// Password-protected copy of the master key, stored in plain JSON under `keys/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Utc>,
    pub username: String,
    pub hostname: String,
    pub kdf: KdfParams,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl KeyFile {
    pub fn seal(master: &MasterKey, password: &str, kdf: KdfParams) -> Result<Self> {
        let user_key = MasterKey::derive_from_password(password, &kdf)?;
        let data = user_key.encryptor().encrypt(master.as_bytes())?;

        Ok(Self {
            created: Utc::now(),
            username: current_username(),
            hostname: current_hostname(),
            kdf,
            data,
        })
    }

    pub fn open(&self, password: &str) -> Result<MasterKey> {
        let user_key = MasterKey::derive_from_password(password, &self.kdf)?;
        let plain = user_key
            .encryptor()
            .decrypt(&self.data)
            .map_err(|e| match e {
                Error::Authentication => Error::InvalidPassword,
                other => other,
            })?;
        MasterKey::from_slice(&plain)
    }
}

pub(crate) fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
