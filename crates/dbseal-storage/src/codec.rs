//! Versioned, authenticated token format for sealed database files.
//!
//! Layout (big-endian):
//! `magic(6) | version(1) | algorithm(1) | iterations(4) | salt(16) | nonce(12) | ciphertext | tag(16)`.
//! The whole header is bound as associated data, so any change to it fails
//! authentication just like a change to the ciphertext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use dbseal_core::MasterKey;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::kdf::{self, DerivedKey, Salt, MAX_ITERATIONS, SALT_LEN};

pub const MAGIC: &[u8; 6] = b"DBSEAL";
pub const FORMAT_VERSION: u8 = 1;
/// PBKDF2-HMAC-SHA256 key stretching with AES-256-GCM.
pub const ALG_PBKDF2_AES256GCM: u8 = 1;
pub const MARKER_LEN: usize = MAGIC.len() + 2;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = MARKER_LEN + 4 + SALT_LEN + NONCE_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer is not a sealed token")]
    NotSealed,
    #[error("token truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported algorithm id {0}")]
    UnsupportedAlgorithm(u8),
    #[error("implausible iteration count {0} in header")]
    InvalidIterations(u32),
    #[error("authentication failed (wrong key or corrupted data)")]
    Authentication,
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Parsed fixed-size header of a sealed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub version: u8,
    pub algorithm: u8,
    pub iterations: u32,
    pub salt: Salt,
    pub nonce: [u8; NONCE_LEN],
}

impl TokenHeader {
    pub fn parse(token: &[u8]) -> Result<Self, CodecError> {
        if !token.starts_with(MAGIC) {
            return Err(CodecError::NotSealed);
        }
        if token.len() < HEADER_LEN + TAG_LEN {
            return Err(CodecError::Truncated { len: token.len() });
        }

        let version = token[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let algorithm = token[MAGIC.len() + 1];
        if algorithm != ALG_PBKDF2_AES256GCM {
            return Err(CodecError::UnsupportedAlgorithm(algorithm));
        }

        let mut cursor = MARKER_LEN;
        let mut iter_bytes = [0u8; 4];
        iter_bytes.copy_from_slice(&token[cursor..cursor + 4]);
        let iterations = u32::from_be_bytes(iter_bytes);
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(CodecError::InvalidIterations(iterations));
        }
        cursor += 4;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&token[cursor..cursor + SALT_LEN]);
        cursor += SALT_LEN;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&token[cursor..cursor + NONCE_LEN]);

        Ok(Self {
            version,
            algorithm,
            iterations,
            salt,
            nonce,
        })
    }

    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..MAGIC.len()].copy_from_slice(MAGIC);
        out[MAGIC.len()] = self.version;
        out[MAGIC.len() + 1] = self.algorithm;
        let mut cursor = MARKER_LEN;
        out[cursor..cursor + 4].copy_from_slice(&self.iterations.to_be_bytes());
        cursor += 4;
        out[cursor..cursor + SALT_LEN].copy_from_slice(&self.salt);
        cursor += SALT_LEN;
        out[cursor..cursor + NONCE_LEN].copy_from_slice(&self.nonce);
        out
    }
}

/// Cheap prefix check: does `buffer` carry the token magic?
/// Any magic-prefixed buffer counts, whatever its version byte, so unknown or
/// damaged tokens fail in [`TokenHeader::parse`] instead of passing as plaintext.
pub fn looks_sealed(buffer: &[u8]) -> bool {
    buffer.starts_with(MAGIC)
}

/// Authenticated-encrypt `plaintext` under `key`, embedding its salt and work factor.
pub fn seal(plaintext: &[u8], key: &DerivedKey) -> Result<Vec<u8>, CodecError> {
    let cipher = build_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    let header = TokenHeader {
        version: FORMAT_VERSION,
        algorithm: ALG_PBKDF2_AES256GCM,
        iterations: key.iterations(),
        salt: *key.salt(),
        nonce: nonce_bytes,
    }
    .to_bytes();

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|e| CodecError::Encrypt(e.to_string()))?;

    let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    token.extend_from_slice(&header);
    token.extend_from_slice(&ciphertext);
    Ok(token)
}

/// Verify and decrypt `token` with an already-derived key.
/// Nothing is returned unless the tag verifies.
pub fn open(token: &[u8], key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let header = TokenHeader::parse(token)?;
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&header.nonce);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &token[HEADER_LEN..],
                aad: &token[..HEADER_LEN],
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CodecError::Authentication)
}

/// Derive the file key from the header's salt and work factor, then decrypt.
pub fn open_with_master(
    token: &[u8],
    master: &MasterKey,
) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let header = TokenHeader::parse(token)?;
    let key = kdf::derive(master, &header.salt, header.iterations)
        .map_err(|e| CodecError::Derivation(e.to_string()))?;
    open(token, &key)
}

fn build_cipher(key: &DerivedKey) -> Result<Aes256Gcm, CodecError> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::Encrypt(format!("cipher init failed: {e}")))
}
