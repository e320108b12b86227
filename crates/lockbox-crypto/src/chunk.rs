//! Per-chunk AES-256-GCM sealing with detached nonces and tags
//!
//! Ciphertext chunks are written back to back; the nonce and tag of chunk `i`
//! live in separate, index-aligned sequences:
//! ```text
//! artifact:  [ct_0][ct_1]...[ct_n]          (len(ct_i) == len(pt_i))
//! nonces:    [12 bytes]_0 ... [12 bytes]_n
//! tags:      [16 bytes]_0 ... [16 bytes]_n
//! AAD = chunk_index (8 bytes, big-endian)
//! ```
//!
//! The AAD binds each chunk to its position, so swapping two ciphertext chunks
//! together with their nonces/tags still fails authentication.

use std::collections::HashSet;

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;

use lockbox_core::CryptoError;

use crate::keys::SymmetricKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Draw a 96-bit nonce from the OS random source.
pub fn random_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::NonceGeneration(e.to_string()))?;
    Ok(nonce)
}

/// Hands out nonces for one encryption job, never repeating within the job.
#[derive(Debug, Default)]
pub struct NonceSequence {
    issued: HashSet<[u8; NONCE_SIZE]>,
}

impl NonceSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        // A repeat from a healthy RNG is practically impossible; redraw a few
        // times and then treat the source as broken.
        for _ in 0..4 {
            let nonce = random_nonce()?;
            if self.issued.insert(nonce) {
                return Ok(nonce);
            }
            tracing::warn!("random source repeated a nonce, redrawing");
        }
        Err(CryptoError::NonceGeneration(
            "random source keeps repeating nonces".into(),
        ))
    }

    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}

/// AES-256-GCM bound to one file key for the duration of a job.
pub struct ChunkCipher {
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `buf` in place and return the detached tag.
    pub fn seal(
        &self,
        chunk_index: u64,
        nonce: &[u8; NONCE_SIZE],
        buf: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError> {
        let aad = chunk_index.to_be_bytes();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &aad, buf)
            .map_err(|_| CryptoError::Seal { index: chunk_index })?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Verify `tag` and decrypt `buf` in place. `buf` is left unspecified on
    /// failure and must not be used.
    pub fn open(
        &self,
        chunk_index: u64,
        nonce: &[u8],
        tag: &[u8],
        buf: &mut [u8],
    ) -> Result<(), CryptoError> {
        if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(CryptoError::Authentication { index: chunk_index });
        }
        let aad = chunk_index.to_be_bytes();
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(nonce), &aad, buf, Tag::from_slice(tag))
            .map_err(|_| CryptoError::Authentication { index: chunk_index })
    }
}

/// Seal a single chunk with a fresh nonce. Returns `(ciphertext, nonce, tag)`.
pub fn encrypt_chunk(
    key: &SymmetricKey,
    chunk_index: u64,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE], [u8; TAG_SIZE]), CryptoError> {
    let nonce = random_nonce()?;
    let mut buf = plaintext.to_vec();
    let tag = ChunkCipher::new(key).seal(chunk_index, &nonce, &mut buf)?;
    Ok((buf, nonce, tag))
}

/// Open a single chunk sealed by [`encrypt_chunk`].
pub fn decrypt_chunk(
    key: &SymmetricKey,
    chunk_index: u64,
    nonce: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut buf = ciphertext.to_vec();
    ChunkCipher::new(key).open(chunk_index, nonce, tag, &mut buf)?;
    Ok(buf)
}
