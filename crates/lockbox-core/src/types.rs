use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::EngineError;

/// Names one logical document, independent of its extension.
///
/// The identifier is embedded in file names inside the secure root and in the
/// key store account name, so it must be a single, non-hidden path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileIdentifier(String);

impl FileIdentifier {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let invalid = raw.is_empty()
            || raw.starts_with('.')
            || raw.contains(['/', '\\', '\0'])
            || raw.len() > 200;
        if invalid {
            return Err(EngineError::InvalidIdentifier(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileIdentifier {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileIdentifier> for String {
    fn from(id: FileIdentifier) -> Self {
        id.0
    }
}

impl std::str::FromStr for FileIdentifier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Size estimate produced by an admission check. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSizeInfo {
    pub original_size: u64,
    pub encrypted_size: u64,
    pub overhead: u64,
}

impl FileSizeInfo {
    pub fn overhead_percentage(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        self.overhead as f64 / self.original_size as f64 * 100.0
    }
}

/// One sealed chunk's position and its detached AEAD parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub index: u64,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Result of a successful encryption: ciphertext location plus the
/// index-aligned nonce and tag sequences.
#[derive(Debug, Clone)]
pub struct EncryptedArtifact {
    pub path: PathBuf,
    pub nonces: Vec<Vec<u8>>,
    pub tags: Vec<Vec<u8>>,
}

impl EncryptedArtifact {
    pub fn chunk_count(&self) -> usize {
        self.nonces.len()
    }

    /// Zip the nonce and tag sequences back into per-chunk records.
    pub fn records(&self) -> impl Iterator<Item = ChunkRecord> + '_ {
        self.nonces
            .iter()
            .zip(self.tags.iter())
            .enumerate()
            .map(|(i, (nonce, tag))| ChunkRecord {
                index: i as u64,
                nonce: nonce.clone(),
                tag: tag.clone(),
            })
    }
}

/// Direction of a cipher job, used for logging and event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encrypt => f.write_str("encrypt"),
            Direction::Decrypt => f.write_str("decrypt"),
        }
    }
}
