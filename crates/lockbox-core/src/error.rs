use std::path::PathBuf;

use thiserror::Error;

pub type LockboxResult<T> = Result<T, LockboxError>;

/// Key store failures.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("error in saving key for '{file_id}': {reason}")]
    Save { file_id: String, reason: String },

    #[error("key for '{file_id}' already exists and failed to update: {reason}")]
    Update { file_id: String, reason: String },

    #[error("error in key loading for '{file_id}': {reason}")]
    Load { file_id: String, reason: String },

    #[error("key not found for '{file_id}'")]
    NotFound { file_id: String },

    #[error("error deleting key for '{file_id}': {reason}")]
    Delete { file_id: String, reason: String },
}

/// Storage accounting and filesystem layout failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("insufficient storage: {available} bytes available, {required} bytes required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("storage limit exceeded: {current} bytes used + {incoming} bytes incoming > {ceiling} byte ceiling")]
    StorageLimitExceeded {
        current: u64,
        incoming: u64,
        ceiling: u64,
    },

    #[error("unable to create secure directory {}: {source}", path.display())]
    UnableToCreateSecureDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to determine file size of {}: {source}", path.display())]
    FileSize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to probe free space at {}: {source}", path.display())]
    SpaceProbe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file operation failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// AEAD and randomness failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unable to generate nonce: {0}")]
    NonceGeneration(String),

    #[error("chunk {index} encryption failed")]
    Seal { index: u64 },

    #[error("chunk {index} failed authentication (wrong key, tampered tag or corrupted ciphertext)")]
    Authentication { index: u64 },
}

/// Nonce/tag sequence persistence failures.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("decryption metadata not found at {}: {reason}", path.display())]
    NotFound { path: PathBuf, reason: String },

    #[error("decryption metadata is corrupt: {0}")]
    Corrupt(String),

    #[error("writing metadata to {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
}

/// Job-level failures raised by the cipher engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to encrypt this file: {0}")]
    EncryptionFailed(#[source] Box<LockboxError>),

    #[error("invalid file identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid output extension '{0}'")]
    InvalidExtension(String),

    #[error("input {} is the artifact it would be encrypted into", .0.display())]
    InputIsArtifact(PathBuf),

    #[error("worker task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("config error: {0}")]
    Config(String),
}

impl LockboxError {
    /// Short, user-facing message for status lines.
    pub fn message(&self) -> &'static str {
        match self {
            LockboxError::Key(KeyError::Save { .. }) => "Error in saving key",
            LockboxError::Key(KeyError::Update { .. }) => "Key already exists, failed to update",
            LockboxError::Key(KeyError::Load { .. }) => "Error in key loading",
            LockboxError::Key(KeyError::NotFound { .. }) => "Key not found",
            LockboxError::Key(KeyError::Delete { .. }) => "Error in key deletion",
            LockboxError::Storage(StorageError::InsufficientStorage { .. }) => {
                "The available storage is insufficient"
            }
            LockboxError::Storage(StorageError::StorageLimitExceeded { .. }) => {
                "Storage limit exceeded"
            }
            LockboxError::Storage(StorageError::UnableToCreateSecureDir { .. }) => {
                "Unable to create secure directory to store encrypted files"
            }
            LockboxError::Storage(StorageError::FileSize { .. }) => "Unable to determine file size",
            LockboxError::Storage(_) => "File operation failed",
            LockboxError::Crypto(CryptoError::NonceGeneration(_)) => "Unable to generate nonce",
            LockboxError::Crypto(CryptoError::Seal { .. }) => "Unable to encrypt this file",
            LockboxError::Crypto(CryptoError::Authentication { .. }) => {
                "Unable to decrypt this file"
            }
            LockboxError::Metadata(MetadataError::Write { .. }) => "Unable to store decryption metadata",
            LockboxError::Metadata(_) => "Decryption metadata not found",
            LockboxError::Engine(EngineError::EncryptionFailed(_)) => "Unable to encrypt this file",
            LockboxError::Engine(EngineError::InvalidIdentifier(_)) => "Invalid file identifier",
            LockboxError::Engine(EngineError::InvalidExtension(_)) => "Invalid output extension",
            LockboxError::Engine(EngineError::InputIsArtifact(_)) => "Unable to encrypt this file",
            LockboxError::Engine(EngineError::Join(_)) => "Worker task failed",
            LockboxError::Config(_) => "Configuration error",
        }
    }

    /// True when the failure came from tag verification rather than I/O.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            LockboxError::Crypto(CryptoError::Authentication { .. }) => true,
            LockboxError::Engine(EngineError::EncryptionFailed(inner)) => {
                inner.is_authentication_failure()
            }
            _ => false,
        }
    }
}
