pub mod config;
pub mod error;
pub mod types;

pub use config::{LockboxConfig, StorageBudget};
pub use error::{
    CryptoError, EngineError, KeyError, LockboxError, LockboxResult, MetadataError, StorageError,
};
pub use types::{ChunkRecord, Direction, EncryptedArtifact, FileIdentifier, FileSizeInfo};
