//! lockbox-crypto: chunk-wise authenticated encryption for files at rest
//!
//! Architecture: Chunk-then-Encrypt with AES-256-GCM, tags stored detached
//!
//! ```text
//! File Key (per file identifier, 256-bit random, held in the key store)
//!   └── Chunk AEAD: AES-256-GCM (key=file_key, nonce=random_96bit, AAD=chunk_idx)
//!         ├── ciphertext → artifact file (same length as plaintext)
//!         ├── nonce      → nonce sequence
//!         └── tag        → tag sequence
//! ```

pub mod chunk;
pub mod keys;

pub use chunk::{decrypt_chunk, encrypt_chunk, random_nonce, ChunkCipher, NonceSequence};
pub use keys::{generate_key, SymmetricKey};

/// Size of a file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// AES block size, used for overhead estimation
pub const BLOCK_SIZE: usize = 16;
