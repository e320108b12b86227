//! lockbox-secrets: per-file key storage
//!
//! Every encrypted artifact has exactly one 256-bit key, stored under the
//! artifact's file identifier. Backends:
//!   1. `KeyringStore`   platform keychain (default for the CLI)
//!   2. `MemoryKeyStore` process-local map (tests, ephemeral sessions)

pub mod keystore;

pub use keystore::{KeyStore, KeyringStore, MemoryKeyStore};
