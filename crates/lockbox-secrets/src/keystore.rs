//! Per-file key persistence.
//!
//! `KeyringStore` uses the `keyring` crate for cross-platform access:
//! - macOS/iOS: Keychain Services
//! - Linux: kernel keyutils
//! - Windows: Credential Manager (DPAPI)
//!
//! Entries are named `"{app_id}.{file_id}"` under the service `app_id`.

use std::collections::HashMap;
use std::sync::Mutex;

use lockbox_core::{FileIdentifier, KeyError};
use lockbox_crypto::SymmetricKey;
use zeroize::Zeroize;

/// Secure, access-controlled storage for one key per file identifier.
///
/// Implementations must not cache: every call round-trips to the backing store.
pub trait KeyStore: Send + Sync {
    /// Create the entry for `id`, or overwrite it in place if it exists.
    fn save(&self, key: &SymmetricKey, id: &FileIdentifier) -> Result<(), KeyError>;

    /// Load the key for `id`.
    fn load(&self, id: &FileIdentifier) -> Result<SymmetricKey, KeyError>;

    /// Remove the entry for `id`. Removing a missing entry is not an error.
    fn delete(&self, id: &FileIdentifier) -> Result<(), KeyError>;
}

/// Platform keychain backend.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    app_id: String,
}

impl KeyringStore {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }

    /// Namespaced account tag for a file identifier.
    pub fn account_name(&self, id: &FileIdentifier) -> String {
        format!("{}.{}", self.app_id, id)
    }

    fn entry(&self, id: &FileIdentifier) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.app_id, &self.account_name(id))
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.app_id, "__lockbox_probe__").is_ok()
    }
}

impl KeyStore for KeyringStore {
    fn save(&self, key: &SymmetricKey, id: &FileIdentifier) -> Result<(), KeyError> {
        let entry = self.entry(id).map_err(|e| KeyError::Save {
            file_id: id.to_string(),
            reason: format!("keychain entry creation: {e}"),
        })?;

        match entry.get_secret() {
            Ok(mut existing) => {
                existing.zeroize();
                tracing::debug!(file_id = %id, "key already exists in keychain, updating");
                entry
                    .set_secret(key.as_bytes())
                    .map_err(|e| KeyError::Update {
                        file_id: id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Err(keyring::Error::NoEntry) => {
                entry
                    .set_secret(key.as_bytes())
                    .map_err(|e| KeyError::Save {
                        file_id: id.to_string(),
                        reason: e.to_string(),
                    })?;
                tracing::debug!(file_id = %id, "stored key in platform keychain");
            }
            Err(e) => {
                return Err(KeyError::Save {
                    file_id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
        Ok(())
    }

    fn load(&self, id: &FileIdentifier) -> Result<SymmetricKey, KeyError> {
        let entry = self.entry(id).map_err(|e| KeyError::Load {
            file_id: id.to_string(),
            reason: format!("keychain entry creation: {e}"),
        })?;

        match entry.get_secret() {
            Ok(mut bytes) => {
                let key = SymmetricKey::from_slice(&bytes);
                let len = bytes.len();
                bytes.zeroize();
                key.ok_or_else(|| KeyError::Load {
                    file_id: id.to_string(),
                    reason: format!("stored key has {len} bytes, expected 32"),
                })
            }
            Err(keyring::Error::NoEntry) => Err(KeyError::NotFound {
                file_id: id.to_string(),
            }),
            Err(e) => Err(KeyError::Load {
                file_id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn delete(&self, id: &FileIdentifier) -> Result<(), KeyError> {
        let entry = self.entry(id).map_err(|e| KeyError::Delete {
            file_id: id.to_string(),
            reason: format!("keychain entry creation: {e}"),
        })?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!(file_id = %id, "deleted key from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(KeyError::Delete {
                file_id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Process-local key store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, SymmetricKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, key: &SymmetricKey, id: &FileIdentifier) -> Result<(), KeyError> {
        let mut entries = self.entries.lock().map_err(|e| KeyError::Save {
            file_id: id.to_string(),
            reason: format!("key store lock poisoned: {e}"),
        })?;
        entries.insert(id.to_string(), key.clone());
        Ok(())
    }

    fn load(&self, id: &FileIdentifier) -> Result<SymmetricKey, KeyError> {
        let entries = self.entries.lock().map_err(|e| KeyError::Load {
            file_id: id.to_string(),
            reason: format!("key store lock poisoned: {e}"),
        })?;
        entries
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| KeyError::NotFound {
                file_id: id.to_string(),
            })
    }

    fn delete(&self, id: &FileIdentifier) -> Result<(), KeyError> {
        let mut entries = self.entries.lock().map_err(|e| KeyError::Delete {
            file_id: id.to_string(),
            reason: format!("key store lock poisoned: {e}"),
        })?;
        entries.remove(id.as_str());
        Ok(())
    }
}
