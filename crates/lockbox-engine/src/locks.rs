//! Per-identifier job serialization.
//!
//! Jobs touching the same identifier (encrypt, decrypt, remove) share a key
//! store entry and metadata paths, so they run one at a time. Different
//! identifiers never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lockbox_core::FileIdentifier;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct IdentifierLocks {
    slots: Mutex<HashMap<FileIdentifier, Arc<TokioMutex<()>>>>,
}

impl IdentifierLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Released when the guard drops.
    pub async fn lock(&self, id: &FileIdentifier) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(id.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of identifiers currently held or awaited.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }
}
