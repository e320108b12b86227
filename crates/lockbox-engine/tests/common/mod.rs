#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lockbox_core::{FileIdentifier, KeyError, StorageBudget};
use lockbox_crypto::SymmetricKey;
use lockbox_engine::{CryptoObserver, Engine, EngineBuilder, JobFailure};
use lockbox_secrets::{KeyStore, MemoryKeyStore};
use lockbox_storage::FixedSpaceProbe;
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

/// Plenty of room on the simulated volume
pub const ROOMY: u64 = 64 * 1024 * MIB;

pub struct Harness {
    pub tmp: TempDir,
    pub keys: Arc<MemoryKeyStore>,
    pub engine: Engine,
}

impl Harness {
    pub fn new(chunk_size: u64) -> Self {
        Self::with_space(chunk_size, ROOMY)
    }

    pub fn with_space(chunk_size: u64, available: u64) -> Self {
        let budget = StorageBudget {
            chunk_size,
            ..Default::default()
        };
        Self::with_budget(budget, available)
    }

    pub fn with_budget(budget: StorageBudget, available: u64) -> Self {
        let tmp = TempDir::new().unwrap();
        let keys = Arc::new(MemoryKeyStore::new());
        let engine = EngineBuilder::new(tmp.path().join("data"), keys.clone())
            .budget(budget)
            .workers(4)
            .space_probe(Arc::new(FixedSpaceProbe(available)))
            .build()
            .unwrap();
        Self { tmp, keys, engine }
    }

    pub fn input(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn root(&self) -> PathBuf {
        self.engine.secure_root().unwrap().path().to_path_buf()
    }
}

pub fn id(s: &str) -> FileIdentifier {
    FileIdentifier::new(s).unwrap()
}

/// Deterministic, non-repeating test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

/// Records every notification as a short string.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<f32>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<f32> {
        self.progress.lock().unwrap().clone()
    }

    fn push(&self, s: &str) {
        self.events.lock().unwrap().push(s.to_string());
    }
}

impl CryptoObserver for Recorder {
    fn encryption_started(&self, _id: &FileIdentifier) {
        self.push("encryption_started");
    }
    fn encryption_progress(&self, _id: &FileIdentifier, progress: f32) {
        self.progress.lock().unwrap().push(progress);
    }
    fn encryption_finished(&self, _id: &FileIdentifier) {
        self.push("encryption_finished");
    }
    fn encryption_failed(&self, _id: &FileIdentifier, failure: &JobFailure) {
        self.push(&format!("encryption_failed: {}", failure.summary));
    }
    fn decryption_started(&self, _id: &FileIdentifier) {
        self.push("decryption_started");
    }
    fn decryption_progress(&self, _id: &FileIdentifier, progress: f32) {
        self.progress.lock().unwrap().push(progress);
    }
    fn decryption_finished(&self, _id: &FileIdentifier) {
        self.push("decryption_finished");
    }
    fn decryption_failed(&self, _id: &FileIdentifier, failure: &JobFailure) {
        self.push(&format!("decryption_failed: {}", failure.summary));
    }
}

pub fn recorder() -> (Arc<Recorder>, Arc<dyn CryptoObserver>) {
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn CryptoObserver> = recorder.clone();
    (recorder, observer)
}

/// Key store whose backing facility rejects every write.
pub struct RejectingKeyStore;

impl KeyStore for RejectingKeyStore {
    fn save(&self, _key: &SymmetricKey, id: &FileIdentifier) -> Result<(), KeyError> {
        Err(KeyError::Save {
            file_id: id.to_string(),
            reason: "keychain locked".into(),
        })
    }

    fn load(&self, id: &FileIdentifier) -> Result<SymmetricKey, KeyError> {
        Err(KeyError::NotFound {
            file_id: id.to_string(),
        })
    }

    fn delete(&self, _id: &FileIdentifier) -> Result<(), KeyError> {
        Ok(())
    }
}
