//! Chunked cipher engine: encrypt/decrypt jobs plus artifact housekeeping
//!
//! Every job runs its file I/O and AEAD work on a blocking thread, admitted
//! through a worker semaphore and serialized per identifier:
//!   - `encrypt`: fresh key → admission → stream chunks → tags/nonces → 0600
//!   - `decrypt`: load key → admission → load metadata → stream chunks
//!   - `remove`: delete artifact, metadata, and key
//!   - `prune`: keep only the newest artifacts (keys stay)

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use lockbox_core::{
    Direction, EncryptedArtifact, EngineError, FileIdentifier, LockboxConfig, LockboxError,
    LockboxResult, MetadataError, StorageBudget, StorageError,
};
use lockbox_crypto::{generate_key, ChunkCipher, NonceSequence, SymmetricKey, NONCE_SIZE, TAG_SIZE};
use lockbox_secrets::KeyStore;
use lockbox_storage::{
    file_size, is_valid_extension, protect_file, read_sequence, remove_sequence, write_sequence,
    FsSpaceProbe, SecureRoot, SpaceProbe, StorageAccountant,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::locks::IdentifierLocks;
use crate::notify::{CryptoObserver, EventSink, NotificationHub, Notifier};
use crate::state::{JobState, JobTracker};

/// Bytes used under the secure root against the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used: u64,
    pub ceiling: u64,
}

impl StorageUsage {
    pub fn fraction(&self) -> f64 {
        if self.ceiling == 0 {
            return 1.0;
        }
        self.used as f64 / self.ceiling as f64
    }
}

/// Configures and builds an [`Engine`].
pub struct EngineBuilder {
    data_dir: PathBuf,
    budget: StorageBudget,
    workers: usize,
    keys: Arc<dyn KeyStore>,
    probe: Arc<dyn SpaceProbe>,
}

impl EngineBuilder {
    pub fn new(data_dir: impl Into<PathBuf>, keys: Arc<dyn KeyStore>) -> Self {
        Self {
            data_dir: data_dir.into(),
            budget: StorageBudget::default(),
            workers: 0,
            keys,
            probe: Arc::new(FsSpaceProbe),
        }
    }

    /// Data dir, budget and worker count taken from a loaded config.
    pub fn from_config(config: &LockboxConfig, keys: Arc<dyn KeyStore>) -> Self {
        Self::new(config.storage.resolve_data_dir(), keys)
            .budget(config.budget)
            .workers(config.engine.effective_workers())
    }

    pub fn budget(mut self, budget: StorageBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Concurrent jobs; 0 resolves to the machine's parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn build(self) -> LockboxResult<Engine> {
        self.budget.validate()?;
        let workers = if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        };
        info!(
            data_dir = %self.data_dir.display(),
            workers,
            chunk_size = self.budget.chunk_size,
            "cipher engine ready"
        );
        Ok(Engine {
            inner: Arc::new(Inner {
                data_dir: self.data_dir,
                budget: self.budget,
                keys: self.keys,
                probe: self.probe,
                pool: Semaphore::new(workers),
                locks: IdentifierLocks::new(),
                hub: OnceLock::new(),
            }),
        })
    }
}

struct Inner {
    data_dir: PathBuf,
    budget: StorageBudget,
    keys: Arc<dyn KeyStore>,
    probe: Arc<dyn SpaceProbe>,
    pool: Semaphore,
    locks: IdentifierLocks,
    /// Started by the first job that brings an observer
    hub: OnceLock<NotificationHub>,
}

/// Cheap to clone; clones share the worker pool and identifier locks.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn budget(&self) -> &StorageBudget {
        &self.inner.budget
    }

    /// Resolve (creating on first use) the secure root.
    pub fn secure_root(&self) -> LockboxResult<SecureRoot> {
        Ok(SecureRoot::resolve(&self.inner.data_dir)?)
    }

    fn notifier(&self, observer: Option<Weak<dyn CryptoObserver>>) -> Notifier {
        match observer {
            Some(observer) => self
                .inner
                .hub
                .get_or_init(NotificationHub::spawn)
                .notifier(Some(observer)),
            None => Notifier::detached(),
        }
    }

    fn accountant(&self, root: SecureRoot) -> StorageAccountant {
        StorageAccountant::with_probe(root, self.inner.budget, self.inner.probe.clone())
    }

    // ── Encrypt ──────────────────────────────────────────────────────────────

    /// Encrypt `input` under a fresh key stored for `id`.
    ///
    /// Returns once the artifact and both metadata files are durable and every
    /// notification has been handed to `observer`.
    pub async fn encrypt(
        &self,
        id: &FileIdentifier,
        input: impl AsRef<Path>,
        observer: Option<&Arc<dyn CryptoObserver>>,
    ) -> LockboxResult<EncryptedArtifact> {
        self.run_encrypt(
            id.clone(),
            input.as_ref().to_path_buf(),
            observer.map(Arc::downgrade),
        )
        .await
    }

    /// Run [`Engine::encrypt`] as an independent task.
    pub fn spawn_encrypt(
        &self,
        id: FileIdentifier,
        input: PathBuf,
        observer: Option<&Arc<dyn CryptoObserver>>,
    ) -> JoinHandle<LockboxResult<EncryptedArtifact>> {
        let engine = self.clone();
        let observer = observer.map(Arc::downgrade);
        tokio::spawn(async move { engine.run_encrypt(id, input, observer).await })
    }

    async fn run_encrypt(
        &self,
        id: FileIdentifier,
        input: PathBuf,
        observer: Option<Weak<dyn CryptoObserver>>,
    ) -> LockboxResult<EncryptedArtifact> {
        let notifier = self.notifier(observer);
        let sink = notifier.sink(Direction::Encrypt, &id);

        let _guard = self.inner.locks.lock(&id).await;
        sink.started();

        let engine = self.clone();
        let job_sink = sink.clone();
        let result = self
            .on_worker(move || {
                let mut job = JobTracker::new(Direction::Encrypt, &id);
                let result = engine.encrypt_blocking(&mut job, &id, &input, &job_sink);
                job.settle(&result);
                result
            })
            .await;

        match &result {
            Ok(artifact) => {
                info!(
                    path = %artifact.path.display(),
                    chunks = artifact.chunk_count(),
                    "encrypted"
                );
                sink.finished();
            }
            Err(e) => {
                warn!("encryption failed: {e}");
                sink.failed(e);
            }
        }
        drop(sink);
        notifier.finish().await;
        result
    }

    fn encrypt_blocking(
        &self,
        job: &mut JobTracker,
        id: &FileIdentifier,
        input: &Path,
        sink: &EventSink,
    ) -> LockboxResult<EncryptedArtifact> {
        job.advance(JobState::Admitting);
        self.reject_artifact_input(id, input)?;

        let key = generate_key();
        self.inner.keys.save(&key, id)?;

        let plain_size = file_size(input)?;
        let root = self.secure_root()?;
        self.accountant(root.clone()).check_admission(plain_size)?;
        job.advance(JobState::KeyReady);

        self.stream_encrypt(job, id, input, &root, &key, plain_size, sink)
            .map_err(|e| EngineError::EncryptionFailed(Box::new(e)).into())
    }

    /// Creating the artifact truncates it, so it can never be its own input.
    fn reject_artifact_input(&self, id: &FileIdentifier, input: &Path) -> Result<(), EngineError> {
        let artifact = SecureRoot::locate(&self.inner.data_dir).artifact_path(id);
        match (input.canonicalize(), artifact.canonicalize()) {
            (Ok(a), Ok(b)) if a == b => Err(EngineError::InputIsArtifact(input.to_path_buf())),
            _ => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_encrypt(
        &self,
        job: &mut JobTracker,
        id: &FileIdentifier,
        input: &Path,
        root: &SecureRoot,
        key: &SymmetricKey,
        plain_size: u64,
        sink: &EventSink,
    ) -> LockboxResult<EncryptedArtifact> {
        let artifact_path = root.artifact_path(id);
        let mut reader = File::open(input).map_err(io_error(input))?;
        let mut out = File::create(&artifact_path).map_err(io_error(&artifact_path))?;

        let cipher = ChunkCipher::new(key);
        let mut nonce_seq = NonceSequence::new();
        let mut nonces = Vec::new();
        let mut tags = Vec::new();
        let mut buf = vec![0u8; self.inner.budget.chunk_size as usize];
        let mut done = 0u64;
        let mut index = 0u64;

        loop {
            let n = read_full(&mut reader, &mut buf).map_err(io_error(input))?;
            if n == 0 {
                break;
            }
            job.advance(JobState::Streaming { chunk: index });

            let nonce = nonce_seq.next_nonce()?;
            let chunk = &mut buf[..n];
            let tag = cipher.seal(index, &nonce, chunk)?;
            out.write_all(chunk).map_err(io_error(&artifact_path))?;
            nonces.push(nonce.to_vec());
            tags.push(tag.to_vec());

            done += n as u64;
            index += 1;
            sink.progress(fraction(done, plain_size));

            if n < buf.len() {
                break;
            }
        }
        if index == 0 {
            sink.progress(1.0);
        }

        job.advance(JobState::Finalizing);
        out.sync_all().map_err(io_error(&artifact_path))?;
        drop(out);

        write_sequence(&root.tag_path(id), &tags)?;
        write_sequence(&root.nonce_path(id), &nonces)?;
        protect_file(&artifact_path).map_err(io_error(&artifact_path))?;

        Ok(EncryptedArtifact {
            path: artifact_path,
            nonces,
            tags,
        })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────────

    /// Decrypt the artifact for `id` into `<root>/<id>.<output_extension>`.
    pub async fn decrypt(
        &self,
        id: &FileIdentifier,
        output_extension: &str,
        observer: Option<&Arc<dyn CryptoObserver>>,
    ) -> LockboxResult<PathBuf> {
        self.run_decrypt(
            id.clone(),
            output_extension.to_string(),
            observer.map(Arc::downgrade),
        )
        .await
    }

    /// Run [`Engine::decrypt`] as an independent task.
    pub fn spawn_decrypt(
        &self,
        id: FileIdentifier,
        output_extension: String,
        observer: Option<&Arc<dyn CryptoObserver>>,
    ) -> JoinHandle<LockboxResult<PathBuf>> {
        let engine = self.clone();
        let observer = observer.map(Arc::downgrade);
        tokio::spawn(async move { engine.run_decrypt(id, output_extension, observer).await })
    }

    async fn run_decrypt(
        &self,
        id: FileIdentifier,
        ext: String,
        observer: Option<Weak<dyn CryptoObserver>>,
    ) -> LockboxResult<PathBuf> {
        let notifier = self.notifier(observer);
        let sink = notifier.sink(Direction::Decrypt, &id);

        let _guard = self.inner.locks.lock(&id).await;
        sink.started();

        let engine = self.clone();
        let job_sink = sink.clone();
        let result = self
            .on_worker(move || {
                let mut job = JobTracker::new(Direction::Decrypt, &id);
                let result = engine.decrypt_blocking(&mut job, &id, &ext, &job_sink);
                job.settle(&result);
                result
            })
            .await;

        match &result {
            Ok(path) => {
                info!(path = %path.display(), "decrypted");
                sink.finished();
            }
            Err(e) => {
                warn!("decryption failed: {e}");
                sink.failed(e);
            }
        }
        drop(sink);
        notifier.finish().await;
        result
    }

    fn decrypt_blocking(
        &self,
        job: &mut JobTracker,
        id: &FileIdentifier,
        ext: &str,
        sink: &EventSink,
    ) -> LockboxResult<PathBuf> {
        if !is_valid_extension(ext) {
            return Err(EngineError::InvalidExtension(ext.to_string()).into());
        }
        job.advance(JobState::Admitting);

        let key = self.inner.keys.load(id)?;
        let root = self.secure_root()?;
        let artifact_path = root.artifact_path(id);
        let cipher_size = file_size(&artifact_path)?;
        self.accountant(root.clone()).check_admission(cipher_size)?;

        let tags = read_sequence(&root.tag_path(id))?;
        let nonces = read_sequence(&root.nonce_path(id))?;
        self.check_sequences(&nonces, &tags, cipher_size)?;
        job.advance(JobState::KeyReady);

        let out_path = root.decrypted_path(id, ext);
        let mut reader = File::open(&artifact_path).map_err(io_error(&artifact_path))?;
        let mut out = File::create(&out_path).map_err(io_error(&out_path))?;

        let cipher = ChunkCipher::new(&key);
        let chunk_size = self.inner.budget.chunk_size;
        let mut buf = vec![0u8; chunk_size as usize];
        let mut done = 0u64;

        for (i, (nonce, tag)) in nonces.iter().zip(tags.iter()).enumerate() {
            let index = i as u64;
            job.advance(JobState::Streaming { chunk: index });

            let len = chunk_size.min(cipher_size - done) as usize;
            let chunk = &mut buf[..len];
            reader.read_exact(chunk).map_err(io_error(&artifact_path))?;
            cipher.open(index, nonce, tag, chunk)?;
            out.write_all(chunk).map_err(io_error(&out_path))?;

            done += len as u64;
            sink.progress(fraction(done, cipher_size));
        }
        if nonces.is_empty() {
            sink.progress(1.0);
        }

        job.advance(JobState::Finalizing);
        out.sync_all().map_err(io_error(&out_path))?;
        protect_file(&out_path).map_err(io_error(&out_path))?;
        Ok(out_path)
    }

    /// Nonce/tag sequences must be index-aligned with the ciphertext chunks.
    fn check_sequences(
        &self,
        nonces: &[Vec<u8>],
        tags: &[Vec<u8>],
        cipher_size: u64,
    ) -> Result<(), MetadataError> {
        if nonces.len() != tags.len() {
            return Err(MetadataError::Corrupt(format!(
                "{} nonces but {} tags",
                nonces.len(),
                tags.len()
            )));
        }
        let expected = self.inner.budget.chunk_count(cipher_size);
        if nonces.len() as u64 != expected {
            return Err(MetadataError::Corrupt(format!(
                "{} metadata entries for {expected} ciphertext chunks",
                nonces.len()
            )));
        }
        if let Some(i) = nonces.iter().position(|n| n.len() != NONCE_SIZE) {
            return Err(MetadataError::Corrupt(format!("nonce {i} has wrong length")));
        }
        if let Some(i) = tags.iter().position(|t| t.len() != TAG_SIZE) {
            return Err(MetadataError::Corrupt(format!("tag {i} has wrong length")));
        }
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    /// Delete the artifact, its metadata and its key.
    pub async fn remove(&self, id: &FileIdentifier) -> LockboxResult<()> {
        let _guard = self.inner.locks.lock(id).await;
        let engine = self.clone();
        let id = id.clone();
        self.on_worker(move || {
            let root = engine.secure_root()?;
            let artifact = root.artifact_path(&id);
            match std::fs::remove_file(&artifact) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&artifact)(e).into()),
            }
            for path in [root.nonce_path(&id), root.tag_path(&id)] {
                remove_sequence(&path).map_err(io_error(&path))?;
            }
            engine.inner.keys.delete(&id)?;
            info!(file_id = %id, "removed artifact and key");
            Ok(())
        })
        .await
    }

    /// Keep the `keep` newest artifacts and delete the rest. Keys stay in the
    /// key store.
    pub async fn prune(&self, keep: usize) -> LockboxResult<Vec<FileIdentifier>> {
        let engine = self.clone();
        self.on_worker(move || {
            let root = engine.secure_root()?;
            Ok(engine.accountant(root).prune_oldest(keep)?)
        })
        .await
    }

    /// Current usage under the secure root.
    pub async fn usage(&self) -> LockboxResult<StorageUsage> {
        let engine = self.clone();
        self.on_worker(move || {
            let root = engine.secure_root()?;
            let used = engine.accountant(root).current_usage()?;
            Ok(StorageUsage {
                used,
                ceiling: engine.inner.budget.max_storage_ceiling,
            })
        })
        .await
    }

    /// Run blocking work once a worker permit is free.
    async fn on_worker<T, F>(&self, work: F) -> LockboxResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> LockboxResult<T> + Send + 'static,
    {
        let _permit = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::Join(format!("worker pool closed: {e}")))?;
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| LockboxError::from(EngineError::Join(e.to_string())))?
    }
}

fn fraction(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0) as f32
}

/// Fill `buf` from `reader`, short only at end of input.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}
