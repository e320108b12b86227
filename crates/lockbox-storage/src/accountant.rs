//! Storage admission control for the secure root.
//!
//! Every encrypt/decrypt is gated on three checks, all evaluated before a
//! single byte is written:
//!   1. available >= encrypted_size + reserve
//!   2. available >  reserve + (encrypted_size + reserve)
//!   3. current_usage + plain_size <= ceiling

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use lockbox_core::{FileIdentifier, FileSizeInfo, StorageBudget, StorageError};
use lockbox_crypto::{BLOCK_SIZE, NONCE_SIZE, TAG_SIZE};
use tracing::{debug, info, warn};

use crate::secure_dir::SecureRoot;

/// Reports free bytes on the volume containing a path.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Real volume statistics via `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// A volume that always reports the same capacity.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Size of a file on disk, mapped into the storage error taxonomy.
pub fn file_size(path: &Path) -> Result<u64, StorageError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| StorageError::FileSize {
            path: path.to_path_buf(),
            source,
        })
}

pub struct StorageAccountant {
    root: SecureRoot,
    budget: StorageBudget,
    probe: Arc<dyn SpaceProbe>,
}

impl StorageAccountant {
    pub fn new(root: SecureRoot, budget: StorageBudget) -> Self {
        Self::with_probe(root, budget, Arc::new(FsSpaceProbe))
    }

    pub fn with_probe(root: SecureRoot, budget: StorageBudget, probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            root,
            budget,
            probe,
        }
    }

    pub fn budget(&self) -> &StorageBudget {
        &self.budget
    }

    pub fn root(&self) -> &SecureRoot {
        &self.root
    }

    /// Bytes a plaintext of `plain_size` occupies once encrypted, counting one
    /// nonce and one tag per chunk plus block-alignment padding.
    ///
    /// Inputs of at most one chunk (including empty ones) are charged a single
    /// nonce+tag.
    pub fn compute_overhead(&self, plain_size: u64) -> FileSizeInfo {
        let block = BLOCK_SIZE as u64;
        let per_chunk = (NONCE_SIZE + TAG_SIZE) as u64;

        let remainder = plain_size % block;
        let padding = if remainder > 0 { block - remainder } else { 0 };
        let chunks = self.budget.chunk_count(plain_size).max(1);

        let overhead = chunks.saturating_mul(per_chunk).saturating_add(padding);
        FileSizeInfo {
            original_size: plain_size,
            encrypted_size: plain_size.saturating_add(overhead),
            overhead,
        }
    }

    /// Gate a write of `plain_size` bytes into the secure root.
    pub fn check_admission(&self, plain_size: u64) -> Result<FileSizeInfo, StorageError> {
        let info = self.compute_overhead(plain_size);
        let reserve = self.budget.min_free_space_reserve;

        let available = self
            .probe
            .available_space(self.root.path())
            .map_err(|source| StorageError::SpaceProbe {
                path: self.root.path().to_path_buf(),
                source,
            })?;

        let required = info.encrypted_size.saturating_add(reserve);
        if available < required {
            warn!(available, required, "admission rejected: below required space");
            return Err(StorageError::InsufficientStorage {
                available,
                required,
            });
        }

        // The volume must also keep a full reserve on top of the requirement.
        let headroom = reserve.saturating_add(required);
        if available <= headroom {
            warn!(available, required = headroom, "admission rejected: no headroom above reserve");
            return Err(StorageError::InsufficientStorage {
                available,
                required: headroom.saturating_add(1),
            });
        }

        let current = self.current_usage()?;
        if current.saturating_add(plain_size) > self.budget.max_storage_ceiling {
            warn!(
                current,
                incoming = plain_size,
                ceiling = self.budget.max_storage_ceiling,
                "admission rejected: storage ceiling"
            );
            return Err(StorageError::StorageLimitExceeded {
                current,
                incoming: plain_size,
                ceiling: self.budget.max_storage_ceiling,
            });
        }

        debug!(
            plain_size,
            encrypted_size = info.encrypted_size,
            overhead = info.overhead,
            available,
            current,
            "admission granted"
        );
        Ok(info)
    }

    /// Total bytes of regular files under the secure root, hidden entries excluded.
    pub fn current_usage(&self) -> Result<u64, StorageError> {
        usage_of(self.root.path())
    }

    /// Delete every artifact beyond the `keep_most_recent` newest, together
    /// with its nonce and tag files. Keys are left in the key store.
    ///
    /// Best-effort: a file that cannot be removed is logged and skipped.
    pub fn prune_oldest(&self, keep_most_recent: usize) -> Result<Vec<FileIdentifier>, StorageError> {
        let dir = self.root.path();
        let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut artifacts: Vec<(SystemTime, FileIdentifier)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let Some(id) = SecureRoot::identifier_of(&path) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            artifacts.push((created, id));
        }

        // Newest first; ties broken by identifier for a stable order
        artifacts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut removed = Vec::new();
        for (_, id) in artifacts.into_iter().skip(keep_most_recent) {
            let mut ok = true;
            for path in [
                self.root.artifact_path(&id),
                self.root.nonce_path(&id),
                self.root.tag_path(&id),
            ] {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), "prune: failed to remove: {e}");
                        ok = false;
                    }
                }
            }
            if ok {
                removed.push(id);
            }
        }

        info!(
            kept = keep_most_recent,
            removed = removed.len(),
            "pruned secure root"
        );
        Ok(removed)
    }
}

fn usage_of(dir: &Path) -> Result<u64, StorageError> {
    let mut total = 0u64;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // Removed by a concurrent job since the listing
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        if meta.is_dir() {
            total = total.saturating_add(usage_of(&path)?);
        } else if meta.is_file() {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_core::config::{DEFAULT_CHUNK_SIZE, DEFAULT_MIN_FREE_SPACE};

    const MIB: u64 = 1024 * 1024;

    fn accountant(tmp: &Path, available: u64, budget: StorageBudget) -> StorageAccountant {
        let root = SecureRoot::resolve(tmp).unwrap();
        StorageAccountant::with_probe(root, budget, Arc::new(FixedSpaceProbe(available)))
    }

    fn id(s: &str) -> FileIdentifier {
        FileIdentifier::new(s).unwrap()
    }

    #[test]
    fn test_overhead_single_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());

        // 100 bytes: 12 padding + 16 tag + 12 nonce
        let info = acct.compute_overhead(100);
        assert_eq!(info.overhead, 12 + 16 + 12);
        assert_eq!(info.encrypted_size, 100 + 40);

        // Block-aligned: no padding
        let info = acct.compute_overhead(64);
        assert_eq!(info.overhead, 28);

        // Empty input is still charged one nonce+tag
        let info = acct.compute_overhead(0);
        assert_eq!(info.overhead, 28);
        assert_eq!(info.original_size, 0);
    }

    #[test]
    fn test_overhead_counts_every_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());

        let info = acct.compute_overhead(3 * DEFAULT_CHUNK_SIZE);
        assert_eq!(info.overhead, 3 * 28);

        let info = acct.compute_overhead(DEFAULT_CHUNK_SIZE + 1);
        assert_eq!(info.overhead, 2 * 28 + 15);
    }

    #[test]
    fn test_admission_rejects_below_required() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = 10 * MIB;
        let probe_acct = accountant(tmp.path(), 0, StorageBudget::default());
        let estimated = probe_acct.compute_overhead(plain).encrypted_size;

        let acct = accountant(
            tmp.path(),
            estimated + DEFAULT_MIN_FREE_SPACE - 1,
            StorageBudget::default(),
        );
        let result = acct.check_admission(plain);
        assert!(matches!(
            result,
            Err(StorageError::InsufficientStorage { .. })
        ));
    }

    #[test]
    fn test_admission_rejects_without_headroom() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = 10 * MIB;
        let probe_acct = accountant(tmp.path(), 0, StorageBudget::default());
        let required = probe_acct.compute_overhead(plain).encrypted_size + DEFAULT_MIN_FREE_SPACE;

        // Passes the first check, exactly at the second threshold
        let acct = accountant(
            tmp.path(),
            required + DEFAULT_MIN_FREE_SPACE,
            StorageBudget::default(),
        );
        assert!(matches!(
            acct.check_admission(plain),
            Err(StorageError::InsufficientStorage { .. })
        ));
    }

    #[test]
    fn test_admission_accepts_strictly_above_thresholds() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = 10 * MIB;
        let probe_acct = accountant(tmp.path(), 0, StorageBudget::default());
        let required = probe_acct.compute_overhead(plain).encrypted_size + DEFAULT_MIN_FREE_SPACE;

        let acct = accountant(
            tmp.path(),
            required + DEFAULT_MIN_FREE_SPACE + 1,
            StorageBudget::default(),
        );
        let info = acct.check_admission(plain).unwrap();
        assert_eq!(info.original_size, plain);
    }

    #[test]
    fn test_admission_enforces_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let budget = StorageBudget {
            max_storage_ceiling: 1000,
            min_free_space_reserve: 0,
            ..Default::default()
        };
        let acct = accountant(tmp.path(), u64::MAX / 4, budget);
        std::fs::write(acct.root().path().join("old.ed"), vec![0u8; 600]).unwrap();

        assert!(acct.check_admission(400).is_ok());
        assert!(matches!(
            acct.check_admission(401),
            Err(StorageError::StorageLimitExceeded {
                current: 600,
                incoming: 401,
                ceiling: 1000
            })
        ));
    }

    #[test]
    fn test_current_usage_skips_hidden_and_recurses() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());
        let root = acct.root().path();

        std::fs::write(root.join("a.ed"), vec![0u8; 100]).unwrap();
        std::fs::write(root.join(".a.tmp"), vec![0u8; 999]).unwrap();
        std::fs::create_dir(root.join("nested")).unwrap();
        std::fs::write(root.join("nested/b.ed"), vec![0u8; 50]).unwrap();

        assert_eq!(acct.current_usage().unwrap(), 150);
    }

    #[test]
    fn test_probe_failure_is_reported() {
        struct BrokenProbe;
        impl SpaceProbe for BrokenProbe {
            fn available_space(&self, _path: &Path) -> io::Result<u64> {
                Err(io::Error::other("statvfs failed"))
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let root = SecureRoot::resolve(tmp.path()).unwrap();
        let acct = StorageAccountant::with_probe(root, StorageBudget::default(), Arc::new(BrokenProbe));
        assert!(matches!(
            acct.check_admission(1),
            Err(StorageError::SpaceProbe { .. })
        ));
    }

    #[test]
    fn test_file_size_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            file_size(&tmp.path().join("missing")),
            Err(StorageError::FileSize { .. })
        ));
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());
        let root = acct.root().clone();

        for (i, name) in ["oldest", "middle", "newest"].iter().enumerate() {
            let doc = id(name);
            std::fs::write(root.artifact_path(&doc), vec![i as u8; 8]).unwrap();
            std::fs::write(root.nonce_path(&doc), b"[]").unwrap();
            std::fs::write(root.tag_path(&doc), b"[]").unwrap();
            let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000 + i as u64 * 100);
            std::fs::File::options()
                .write(true)
                .open(root.artifact_path(&doc))
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }

        // Creation times are close together on most filesystems; only the
        // count of survivors is asserted.
        let removed = acct.prune_oldest(2).unwrap();
        assert_eq!(removed.len(), 1);
        let gone = &removed[0];
        assert!(!root.artifact_exists(gone));
        assert!(!root.nonce_path(gone).exists());
        assert!(!root.tag_path(gone).exists());

        let survivors = ["oldest", "middle", "newest"]
            .iter()
            .filter(|n| root.artifact_exists(&id(n)))
            .count();
        assert_eq!(survivors, 2);
    }

    #[test]
    fn test_prune_noop_under_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());
        std::fs::write(acct.root().artifact_path(&id("only")), b"x").unwrap();

        let removed = acct.prune_oldest(10).unwrap();
        assert!(removed.is_empty());
        assert!(acct.root().artifact_exists(&id("only")));
    }

    #[test]
    fn test_usage_tolerates_concurrent_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let acct = accountant(tmp.path(), u64::MAX, StorageBudget::default());
        let dir = acct.root().path().to_path_buf();
        std::fs::write(dir.join("steady.ed"), vec![0u8; 64]).unwrap();

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let churn = std::thread::spawn({
            let stop = stop.clone();
            let dir = dir.clone();
            move || {
                let mut i = 0u32;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let nested = dir.join(format!("nested{}", i % 4));
                    let file = dir.join(format!("churn{}.ed", i % 16));
                    let _ = std::fs::create_dir_all(&nested);
                    let _ = std::fs::write(nested.join("x"), b"abc");
                    let _ = std::fs::write(&file, b"abc");
                    let _ = std::fs::remove_file(&file);
                    let _ = std::fs::remove_dir_all(&nested);
                    i = i.wrapping_add(1);
                }
            }
        });

        for _ in 0..500 {
            let used = acct.current_usage().unwrap();
            assert!(used >= 64);
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        churn.join().unwrap();
    }
}
