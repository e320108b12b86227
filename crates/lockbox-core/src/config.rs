use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 1 MiB plaintext per sealed chunk
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
/// Free space that must remain on the volume after a write (500 MiB)
pub const DEFAULT_MIN_FREE_SPACE: u64 = 500 * 1024 * 1024;
/// Ceiling for everything stored under the secure root (5 GiB)
pub const DEFAULT_MAX_STORAGE: u64 = 5 * 1024 * 1024 * 1024;
/// Artifacts kept by a prune pass
pub const DEFAULT_RETENTION_COUNT: usize = 10;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub app: AppConfig,
    pub storage: StorageConfig,
    pub budget: StorageBudget,
    pub engine: EngineConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Namespace for key store entries (keychain service + account prefix)
    pub app_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Device-local data directory; the secure root lives beneath it.
    /// Defaults to $XDG_DATA_HOME/lockbox or ~/.local/share/lockbox.
    pub data_dir: Option<PathBuf>,
}

/// Process-wide storage limits. Read once at startup and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageBudget {
    /// Plaintext bytes per chunk
    pub chunk_size: u64,
    /// Bytes that must stay free on the volume
    pub min_free_space_reserve: u64,
    /// Maximum bytes stored under the secure root
    pub max_storage_ceiling: u64,
    /// Artifacts kept by `prune`
    pub retention_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent cipher jobs (0 = available parallelism)
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: "io.lockbox".into(),
        }
    }
}

impl Default for StorageBudget {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_free_space_reserve: DEFAULT_MIN_FREE_SPACE,
            max_storage_ceiling: DEFAULT_MAX_STORAGE,
            retention_count: DEFAULT_RETENTION_COUNT,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl StorageBudget {
    /// Reject budgets the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::LockboxError> {
        if self.chunk_size == 0 {
            return Err(crate::LockboxError::Config(
                "budget.chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunk_size > u32::MAX as u64 {
            return Err(crate::LockboxError::Config(format!(
                "budget.chunk_size {} exceeds the per-chunk AEAD limit",
                self.chunk_size
            )));
        }
        Ok(())
    }

    /// Number of chunks a plaintext of `size` bytes is split into.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size)
    }
}

impl EngineConfig {
    /// Effective worker count, resolving 0 to the machine's parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl StorageConfig {
    /// Resolve the data directory: config value > $XDG_DATA_HOME > ~/.local/share
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return expand_tilde(dir);
        }
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".local").join("share")
            })
            .join("lockbox")
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        Err(_) => path.to_path_buf(),
    }
}
