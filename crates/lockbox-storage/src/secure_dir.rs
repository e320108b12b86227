//! Secure root resolution and on-disk layout
//!
//! ```text
//! <data_dir>/SecureSpace/encryptedData/
//!   <id>.ed            ciphertext chunks, back to back
//!   <id>meta_n.meta    nonce sequence
//!   <id>meta_t.meta    tag sequence
//!   <id>.<ext>         decrypted output
//! ```

use std::path::{Path, PathBuf};

use lockbox_core::{FileIdentifier, StorageError};

/// Subdirectory of the data dir that holds artifacts and metadata
pub const SECURE_SPACE: &str = "SecureSpace/encryptedData";
/// Extension of encrypted artifacts
pub const ENCRYPTED_EXTENSION: &str = "ed";
/// Suffix appended to the identifier for the nonce sequence file
pub const NONCE_FILE_SUFFIX: &str = "meta_n.meta";
/// Suffix appended to the identifier for the tag sequence file
pub const TAG_FILE_SUFFIX: &str = "meta_t.meta";

/// The device-local directory holding encrypted artifacts and their metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureRoot {
    path: PathBuf,
}

impl SecureRoot {
    /// Resolve `<data_dir>/SecureSpace/encryptedData`, creating it on first use.
    pub fn resolve(data_dir: &Path) -> Result<Self, StorageError> {
        let Self { path } = Self::locate(data_dir);
        if !path.is_dir() {
            std::fs::create_dir_all(&path).map_err(|source| {
                StorageError::UnableToCreateSecureDir {
                    path: path.clone(),
                    source,
                }
            })?;
            restrict_dir(&path).map_err(|source| StorageError::UnableToCreateSecureDir {
                path: path.clone(),
                source,
            })?;
            tracing::info!(path = %path.display(), "created secure root");
        }
        Ok(Self { path })
    }

    /// The root under `data_dir` without touching the filesystem.
    pub fn locate(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SECURE_SPACE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifact_path(&self, id: &FileIdentifier) -> PathBuf {
        self.path.join(format!("{id}.{ENCRYPTED_EXTENSION}"))
    }

    pub fn nonce_path(&self, id: &FileIdentifier) -> PathBuf {
        self.path.join(format!("{id}{NONCE_FILE_SUFFIX}"))
    }

    pub fn tag_path(&self, id: &FileIdentifier) -> PathBuf {
        self.path.join(format!("{id}{TAG_FILE_SUFFIX}"))
    }

    /// Where decrypted output for `id` is written: the artifact path with
    /// `ext` in place of the encrypted extension.
    pub fn decrypted_path(&self, id: &FileIdentifier, ext: &str) -> PathBuf {
        self.path
            .join(format!("{id}.{}", ext.trim_start_matches('.')))
    }

    pub fn artifact_exists(&self, id: &FileIdentifier) -> bool {
        self.artifact_path(id).is_file()
    }

    pub fn decrypted_exists(&self, id: &FileIdentifier, ext: &str) -> bool {
        self.decrypted_path(id, ext).is_file()
    }

    /// Recover the identifier from an artifact file name (`<id>.ed`).
    pub fn identifier_of(path: &Path) -> Option<FileIdentifier> {
        if path.extension()? != ENCRYPTED_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        FileIdentifier::new(stem).ok()
    }
}

/// Extension of the nonce and tag sequence files
const METADATA_EXTENSION: &str = "meta";

/// Validate a caller-supplied output extension.
///
/// A single component only, and never `ed` or `meta`: `<id>.<ext>` must not
/// land on any identifier's artifact or sequence file.
pub fn is_valid_extension(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    !ext.is_empty()
        && !ext.eq_ignore_ascii_case(ENCRYPTED_EXTENSION)
        && !ext.eq_ignore_ascii_case(METADATA_EXTENSION)
        && !ext.contains(['.', '/', '\\', '\0'])
}

/// Restrict a finished artifact to its owner (0600).
pub fn protect_file(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn restrict_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
