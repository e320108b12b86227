//! Nonce and tag sequence persistence.
//!
//! Each sequence is stored as a small JSON document next to its artifact:
//! ```json
//! {"version":1,"entries":["<base64>", "<base64>", ...]}
//! ```
//! Entry `i` belongs to ciphertext chunk `i`. Writes go through a hidden temp
//! file and a rename so a crash never leaves a half-written sequence behind.

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use lockbox_core::MetadataError;
use serde::{Deserialize, Serialize};

/// Current on-disk format version
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SequenceFile {
    version: u32,
    entries: Vec<String>,
}

/// Persist `entries` at `path`, replacing any previous sequence atomically.
pub fn write_sequence(path: &Path, entries: &[Vec<u8>]) -> Result<(), MetadataError> {
    let write_err = |reason: String| MetadataError::Write {
        path: path.to_path_buf(),
        reason,
    };

    let doc = SequenceFile {
        version: METADATA_VERSION,
        entries: entries.iter().map(|e| B64.encode(e)).collect(),
    };
    let json = serde_json::to_vec(&doc).map_err(|e| write_err(format!("serialize: {e}")))?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| write_err("path has no file name".into()))?;
    let tmp = path.with_file_name(format!(".{name}.tmp"));

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        crate::secure_dir::protect_file(&tmp)?;
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_err(e.to_string()));
    }

    tracing::debug!(path = %path.display(), entries = entries.len(), "wrote metadata sequence");
    Ok(())
}

/// Load the sequence stored at `path`.
///
/// A missing file and one that no longer decodes are both reported as
/// `NotFound`: either way the artifact cannot be decrypted. An unknown
/// format version is `Corrupt`.
pub fn read_sequence(path: &Path) -> Result<Vec<Vec<u8>>, MetadataError> {
    let not_found = |reason: String| MetadataError::NotFound {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| not_found(e.to_string()))?;
    let doc: SequenceFile =
        serde_json::from_slice(&bytes).map_err(|e| not_found(format!("unreadable: {e}")))?;

    if doc.version != METADATA_VERSION {
        return Err(MetadataError::Corrupt(format!(
            "unsupported metadata version {} in {}",
            doc.version,
            path.display()
        )));
    }

    doc.entries
        .iter()
        .enumerate()
        .map(|(i, s)| {
            B64.decode(s)
                .map_err(|e| not_found(format!("entry {i} is not base64: {e}")))
        })
        .collect()
}

/// Remove a sequence file; a missing file is not an error.
pub fn remove_sequence(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
