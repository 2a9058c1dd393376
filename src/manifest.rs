//! Recovery manifest persistence.
//!
//! Each downloaded item keeps a `.recover` file at its root: a JSON array of
//! [`RecoveryRecord`] describing every file the remote tree offered, whether
//! the filters selected it, its media URL, and its remote file id. The
//! manifest is regenerated wholesale on every download/update pass and is
//! the single source of truth for later reconciliation.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// File name of the manifest inside an item root.
pub const MANIFEST_FILE: &str = ".recover";

/// One manifest entry, covering a single file of the remote tree.
///
/// Serialized field names are fixed wire format: `path`, `url`,
/// `should_download`, `fileId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Posix-style path relative to the item root.
    pub path: String,
    /// Media download URL for the file.
    pub url: String,
    /// Whether the filter configuration selected this file.
    pub should_download: bool,
    /// Remote file id used by the hash verification endpoint.
    #[serde(rename = "fileId")]
    pub file_id: u64,
}

/// Errors loading or writing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// No manifest exists for the item.
    #[error("no manifest at {path}: run `update` for this item first")]
    Missing {
        /// The path that was probed.
        path: PathBuf,
    },

    /// The manifest exists but cannot be parsed.
    #[error("corrupt manifest at {path}: {source}; run `update` to regenerate it")]
    Corrupt {
        /// The manifest path.
        path: PathBuf,
        /// The JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem error reading or writing the manifest.
    #[error("IO error on manifest {path}: {source}")]
    Io {
        /// The manifest path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Loads the manifest stored under `item_root`.
///
/// # Errors
///
/// Returns [`ManifestError::Missing`] when no `.recover` file exists,
/// [`ManifestError::Corrupt`] when it cannot be parsed, and
/// [`ManifestError::Io`] for other read failures.
pub fn load(item_root: &Path) -> Result<Vec<RecoveryRecord>, ManifestError> {
    let path = item_root.join(MANIFEST_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing { path });
        }
        Err(source) => return Err(ManifestError::Io { path, source }),
    };
    serde_json::from_str(&raw).map_err(|source| ManifestError::Corrupt { path, source })
}

/// Writes `records` as the manifest for `item_root`, atomically.
///
/// The records are serialized with pretty indentation, written to a
/// temporary sibling and renamed into place, so readers never observe a
/// half-written manifest.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] when the temp write or rename fails.
pub fn store(item_root: &Path, records: &[RecoveryRecord]) -> Result<(), ManifestError> {
    let path = item_root.join(MANIFEST_FILE);
    let tmp = item_root.join(format!("{MANIFEST_FILE}.tmp"));

    // Infallible for this type: RecoveryRecord contains no non-string keys.
    let json = serde_json::to_string_pretty(records).map_err(|source| ManifestError::Corrupt {
        path: path.clone(),
        source,
    })?;

    std::fs::write(&tmp, json).map_err(|source| ManifestError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, &path).map_err(|source| ManifestError::Io {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), records = records.len(), "manifest written");
    Ok(())
}
