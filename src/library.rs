//! Local library layout.
//!
//! Items live in two places: the *download* location holds in-progress
//! items, the *storage* location holds archived ones. Every reconciliation
//! and existence question is answered over the merged view of both, so an
//! item half-moved to storage still reads as one item.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::api::ItemMetadata;
use crate::ids::SourceId;

/// Audio container formats considered interchangeable variants of a track.
pub const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "wav", "flac", "m4a"];

/// Lyrics formats considered interchangeable variants of a subtitle.
const LYRICS_EXTENSIONS: [&str; 2] = ["lrc", "vtt"];

/// Where an item (or file) was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    /// Present under the download location.
    pub download: bool,
    /// Present under the storage location.
    pub storage: bool,
}

impl Presence {
    /// True when the path exists in either location.
    #[must_use]
    pub fn anywhere(&self) -> bool {
        self.download || self.storage
    }
}

/// Tag-filter gate consulted before an item is downloaded.
///
/// The production implementation lives with the relational catalog; the
/// default [`PermissiveLedger`] admits everything, which is also what tests
/// want.
#[async_trait]
pub trait DownloadLedger: Send + Sync {
    /// Returns false to veto the download of an item based on its metadata.
    async fn record_download_decision(&self, metadata: &ItemMetadata) -> bool;
}

/// Ledger that admits every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveLedger;

#[async_trait]
impl DownloadLedger for PermissiveLedger {
    async fn record_download_decision(&self, _metadata: &ItemMetadata) -> bool {
        true
    }
}

/// Merged view over the download and storage locations.
#[derive(Debug, Clone)]
pub struct Library {
    download_path: PathBuf,
    storage_path: PathBuf,
}

impl Library {
    /// Creates a library over the two locations.
    #[must_use]
    pub fn new(download_path: impl Into<PathBuf>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            download_path: download_path.into(),
            storage_path: storage_path.into(),
        }
    }

    /// The download location root.
    #[must_use]
    pub fn download_path(&self) -> &Path {
        &self.download_path
    }

    /// The storage location root.
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// The item root under the download location (whether or not it exists).
    #[must_use]
    pub fn download_root(&self, id: SourceId) -> PathBuf {
        self.download_path.join(id.name())
    }

    /// Resolves the item root, probing download first, then storage.
    #[must_use]
    pub fn item_root(&self, id: SourceId) -> Option<PathBuf> {
        let name = id.name();
        for base in [&self.download_path, &self.storage_path] {
            let root = base.join(&name);
            if root.is_dir() {
                return Some(root);
            }
        }
        None
    }

    /// Lists every source-named item across both locations, deduplicated
    /// and sorted.
    #[must_use]
    pub fn list_items(&self) -> Vec<SourceId> {
        let mut ids = BTreeSet::new();
        for base in [&self.download_path, &self.storage_path] {
            let Ok(entries) = std::fs::read_dir(base) else {
                continue;
            };
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name();
                match name.to_string_lossy().parse::<SourceId>() {
                    Ok(id) => {
                        ids.insert(id);
                    }
                    Err(_) => {
                        debug!(name = %name.to_string_lossy(), "ignoring non-item directory");
                    }
                }
            }
        }
        ids.into_iter().collect()
    }

    /// Returns every file of the item, as relative paths merged from both
    /// locations, sorted.
    #[must_use]
    pub fn all_files(&self, id: SourceId) -> BTreeSet<PathBuf> {
        let name = id.name();
        let mut files = BTreeSet::new();
        for base in [&self.download_path, &self.storage_path] {
            let root = base.join(&name);
            collect_files(&root, &root, &mut files);
        }
        files
    }

    /// Checks whether `rel_path` (item-name-qualified, e.g.
    /// `RJ123456/v1/a.mp3`) exists in either location, directly or as an
    /// interchangeable variant (§ same-stem audio or lyrics formats).
    #[must_use]
    pub fn exists(&self, rel_path: &Path) -> Presence {
        let download_file = self.download_path.join(rel_path);
        let storage_file = self.storage_path.join(rel_path);

        let mut presence = Presence {
            download: download_file.exists(),
            storage: storage_file.exists(),
        };

        if !presence.download && variant_exists(&download_file) {
            presence.download = true;
        }
        if !presence.storage && variant_exists(&storage_file) {
            presence.storage = true;
        }
        presence
    }
}

/// Recursively collects relative file paths under `dir`.
fn collect_files(root: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.insert(rel.to_path_buf());
        }
    }
}

/// True when a same-stem audio or lyrics variant of `path` exists.
///
/// A `.wav` archived as `.flac` should not be fetched again, and neither
/// should an `.lrc` that exists as `.vtt`.
fn variant_exists(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();

    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        for alt in AUDIO_EXTENSIONS {
            if alt == ext {
                continue;
            }
            if path.with_extension(alt).exists() {
                warn!(
                    path = %path.display(),
                    variant = alt,
                    "same-stem audio variant already present"
                );
                return true;
            }
        }
    }

    if LYRICS_EXTENSIONS.contains(&ext.as_str()) {
        for alt in LYRICS_EXTENSIONS {
            if alt == ext {
                continue;
            }
            if path.with_extension(alt).exists() {
                debug!(path = %path.display(), variant = alt, "same-stem lyrics variant present");
                return true;
            }
        }
    }

    false
}
