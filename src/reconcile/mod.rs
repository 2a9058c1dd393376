//! Manifest-driven reconciliation: diff, check, recover, verify.
//!
//! Every operation here reads an item's recovery manifest (never writes it)
//! and compares it to the merged local file set. `diff` classifies each
//! path, `check` sweeps the whole library for items with missing wanted
//! files, `recover` re-issues exactly the missing fetches through the same
//! dispatch pipeline as a fresh download, and `verify` confirms local file
//! content against the catalog's hash records.

mod render;

pub use render::render_diff_tree;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use xxhash_rust::xxh3::xxh3_128;

use crate::api::{ApiError, CatalogClient};
use crate::download::{BatchSummary, DownloadOrchestrator};
use crate::ids::SourceId;
use crate::library::Library;
use crate::manifest::{self, ManifestError, RecoveryRecord, MANIFEST_FILE};

/// Errors from reconciliation operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The item has no local directory in either location.
    #[error("item {id} does not exist locally")]
    ItemNotFound {
        /// The missing item.
        id: SourceId,
    },

    /// The manifest is missing or unreadable.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The `--regex` path scope does not compile.
    #[error("invalid path pattern `{pattern}`: {source}")]
    BadPattern {
        /// The rejected pattern.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },

    /// A catalog call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Local file could not be read for hashing.
    #[error("cannot read {path}: {source}")]
    Io {
        /// The unreadable file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Classification of one path in a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffState {
    /// Manifest wants it, file present.
    InSync,
    /// Manifest skips it, but the file exists; likely a stale download
    /// predating a rule change.
    FilteredPresent,
    /// Manifest wants it, file absent.
    MissingWanted,
    /// Present locally, unknown to the manifest; user-added content.
    Added,
    /// Manifest skips it and it is absent, as expected.
    FilteredAbsent,
}

/// One classified path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    /// Path relative to the item root.
    pub path: PathBuf,
    /// Which partition the path falls into.
    pub state: DiffState,
}

/// Full diff of one item.
#[derive(Debug, Clone)]
pub struct DiffReport {
    /// The diffed item.
    pub id: SourceId,
    /// All classified paths, sorted by path.
    pub entries: Vec<DiffEntry>,
}

impl DiffReport {
    /// Paths the manifest wants but the library lacks.
    #[must_use]
    pub fn missing_wanted(&self) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|e| e.state == DiffState::MissingWanted)
            .map(|e| e.path.as_path())
            .collect()
    }
}

/// Outcome of `check` for one item.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Manifest loaded and nothing wanted is missing.
    Ok,
    /// Wanted files are missing.
    Incomplete {
        /// How many wanted files are absent.
        missing: usize,
    },
    /// The manifest could not be loaded at all.
    Unreadable {
        /// Why loading failed.
        reason: String,
    },
}

/// Library-wide check report.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Per-item outcomes, in id order.
    pub items: Vec<(SourceId, CheckOutcome)>,
}

impl CheckReport {
    /// Ids of items that need attention.
    #[must_use]
    pub fn failing_ids(&self) -> Vec<SourceId> {
        self.items
            .iter()
            .filter(|(_, outcome)| !matches!(outcome, CheckOutcome::Ok))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Per-file verification verdicts.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Files the catalog confirmed.
    pub verified: usize,
    /// Files whose content hash the catalog rejected.
    pub mismatched: Vec<(u64, PathBuf)>,
    /// Files that could not be verified (read or API failure), with reason.
    pub errors: Vec<(u64, PathBuf, String)>,
    /// Manifest entries with no local file to hash.
    pub skipped_missing: usize,
}

/// Scope options for [`Reconciler::recover`].
#[derive(Debug, Clone, Default)]
pub struct RecoverOptions {
    /// Only recover paths matching this pattern.
    pub path_pattern: Option<String>,
    /// Also recover files the filters excluded.
    pub include_filtered: bool,
}

/// Read-side reconciliation over the library and manifests.
pub struct Reconciler {
    library: Library,
    api: Arc<CatalogClient>,
}

impl Reconciler {
    /// Creates a reconciler over the library, talking to `api` for verify.
    #[must_use]
    pub fn new(library: Library, api: Arc<CatalogClient>) -> Self {
        Self { library, api }
    }

    /// Diffs one item's manifest against its local files.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::ItemNotFound`] when the item has no local root;
    /// manifest errors are surfaced with a regeneration hint.
    #[instrument(skip(self), fields(id = %id))]
    pub fn diff(&self, id: SourceId) -> Result<DiffReport, ReconcileError> {
        let item_root = self
            .library
            .item_root(id)
            .ok_or(ReconcileError::ItemNotFound { id })?;
        let records = manifest::load(&item_root)?;
        let local = self.content_files(id);
        Ok(DiffReport {
            id,
            entries: partition(&records, &local),
        })
    }

    /// Checks items for missing wanted files.
    ///
    /// With an empty `ids`, every locally-known item is checked. An item
    /// whose manifest cannot be loaded is reported as failing rather than
    /// erroring the sweep.
    #[instrument(skip(self, ids))]
    pub fn check(&self, ids: &[SourceId]) -> CheckReport {
        let ids: Vec<SourceId> = if ids.is_empty() {
            self.library.list_items()
        } else {
            ids.to_vec()
        };

        let mut report = CheckReport::default();
        for id in ids {
            let outcome = match self.diff(id) {
                Ok(diff) => {
                    let missing = diff.missing_wanted().len();
                    if missing == 0 {
                        CheckOutcome::Ok
                    } else {
                        warn!(%id, missing, "item is missing wanted files");
                        CheckOutcome::Incomplete { missing }
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "item failed check");
                    CheckOutcome::Unreadable {
                        reason: e.to_string(),
                    }
                }
            };
            report.items.push((id, outcome));
        }
        report
    }

    /// Re-fetches missing files of one item via `orchestrator`.
    ///
    /// Only files that are absent locally are considered; filtered records
    /// need `include_filtered`, and `path_pattern` narrows by path.
    ///
    /// # Errors
    ///
    /// Manifest and pattern errors; fetch failures land in the returned
    /// summary instead.
    #[instrument(skip(self, orchestrator), fields(id = %id))]
    pub async fn recover(
        &self,
        orchestrator: &DownloadOrchestrator,
        id: SourceId,
        options: &RecoverOptions,
    ) -> Result<BatchSummary, ReconcileError> {
        let item_root = self
            .library
            .item_root(id)
            .ok_or(ReconcileError::ItemNotFound { id })?;
        let records = manifest::load(&item_root)?;

        let pattern = options
            .path_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| ReconcileError::BadPattern {
                pattern: options.path_pattern.clone().unwrap_or_default(),
                source,
            })?;

        let mut targets: Vec<RecoveryRecord> = Vec::new();
        for record in records {
            if item_root.join(&record.path).exists() {
                continue;
            }
            if let Some(pattern) = &pattern {
                if !pattern.is_match(&record.path) {
                    continue;
                }
            }
            if !record.should_download {
                if options.include_filtered {
                    warn!(path = %record.path, "recovering filtered file on request");
                } else {
                    info!(path = %record.path, "filtered out, not recovering");
                    continue;
                }
            }
            targets.push(record);
        }

        info!(%id, files = targets.len(), "recovering");
        Ok(orchestrator.fetch_records(id, &item_root, &targets).await)
    }

    /// Verifies local file content against the catalog's hash records.
    ///
    /// Each present manifest file is hashed (XXH3-128, on the blocking
    /// pool) and submitted; a mismatch never aborts the remaining files.
    ///
    /// # Errors
    ///
    /// Manifest errors only; per-file failures land in the report.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn verify(&self, id: SourceId) -> Result<VerifyReport, ReconcileError> {
        let records = {
            let item_root = self
                .library
                .item_root(id)
                .ok_or(ReconcileError::ItemNotFound { id })?;
            manifest::load(&item_root)?
        };

        let name = id.name();
        let mut report = VerifyReport::default();

        let checks = records.iter().map(|record| {
            let qualified = Path::new(&name).join(&record.path);
            async move {
                let local_path = self.resolve_local(&qualified)?;
                let verdict = self.verify_one(record.file_id, &local_path).await;
                Some((record.file_id, local_path, verdict))
            }
        });

        for outcome in futures_util::future::join_all(checks).await {
            match outcome {
                None => report.skipped_missing += 1,
                Some((file_id, path, Ok(true))) => {
                    debug!(file_id, path = %path.display(), "verified");
                    report.verified += 1;
                }
                Some((file_id, path, Ok(false))) => {
                    warn!(file_id, path = %path.display(), "content hash mismatch");
                    report.mismatched.push((file_id, path));
                }
                Some((file_id, path, Err(reason))) => {
                    warn!(file_id, path = %path.display(), error = %reason, "verification failed");
                    report.errors.push((file_id, path, reason));
                }
            }
        }
        Ok(report)
    }

    /// Hashes one file off the scheduler and asks the catalog about it.
    async fn verify_one(&self, file_id: u64, path: &Path) -> Result<bool, String> {
        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || {
            std::fs::read(&owned).map(|bytes| format!("{:032x}", xxh3_128(&bytes)))
        })
        .await
        .map_err(|e| format!("hash task failed: {e}"))?
        .map_err(|e| format!("cannot read file: {e}"))?;

        self.api
            .verify_hash(file_id, &digest)
            .await
            .map_err(|e| e.to_string())
    }

    /// Resolves a name-qualified relative path to whichever location holds
    /// it, download first.
    fn resolve_local(&self, qualified: &Path) -> Option<PathBuf> {
        for base in [self.library.download_path(), self.library.storage_path()] {
            let candidate = base.join(qualified);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Local files that count as item content: bookkeeping artifacts (the
    /// manifest and the metadata snapshot) are not part of the diff.
    fn content_files(&self, id: SourceId) -> BTreeSet<PathBuf> {
        let snapshot = PathBuf::from(format!("{}.json", id.name()));
        let manifest = PathBuf::from(MANIFEST_FILE);
        self.library
            .all_files(id)
            .into_iter()
            .filter(|p| *p != snapshot && *p != manifest)
            .collect()
    }
}

/// Partitions `local ∪ manifest` into the five diff classes.
///
/// The partitions are disjoint and cover the union exactly.
#[must_use]
pub fn partition(records: &[RecoveryRecord], local: &BTreeSet<PathBuf>) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let mut manifest_paths = BTreeSet::new();

    for record in records {
        let path = PathBuf::from(&record.path);
        let present = local.contains(&path);
        let state = match (record.should_download, present) {
            (true, true) => DiffState::InSync,
            (true, false) => DiffState::MissingWanted,
            (false, true) => DiffState::FilteredPresent,
            (false, false) => DiffState::FilteredAbsent,
        };
        manifest_paths.insert(path.clone());
        entries.push(DiffEntry { path, state });
    }

    for path in local {
        if !manifest_paths.contains(path) {
            entries.push(DiffEntry {
                path: path.clone(),
                state: DiffState::Added,
            });
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(path: &str, should: bool, file_id: u64) -> RecoveryRecord {
        RecoveryRecord {
            path: path.to_string(),
            url: format!("https://cdn.example.com/{file_id}"),
            should_download: should,
            file_id,
        }
    }

    fn local(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_partition_covers_all_states() {
        let records = vec![
            record("v1/present.mp3", true, 1),
            record("v1/missing.mp3", true, 2),
            record("v1/stale.wav", false, 3),
            record("v1/skipped.wav", false, 4),
        ];
        let local = local(&["v1/present.mp3", "v1/stale.wav", "v1/mine.txt"]);

        let entries = partition(&records, &local);
        let state_of = |p: &str| {
            entries
                .iter()
                .find(|e| e.path == PathBuf::from(p))
                .map(|e| e.state)
                .unwrap()
        };

        assert_eq!(state_of("v1/present.mp3"), DiffState::InSync);
        assert_eq!(state_of("v1/missing.mp3"), DiffState::MissingWanted);
        assert_eq!(state_of("v1/stale.wav"), DiffState::FilteredPresent);
        assert_eq!(state_of("v1/skipped.wav"), DiffState::FilteredAbsent);
        assert_eq!(state_of("v1/mine.txt"), DiffState::Added);
    }

    #[test]
    fn test_partition_union_equals_inputs() {
        let records = vec![
            record("a.mp3", true, 1),
            record("b.mp3", false, 2),
            record("c.mp3", true, 3),
        ];
        let local = local(&["a.mp3", "d.txt"]);

        let entries = partition(&records, &local);

        let partitioned: BTreeSet<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
        let mut expected: BTreeSet<PathBuf> =
            records.iter().map(|r| PathBuf::from(&r.path)).collect();
        expected.extend(local);
        assert_eq!(partitioned, expected);
        // Disjoint: one entry per path.
        assert_eq!(entries.len(), partitioned.len());
    }

    #[test]
    fn test_partition_is_sorted_by_path() {
        let records = vec![record("z.mp3", true, 1), record("a.mp3", true, 2)];
        let entries = partition(&records, &BTreeSet::new());
        assert_eq!(entries[0].path, PathBuf::from("a.mp3"));
        assert_eq!(entries[1].path, PathBuf::from("z.mp3"));
    }

    #[test]
    fn test_empty_manifest_everything_added() {
        let local = local(&["x.mp3"]);
        let entries = partition(&[], &local);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, DiffState::Added);
    }

    #[test]
    fn test_missing_wanted_accessor() {
        let report = DiffReport {
            id: SourceId(1),
            entries: partition(
                &[record("a.mp3", true, 1), record("b.mp3", false, 2)],
                &BTreeSet::new(),
            ),
        };
        assert_eq!(report.missing_wanted(), vec![Path::new("a.mp3")]);
    }

    #[test]
    fn test_check_report_failing_ids() {
        let report = CheckReport {
            items: vec![
                (SourceId(1), CheckOutcome::Ok),
                (SourceId(2), CheckOutcome::Incomplete { missing: 3 }),
                (
                    SourceId(3),
                    CheckOutcome::Unreadable {
                        reason: "corrupt".to_string(),
                    },
                ),
            ],
        };
        assert_eq!(report.failing_ids(), vec![SourceId(2), SourceId(3)]);
    }
}
