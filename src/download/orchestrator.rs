//! Item download orchestration.
//!
//! The [`DownloadOrchestrator`] drives one batch end to end: it pulls an
//! item's metadata and file tree from the catalog, walks the tree through
//! the [`FilterEngine`](crate::filter::FilterEngine) with directory-level
//! inheritance, persists the recovery manifest, and dispatches the surviving
//! files as independent fetch tasks through the shared
//! `RetryGate(ConcurrencyGovernor(fetch))` pipeline.
//!
//! # Ordering
//!
//! Within one pass the manifest write happens after decision building and
//! before any fetch completion is reported, so the manifest is authoritative
//! even when fetches later fail. Sibling fetches have no ordering guarantee;
//! items in a batch interleave freely under the global governor budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::fetcher::Fetcher;
use super::gate::RetryGate;
use super::governor::ConcurrencyGovernor;
use crate::api::{CatalogClient, FileTreeEntry};
use crate::config::DownloadSettings;
use crate::filter::{EntryKind, FilterEngine};
use crate::ids::SourceId;
use crate::library::{AUDIO_EXTENSIONS, DownloadLedger, Library};
use crate::manifest::{self, RecoveryRecord};

/// Characters not allowed in local path components, each replaced by `_`.
const ILLEGAL_NAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// One flattened, filter-annotated leaf of a remote file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDecision {
    /// Path relative to the item root, built from sanitized titles.
    pub relative_path: PathBuf,
    /// Media download URL.
    pub url: String,
    /// Remote file id for hash verification.
    pub file_id: u64,
    /// Final eligibility: own rule result AND every ancestor directory's.
    pub should_download: bool,
}

impl FileDecision {
    /// True when the decision points at an audio file by extension.
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.relative_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    }

    /// Posix-style rendering of the relative path for the manifest.
    #[must_use]
    pub fn manifest_path(&self) -> String {
        self.relative_path.to_string_lossy().replace('\\', "/")
    }
}

/// Counters shared by every task of one batch.
///
/// Failure messages are collected alongside, so the batch can report them
/// together once all tasks have completed.
#[derive(Debug, Default)]
pub struct BatchStats {
    fetched: AtomicUsize,
    skipped_existing: AtomicUsize,
    filtered: AtomicUsize,
    failed_files: AtomicUsize,
    failed_items: AtomicUsize,
    failures: StdMutex<Vec<String>>,
}

impl BatchStats {
    fn record_failure(&self, message: String) {
        self.failed_files.fetch_add(1, Ordering::SeqCst);
        self.push_failure(message);
    }

    fn record_item_failure(&self, message: String) {
        self.failed_items.fetch_add(1, Ordering::SeqCst);
        self.push_failure(message);
    }

    fn push_failure(&self, message: String) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message);
    }

    /// Snapshots the counters into a plain summary.
    #[must_use]
    pub fn summarize(&self) -> BatchSummary {
        BatchSummary {
            fetched: self.fetched.load(Ordering::SeqCst),
            skipped_existing: self.skipped_existing.load(Ordering::SeqCst),
            filtered: self.filtered.load(Ordering::SeqCst),
            failed_files: self.failed_files.load(Ordering::SeqCst),
            failed_items: self.failed_items.load(Ordering::SeqCst),
            failures: self
                .failures
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Final counts of one `download`/`recover` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Files fetched successfully.
    pub fetched: usize,
    /// Fetches skipped because the destination already existed.
    pub skipped_existing: usize,
    /// Files recorded but excluded by the filter configuration.
    pub filtered: usize,
    /// Files whose fetch failed after retries.
    pub failed_files: usize,
    /// Items that could not be processed at all.
    pub failed_items: usize,
    /// Human-readable failure lines, aggregated across the batch.
    pub failures: Vec<String>,
}

impl BatchSummary {
    /// True when nothing in the batch failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_files == 0 && self.failed_items == 0
    }
}

/// Coordinates filtering, manifest persistence and fetch dispatch.
pub struct DownloadOrchestrator {
    api: Arc<CatalogClient>,
    library: Library,
    filters: Arc<FilterEngine>,
    fetcher: Arc<dyn Fetcher>,
    ledger: Arc<dyn DownloadLedger>,
    governor: Arc<ConcurrencyGovernor>,
    gate: RetryGate,
    replace: bool,
    shutdown: Arc<AtomicBool>,
}

impl DownloadOrchestrator {
    /// Creates an orchestrator.
    ///
    /// The governor and gate built here are the singletons for the
    /// file-fetch operation kind; the catalog client carries its own pair.
    #[must_use]
    pub fn new(
        api: Arc<CatalogClient>,
        library: Library,
        filters: FilterEngine,
        fetcher: Arc<dyn Fetcher>,
        ledger: Arc<dyn DownloadLedger>,
        settings: &DownloadSettings,
    ) -> Self {
        Self {
            api,
            library,
            filters: Arc::new(filters),
            fetcher,
            ledger,
            governor: Arc::new(ConcurrencyGovernor::new(
                settings.concurrency,
                settings.max_rate,
            )),
            gate: RetryGate::new(
                Duration::from_millis(settings.base_delay_ms),
                settings.max_retries,
            ),
            replace: settings.replace,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the flag a signal handler can set to stop issuing new
    /// fetches; in-flight fetches finish or fail normally.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Flattens a remote tree into per-file decisions.
    ///
    /// Depth-first; at each level the files come before the folders, in
    /// catalog order, matching the manifest layout. `ancestors_eligible`
    /// starts true and is ANDed with each directory's own verdict on the way
    /// down.
    #[must_use]
    pub fn build_decisions(&self, tree: &[FileTreeEntry], relaxed: bool) -> Vec<FileDecision> {
        let mut decisions = Vec::new();
        walk(&self.filters, tree, Path::new(""), true, relaxed, &mut decisions);
        decisions
    }

    /// Runs the strict pass, falling back to one relaxed pass when it leaves
    /// no audio file eligible.
    ///
    /// Returns the decisions plus whether the relaxed pass was used.
    #[must_use]
    pub fn select_decisions(
        &self,
        id: SourceId,
        tree: &[FileTreeEntry],
    ) -> (Vec<FileDecision>, bool) {
        let strict = self.build_decisions(tree, false);
        if strict.iter().any(|d| d.should_download && d.is_audio()) {
            return (strict, false);
        }
        warn!(
            %id,
            "strict filters left no audio file; rebuilding with relaxable rules disabled"
        );
        (self.build_decisions(tree, true), true)
    }

    /// Downloads a batch of items.
    ///
    /// Items are processed concurrently; their fetch tasks share the global
    /// governor budget. Individual failures never abort the batch; they are
    /// aggregated in the returned summary.
    #[instrument(skip(self, ids), fields(items = ids.len()))]
    pub async fn download(&self, ids: &[SourceId]) -> BatchSummary {
        let stats = Arc::new(BatchStats::default());
        let items = ids.iter().map(|id| self.download_one(*id, &stats));
        futures_util::future::join_all(items).await;

        let summary = stats.summarize();
        info!(
            fetched = summary.fetched,
            skipped = summary.skipped_existing,
            filtered = summary.filtered,
            failed_files = summary.failed_files,
            failed_items = summary.failed_items,
            "batch complete"
        );
        summary
    }

    /// Regenerates the metadata snapshot and manifest of each item without
    /// fetching anything.
    ///
    /// This is the repair path for a missing or corrupt manifest.
    #[instrument(skip(self, ids), fields(items = ids.len()))]
    pub async fn update(&self, ids: &[SourceId]) -> BatchSummary {
        let stats = Arc::new(BatchStats::default());
        let items = ids.iter().map(|id| self.update_one(*id, &stats));
        futures_util::future::join_all(items).await;
        stats.summarize()
    }

    /// Re-issues fetches for specific manifest records of one item, through
    /// the same gate/governor pipeline as a fresh download.
    ///
    /// Used by the reconciler's `recover` operation.
    pub async fn fetch_records(
        &self,
        id: SourceId,
        item_root: &Path,
        records: &[RecoveryRecord],
    ) -> BatchSummary {
        let stats = Arc::new(BatchStats::default());
        let mut handles = Vec::new();
        for record in records {
            let decision = FileDecision {
                relative_path: PathBuf::from(&record.path),
                url: record.url.clone(),
                file_id: record.file_id,
                should_download: true,
            };
            self.dispatch_fetch(id, item_root, &decision, &stats, &mut handles);
        }
        join_fetches(handles, &stats).await;
        stats.summarize()
    }

    async fn download_one(&self, id: SourceId, stats: &Arc<BatchStats>) {
        let metadata = match self.api.item_metadata(id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(%id, error = %e, "skipping item");
                stats.record_item_failure(format!("{id}: {e}"));
                return;
            }
        };

        if !self.ledger.record_download_decision(&metadata).await {
            info!(%id, "ledger vetoed download");
            return;
        }

        if metadata.source_name != id.name() {
            warn!(
                %id,
                remote = %metadata.source_name,
                "catalog spells this item differently; using the local name"
            );
        }

        let item_root = self.library.download_root(id);
        if item_root.exists() {
            warn!(path = %item_root.display(), "item root already exists");
        }

        if let Err(e) = self.prepare_item_root(&item_root, &metadata.raw, id) {
            error!(%id, error = %e, "cannot prepare item root");
            stats.record_item_failure(format!("{id}: {e}"));
            return;
        }

        let tree = match self.api.file_tree(id).await {
            Ok(tree) => tree,
            Err(e) => {
                error!(%id, error = %e, "cannot fetch file tree");
                stats.record_item_failure(format!("{id}: {e}"));
                return;
            }
        };

        let (decisions, _relaxed) = self.select_decisions(id, &tree);

        let records = to_records(&decisions);
        if let Err(e) = manifest::store(&item_root, &records) {
            error!(%id, error = %e, "cannot write manifest");
            stats.record_item_failure(format!("{id}: {e}"));
            return;
        }

        let mut handles = Vec::new();
        for decision in &decisions {
            if !decision.should_download {
                debug!(path = %decision.relative_path.display(), "filtered");
                stats.filtered.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                warn!(%id, "interrupted; not issuing further fetches");
                break;
            }
            self.dispatch_fetch(id, &item_root, decision, stats, &mut handles);
        }
        join_fetches(handles, stats).await;
    }

    async fn update_one(&self, id: SourceId, stats: &Arc<BatchStats>) {
        let metadata = match self.api.item_metadata(id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(%id, error = %e, "cannot update item");
                stats.record_item_failure(format!("{id}: {e}"));
                return;
            }
        };

        let item_root = self.library.item_root(id).unwrap_or_else(|| {
            warn!(%id, "no local files for this item; regenerating under the download location");
            self.library.download_root(id)
        });

        let result = async {
            self.prepare_item_root(&item_root, &metadata.raw, id)?;
            let tree = self.api.file_tree(id).await.map_err(io_shim)?;
            let (decisions, _relaxed) = self.select_decisions(id, &tree);
            manifest::store(&item_root, &to_records(&decisions)).map_err(io_shim)?;
            info!(%id, path = %item_root.display(), "manifest regenerated");
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            error!(%id, error = %e, "update failed");
            stats.record_item_failure(format!("{id}: {e}"));
        }
    }

    /// Creates the item root and rewrites the metadata snapshot.
    fn prepare_item_root(
        &self,
        item_root: &Path,
        raw_metadata: &serde_json::Value,
        id: SourceId,
    ) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(item_root)?;
        let snapshot_path = item_root.join(format!("{}.json", id.name()));
        let pretty = serde_json::to_string_pretty(raw_metadata)?;
        std::fs::write(&snapshot_path, pretty)?;
        debug!(path = %snapshot_path.display(), "metadata snapshot written");
        Ok(())
    }

    /// Resolves conflicts, then spawns one guarded fetch task.
    fn dispatch_fetch(
        &self,
        id: SourceId,
        item_root: &Path,
        decision: &FileDecision,
        stats: &Arc<BatchStats>,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        let dest_path = item_root.join(&decision.relative_path);
        let qualified = Path::new(&id.name()).join(&decision.relative_path);

        let presence = self.library.exists(&qualified);
        if presence.download && self.replace {
            info!(path = %dest_path.display(), "replace requested, deleting existing file");
            if let Err(e) = std::fs::remove_file(&dest_path) {
                warn!(path = %dest_path.display(), error = %e, "cannot delete, skipping fetch");
                stats.record_failure(format!("{}: {e}", dest_path.display()));
                return;
            }
        } else if presence.anywhere() {
            warn!(
                path = %decision.relative_path.display(),
                "already present locally, skipping"
            );
            stats.skipped_existing.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let Some(parent) = dest_path.parent() else {
            stats.record_failure(format!("{}: no parent directory", dest_path.display()));
            return;
        };
        if let Err(e) = std::fs::create_dir_all(parent) {
            stats.record_failure(format!("{}: {e}", parent.display()));
            return;
        }

        let Some(file_name) = decision
            .relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
        else {
            stats.record_failure(format!("{}: no file name", dest_path.display()));
            return;
        };

        let fetcher = Arc::clone(&self.fetcher);
        let governor = Arc::clone(&self.governor);
        let gate = self.gate.clone();
        let stats = Arc::clone(stats);
        let url = decision.url.clone();
        let dest_dir = parent.to_path_buf();
        let display_path = decision.relative_path.clone();

        handles.push(tokio::spawn(async move {
            debug!(path = %display_path.display(), "fetching");
            let result = gate
                .run(|| governor.run(fetcher.fetch(&url, &dest_dir, &file_name)))
                .await;
            match result {
                Ok(()) => {
                    stats.fetched.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(path = %display_path.display(), error = %e, "fetch failed");
                    stats.record_failure(format!("{}: {e}", display_path.display()));
                }
            }
        }));
    }
}

/// Awaits all fetch handles; a panicked task counts as a failure.
async fn join_fetches(handles: Vec<JoinHandle<()>>, stats: &Arc<BatchStats>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "fetch task panicked");
            stats.record_failure(format!("fetch task panicked: {e}"));
        }
    }
}

/// Recursive walk carrying the inherited eligibility flag.
fn walk(
    filters: &FilterEngine,
    entries: &[FileTreeEntry],
    base: &Path,
    ancestors_eligible: bool,
    relaxed: bool,
    out: &mut Vec<FileDecision>,
) {
    for entry in entries {
        if let FileTreeEntry::File {
            title,
            media_url,
            remote_file_id,
        } = entry
        {
            let eligible =
                ancestors_eligible && filters.decide(title, EntryKind::File, relaxed);
            out.push(FileDecision {
                relative_path: base.join(sanitize_component(title)),
                url: media_url.clone(),
                file_id: *remote_file_id,
                should_download: eligible,
            });
        }
    }
    for entry in entries {
        if let FileTreeEntry::Folder { title, children } = entry {
            let eligible =
                ancestors_eligible && filters.decide(title, EntryKind::Directory, relaxed);
            walk(
                filters,
                children,
                &base.join(sanitize_component(title)),
                eligible,
                relaxed,
                out,
            );
        }
    }
}

/// Replaces characters that cannot appear in a path component.
#[must_use]
pub fn sanitize_component(title: &str) -> String {
    title
        .chars()
        .map(|c| if ILLEGAL_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Converts decisions into their manifest records, preserving order.
fn to_records(decisions: &[FileDecision]) -> Vec<RecoveryRecord> {
    decisions
        .iter()
        .map(|d| RecoveryRecord {
            path: d.manifest_path(),
            url: d.url.clone(),
            should_download: d.should_download,
            file_id: d.file_id,
        })
        .collect()
}

/// Wraps non-IO errors for the update pipeline's single error channel.
fn io_shim<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::filter::{FilterMode, FilterRule, FilterScope};

    fn file(title: &str, id: u64) -> FileTreeEntry {
        FileTreeEntry::File {
            title: title.to_string(),
            media_url: format!("https://cdn.example.com/{id}"),
            remote_file_id: id,
        }
    }

    fn folder(title: &str, children: Vec<FileTreeEntry>) -> FileTreeEntry {
        FileTreeEntry::Folder {
            title: title.to_string(),
            children,
        }
    }

    fn rule(pattern: &str, scope: FilterScope, relaxable: bool) -> FilterRule {
        FilterRule {
            pattern: pattern.to_string(),
            mode: FilterMode::Exclude,
            scope,
            exact_match: false,
            ignore_case: false,
            relaxable_on_empty: relaxable,
        }
    }

    fn engine(rules: &[FilterRule]) -> FilterEngine {
        FilterEngine::new(rules).unwrap()
    }

    fn decisions_for(
        filters: FilterEngine,
        tree: &[FileTreeEntry],
        relaxed: bool,
    ) -> Vec<FileDecision> {
        let mut out = Vec::new();
        walk(&filters, tree, Path::new(""), true, relaxed, &mut out);
        out
    }

    #[test]
    fn test_wav_excluded_mp3_kept() {
        let tree = vec![folder("v1", vec![file("a.wav", 1), file("a.mp3", 2)])];
        let filters = engine(&[rule(r"\.wav$", FilterScope::File, false)]);
        let decisions = decisions_for(filters, &tree, false);

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].relative_path, PathBuf::from("v1/a.wav"));
        assert!(!decisions[0].should_download);
        assert_eq!(decisions[1].relative_path, PathBuf::from("v1/a.mp3"));
        assert!(decisions[1].should_download);
    }

    #[test]
    fn test_directory_veto_gates_descendants() {
        let tree = vec![folder(
            "sfx",
            vec![file("a.mp3", 1), folder("inner", vec![file("b.mp3", 2)])],
        )];
        let filters = engine(&[rule("sfx", FilterScope::Directory, false)]);
        let decisions = decisions_for(filters, &tree, false);

        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| !d.should_download));
    }

    #[test]
    fn test_files_recorded_before_folders_per_level() {
        let tree = vec![
            folder("z", vec![file("inner.mp3", 1)]),
            file("top.mp3", 2),
        ];
        let filters = FilterEngine::permissive();
        let decisions = decisions_for(filters, &tree, false);

        assert_eq!(decisions[0].relative_path, PathBuf::from("top.mp3"));
        assert_eq!(decisions[1].relative_path, PathBuf::from("z/inner.mp3"));
    }

    #[test]
    fn test_walk_is_deterministic() {
        let tree = vec![
            folder("v1", vec![file("a.wav", 1), file("a.mp3", 2)]),
            file("cover.jpg", 3),
        ];
        let filters = engine(&[rule(r"\.wav$", FilterScope::File, false)]);
        let first = decisions_for(filters, &tree, false);
        let filters = engine(&[rule(r"\.wav$", FilterScope::File, false)]);
        let second = decisions_for(filters, &tree, false);
        assert_eq!(first, second);
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_component("台本&SE"), "台本&SE");
        assert_eq!(sanitize_component(r#"bad"name?"#), "bad_name_");
    }

    #[test]
    fn test_relaxed_pass_reenables_relaxable_rule() {
        let tree = vec![folder("简体", vec![file("a.mp3", 1)])];
        let filters = engine(&[rule("简体", FilterScope::Directory, true)]);

        let strict = decisions_for(filters, &tree, false);
        assert!(strict.iter().all(|d| !d.should_download));

        let filters = engine(&[rule("简体", FilterScope::Directory, true)]);
        let relaxed = decisions_for(filters, &tree, true);
        assert!(relaxed.iter().all(|d| d.should_download));
    }

    #[test]
    fn test_is_audio_by_extension() {
        let audio = FileDecision {
            relative_path: PathBuf::from("v1/a.FLAC"),
            url: String::new(),
            file_id: 1,
            should_download: true,
        };
        assert!(audio.is_audio());

        let image = FileDecision {
            relative_path: PathBuf::from("cover.jpg"),
            url: String::new(),
            file_id: 2,
            should_download: true,
        };
        assert!(!image.is_audio());
    }

    #[test]
    fn test_manifest_records_preserve_order_and_paths() {
        let tree = vec![folder("v1", vec![file("a.wav", 1), file("a.mp3", 2)])];
        let filters = engine(&[rule(r"\.wav$", FilterScope::File, false)]);
        let decisions = decisions_for(filters, &tree, false);
        let records = to_records(&decisions);

        assert_eq!(records[0].path, "v1/a.wav");
        assert!(!records[0].should_download);
        assert_eq!(records[1].path, "v1/a.mp3");
        assert!(records[1].should_download);
        assert_eq!(records[1].file_id, 2);
    }
}
