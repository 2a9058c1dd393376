//! Integration tests for the download orchestrator against a mock catalog.
//!
//! These tests exercise the full pass: login, metadata, file tree, filter
//! decisions, manifest persistence and streaming fetches into a temp
//! library.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use workdl_core::config::DownloadSettings;
use workdl_core::{
    CatalogClient, DownloadOrchestrator, FilterEngine, FilterMode, FilterRule, FilterScope,
    HttpFetcher, Library, PermissiveLedger, SourceId,
};

const ID: u64 = 123_456;

fn settings() -> DownloadSettings {
    DownloadSettings {
        concurrency: 2,
        max_rate: 100.0,
        max_retries: 1,
        base_delay_ms: 1,
        ..DownloadSettings::default()
    }
}

fn rule(pattern: &str, scope: FilterScope, relaxable: bool) -> FilterRule {
    FilterRule {
        pattern: pattern.to_string(),
        mode: FilterMode::Exclude,
        scope,
        exact_match: false,
        ignore_case: true,
        relaxable_on_empty: relaxable,
    }
}

struct Harness {
    server: MockServer,
    _tmp: TempDir,
    library: Library,
    api: Arc<CatalogClient>,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let tmp = TempDir::new().expect("temp dir");
        let library = Library::new(tmp.path().join("download"), tmp.path().join("storage"));

        Mock::given(method("POST"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "test-token"
            })))
            .mount(&server)
            .await;

        let api = Arc::new(
            CatalogClient::builder(format!("{}/api/", server.uri()))
                .credentials("user", "pass")
                .retries(Duration::from_millis(1), 1)
                .build()
                .expect("client"),
        );
        api.login().await.expect("login");

        Self {
            server,
            _tmp: tmp,
            library,
            api,
        }
    }

    async fn mount_metadata(&self) {
        Mock::given(method("GET"))
            .and(path(format!("/api/work/{ID}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": ID,
                "source_id": "RJ123456",
                "title": "sample work"
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_tree(&self, tree: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/tracks/{ID}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(tree))
            .mount(&self.server)
            .await;
    }

    async fn mount_media(&self, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.as_bytes().to_vec()))
            .mount(&self.server)
            .await;
    }

    fn media_url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    fn orchestrator(&self, rules: &[FilterRule]) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            Arc::clone(&self.api),
            self.library.clone(),
            FilterEngine::new(rules).expect("filters"),
            Arc::new(HttpFetcher::new(None).expect("fetcher")),
            Arc::new(PermissiveLedger),
            &settings(),
        )
    }

    fn item_file(&self, rel: &str) -> std::path::PathBuf {
        self.library.download_path().join("RJ123456").join(rel)
    }
}

#[tokio::test]
async fn test_download_writes_files_manifest_and_snapshot() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {
                "type": "folder",
                "title": "v1",
                "children": [
                    {"type": "file", "title": "a.mp3", "mediaUrl": harness.media_url("/media/a.mp3"), "remoteFileId": 11},
                    {"type": "file", "title": "a.wav", "mediaUrl": harness.media_url("/media/a.wav"), "remoteFileId": 12}
                ]
            }
        ]))
        .await;
    harness.mount_media("/media/a.mp3", "mp3-bytes").await;

    let orchestrator = harness.orchestrator(&[rule(r"\.wav$", FilterScope::File, false)]);
    let summary = orchestrator.download(&[SourceId(ID)]).await;

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.failed_files, 0);
    assert_eq!(summary.failed_items, 0);

    // Fetched file landed, with no .part residue.
    let audio = harness.item_file("v1/a.mp3");
    assert_eq!(std::fs::read_to_string(&audio).unwrap(), "mp3-bytes");
    assert!(!harness.item_file("v1/a.mp3.part").exists());
    // The filtered file was recorded, not fetched.
    assert!(!harness.item_file("v1/a.wav").exists());

    // Manifest reflects both decisions with wire field names.
    let manifest_raw =
        std::fs::read_to_string(harness.item_file(".recover")).expect("manifest exists");
    let manifest: serde_json::Value = serde_json::from_str(&manifest_raw).unwrap();
    let records = manifest.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["path"], "v1/a.mp3");
    assert_eq!(records[0]["should_download"], true);
    assert_eq!(records[1]["path"], "v1/a.wav");
    assert_eq!(records[1]["should_download"], false);
    assert_eq!(records[1]["fileId"], 12);

    // Metadata snapshot was written.
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(harness.item_file("RJ123456.json")).unwrap())
            .unwrap();
    assert_eq!(snapshot["title"], "sample work");
}

#[tokio::test]
async fn test_repeat_download_skips_existing_files() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {"type": "file", "title": "b.mp3", "mediaUrl": harness.media_url("/media/b.mp3"), "remoteFileId": 21}
        ]))
        .await;
    harness.mount_media("/media/b.mp3", "bytes").await;

    let orchestrator = harness.orchestrator(&[]);
    let first = orchestrator.download(&[SourceId(ID)]).await;
    assert_eq!(first.fetched, 1);

    let second = orchestrator.download(&[SourceId(ID)]).await;
    assert_eq!(second.fetched, 0);
    assert_eq!(second.skipped_existing, 1);
    assert!(second.is_clean());
}

#[tokio::test]
async fn test_strict_pass_empty_triggers_relaxed_fetch() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {
                "type": "folder",
                "title": "简体",
                "children": [
                    {"type": "file", "title": "only.mp3", "mediaUrl": harness.media_url("/media/only.mp3"), "remoteFileId": 31}
                ]
            }
        ]))
        .await;
    harness.mount_media("/media/only.mp3", "bytes").await;

    // The only audio lives under an excluded-but-relaxable folder.
    let orchestrator = harness.orchestrator(&[rule("简体", FilterScope::Directory, true)]);
    let summary = orchestrator.download(&[SourceId(ID)]).await;

    assert_eq!(summary.fetched, 1);
    assert!(harness.item_file("简体/only.mp3").exists());

    // The manifest reflects the relaxed pass.
    let manifest_raw = std::fs::read_to_string(harness.item_file(".recover")).unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&manifest_raw).unwrap();
    assert_eq!(manifest[0]["should_download"], true);
}

#[tokio::test]
async fn test_non_relaxable_rules_survive_relaxed_pass() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {"type": "file", "title": "drop.txt", "mediaUrl": harness.media_url("/media/drop.txt"), "remoteFileId": 41}
        ]))
        .await;

    // No audio at all: the relaxed pass runs, but the txt rule is not
    // relaxable and still vetoes. Terminates after the second pass.
    let orchestrator = harness.orchestrator(&[rule(r"\.txt$", FilterScope::File, false)]);
    let summary = orchestrator.download(&[SourceId(ID)]).await;

    assert_eq!(summary.fetched, 0);
    assert_eq!(summary.filtered, 1);
    assert!(summary.is_clean());
}

#[tokio::test]
async fn test_missing_tracks_fails_item_only() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!({"error": "no tracks found"}))
        .await;

    let orchestrator = harness.orchestrator(&[]);
    let summary = orchestrator.download(&[SourceId(ID)]).await;

    assert_eq!(summary.failed_items, 1);
    assert_eq!(summary.fetched, 0);
    assert_eq!(summary.failures.len(), 1);
    // The manifest is not written for a tree we never saw.
    assert!(!harness.item_file(".recover").exists());
}

#[tokio::test]
async fn test_fetch_failure_is_aggregated_not_fatal() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {"type": "file", "title": "ok.mp3", "mediaUrl": harness.media_url("/media/ok.mp3"), "remoteFileId": 51},
            {"type": "file", "title": "gone.mp3", "mediaUrl": harness.media_url("/media/gone.mp3"), "remoteFileId": 52}
        ]))
        .await;
    harness.mount_media("/media/ok.mp3", "bytes").await;
    Mock::given(method("GET"))
        .and(path("/media/gone.mp3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&harness.server)
        .await;

    let orchestrator = harness.orchestrator(&[]);
    let summary = orchestrator.download(&[SourceId(ID)]).await;

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.failed_files, 1);
    assert_eq!(summary.failures.len(), 1);
    // The manifest still covers both files.
    let manifest_raw = std::fs::read_to_string(harness.item_file(".recover")).unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&manifest_raw).unwrap();
    assert_eq!(manifest.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_update_regenerates_manifest_without_fetching() {
    let harness = Harness::new().await;
    harness.mount_metadata().await;
    harness
        .mount_tree(serde_json::json!([
            {"type": "file", "title": "c.mp3", "mediaUrl": harness.media_url("/media/c.mp3"), "remoteFileId": 61}
        ]))
        .await;

    let orchestrator = harness.orchestrator(&[]);
    let summary = orchestrator.update(&[SourceId(ID)]).await;

    assert!(summary.is_clean());
    assert!(harness.item_file(".recover").exists());
    assert!(harness.item_file("RJ123456.json").exists());
    // No fetch happened.
    assert!(!harness.item_file("c.mp3").exists());
    assert_eq!(summary.fetched, 0);
}
