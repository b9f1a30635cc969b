use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use fscrawl::config::{FsConfig, JobConfig, PluginConfig};
use fscrawl::crawler::{Crawler, WATERMARK_MARGIN};
use fscrawl::error::{CrawlError, PipelineError};
use fscrawl::extract::DefaultExtractor;
use fscrawl::ids;
use fscrawl::models::{Document, RoutingContext, RunState};
use fscrawl::pipeline::{Output, Router};
use fscrawl::registry::{BuildContext, PluginRegistry};
use fscrawl::service::memory::Operation;
use fscrawl::service::{DocumentService, InMemoryService};
use fscrawl::source::LocalFileSource;
use fscrawl::state::{InMemoryStateStore, StateStore};
use fscrawl::worker::{CloseSignal, Worker};

fn job(root: &Path, tweak: impl FnOnce(&mut JobConfig)) -> JobConfig {
    let mut job = JobConfig {
        name: "docs".into(),
        index: None,
        folder_index: None,
        fs: FsConfig::new(root),
        filters: Vec::new(),
        outputs: Vec::new(),
    };
    tweak(&mut job);
    job
}

struct Harness {
    service: Arc<InMemoryService>,
    state: Arc<InMemoryStateStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            service: Arc::new(InMemoryService::new()),
            state: Arc::new(InMemoryStateStore::new()),
        }
    }

    fn crawler(&self, job: JobConfig) -> Crawler {
        let ctx = BuildContext {
            service: self.service.clone(),
            extractor: Arc::new(DefaultExtractor),
        };
        let router = PluginRegistry::with_builtins().build_router(&job, &ctx).unwrap();
        self.crawler_with(job, router, CloseSignal::new())
    }

    fn crawler_with(&self, job: JobConfig, router: Router, signal: Arc<CloseSignal>) -> Crawler {
        Crawler::new(
            job,
            Arc::new(LocalFileSource::new(false, false)),
            self.service.clone(),
            Arc::new(router),
            self.state.clone(),
            signal,
        )
        .unwrap()
    }

    /// Ids written to the file index since the last clear.
    fn indexed_files(&self) -> Vec<String> {
        self.service
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Index { index, id, .. } if index == "docs" => Some(id),
                _ => None,
            })
            .collect()
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

fn sample_tree() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", "alpha");
    write(tmp.path(), "sub/b.txt", "bravo");
    write(tmp.path(), "sub/deep/c.txt", "charlie");
    tmp
}

// ═══════════════════════════════════════════════════════════════════════
// Indexing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_first_run_indexes_files_and_folders() {
    let tmp = sample_tree();
    let h = Harness::new();
    let report = h.crawler(job(tmp.path(), |_| {})).run_once().await.unwrap();

    assert_eq!(report.stats.indexed, 3);
    assert_eq!(report.state.indexed, 3);
    assert_eq!(h.service.count("docs"), 3);
    // Root, sub, sub/deep.
    assert_eq!(h.service.count("docs_folder"), 3);

    let id = ids::generate_id("/a.txt");
    let doc = h.service.get("docs", &id).await.unwrap().unwrap();
    assert_eq!(doc["content"], "alpha");
    assert_eq!(doc["file"]["filename"], "a.txt");
    assert_eq!(doc["file"]["extension"], "txt");
    assert_eq!(doc["file"]["filesize"], 5);
    assert_eq!(doc["path"]["virtual"], "/a.txt");
    assert_eq!(doc["path"]["root"], ids::generate_id("/"));

    let folder = h
        .service
        .get("docs_folder", &ids::generate_id("/sub/deep"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(folder["file"]["filename"], "deep");
    assert_eq!(folder["path"]["root"], ids::generate_id("/sub"));
}

#[tokio::test]
async fn test_only_changed_files_are_reindexed() {
    let tmp = sample_tree();
    let h = Harness::new();
    let mut previous = RunState::new("docs");
    previous.last_run = Some(Utc::now() + chrono::Duration::seconds(5));
    previous.indexed = 3;
    h.state.write(&previous).await.unwrap();

    set_mtime(
        &tmp.path().join("sub/b.txt"),
        SystemTime::now() + Duration::from_secs(3600),
    );

    let report = h.crawler(job(tmp.path(), |_| {})).run_once().await.unwrap();
    assert_eq!(report.stats.indexed, 1);
    assert_eq!(h.indexed_files(), vec![ids::generate_id("/sub/b.txt")]);
    assert_eq!(report.state.indexed, 4);
    // Folders are refreshed on every run.
    assert_eq!(h.service.count("docs_folder"), 2);
}

#[tokio::test]
async fn test_watermark_is_completion_minus_margin() {
    let tmp = sample_tree();
    let h = Harness::new();
    let before = Utc::now();
    h.crawler(job(tmp.path(), |_| {})).run_once().await.unwrap();
    let after = Utc::now();

    let state = h.state.read("docs").await.unwrap().unwrap();
    let last_run = state.last_run.unwrap();
    let margin = chrono::Duration::from_std(WATERMARK_MARGIN).unwrap();
    assert!(last_run <= after - margin);
    assert!(last_run >= before - margin - chrono::Duration::seconds(1));
    assert!(state.next_check.unwrap() > after);
}

#[tokio::test]
async fn test_includes_and_excludes_are_case_insensitive() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", "a");
    write(tmp.path(), "c.pdf", "c");
    write(tmp.path(), "~lock.txt", "l");
    write(tmp.path(), "sub/B.TXT", "b");
    let h = Harness::new();
    let job = job(tmp.path(), |j| j.fs.includes = vec!["*.txt".into()]);
    h.crawler(job).run_once().await.unwrap();

    let mut indexed = h.indexed_files();
    indexed.sort();
    let mut expected = vec![ids::generate_id("/a.txt"), ids::generate_id("/sub/B.TXT")];
    expected.sort();
    assert_eq!(indexed, expected);
}

#[tokio::test]
async fn test_ignore_marker_skips_subtree() {
    let tmp = sample_tree();
    write(tmp.path(), "sub/.fscrawlerignore", "");
    let h = Harness::new();
    let report = h.crawler(job(tmp.path(), |_| {})).run_once().await.unwrap();

    assert_eq!(report.stats.indexed, 1);
    assert_eq!(h.indexed_files(), vec![ids::generate_id("/a.txt")]);
    assert!(!h
        .service
        .exists("docs_folder", &ids::generate_id("/sub/deep"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_ignore_marker_added_later_deletes_nothing() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = h.crawler(job(tmp.path(), |j| j.fs.remove_deleted = true));
    crawler.run_once().await.unwrap();
    assert_eq!(h.service.count("docs"), 3);
    assert_eq!(h.service.count("docs_folder"), 3);

    write(tmp.path(), "sub/.fscrawlerignore", "");
    let report = crawler.run_once().await.unwrap();

    assert_eq!(report.stats.deleted, 0);
    assert!(h.service.deleted_ids().is_empty());
    assert_eq!(h.service.count("docs"), 3);
    assert_eq!(h.service.count("docs_folder"), 3);
    for path in ["/sub/b.txt", "/sub/deep/c.txt"] {
        assert!(h.service.exists("docs", &ids::generate_id(path)).await.unwrap(), "{}", path);
    }
    assert!(h
        .service
        .exists("docs_folder", &ids::generate_id("/sub/deep"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_size_ceiling_skips_without_error() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "small.txt", "ok");
    write(tmp.path(), "large.txt", "way too large");
    let h = Harness::new();
    let job = job(tmp.path(), |j| j.fs.ignore_above = Some(4));
    let report = h.crawler(job).run_once().await.unwrap();

    assert_eq!(report.stats.indexed, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(h.indexed_files(), vec![ids::generate_id("/small.txt")]);
}

#[tokio::test]
async fn test_checksum_and_stored_source() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", "alpha");
    let h = Harness::new();
    let job = job(tmp.path(), |j| {
        j.fs.checksum = Some("SHA-256".into());
        j.fs.store_source = true;
        j.fs.index_content = false;
    });
    h.crawler(job).run_once().await.unwrap();

    let doc = h
        .service
        .get("docs", &ids::generate_id("/a.txt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["file"]["checksum"], hex::encode(Sha256::digest(b"alpha")));
    assert_eq!(doc["attachment"], "YWxwaGE=");
    assert!(doc.get("content").is_none());
}

#[tokio::test]
async fn test_filename_as_id() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "invoice-42.txt", "x");
    let h = Harness::new();
    let job = job(tmp.path(), |j| j.fs.filename_as_id = true);
    h.crawler(job).run_once().await.unwrap();
    assert_eq!(h.indexed_files(), vec!["invoice-42.txt".to_string()]);
}

#[tokio::test]
async fn test_missing_root_fails_without_state() {
    let tmp = TempDir::new().unwrap();
    let h = Harness::new();
    let err = h
        .crawler(job(&tmp.path().join("missing"), |_| {}))
        .run_once()
        .await
        .unwrap_err();
    assert!(matches!(err, CrawlError::RootMissing(_)));
    assert!(h.state.read("docs").await.unwrap().is_none());
}

// ═══════════════════════════════════════════════════════════════════════
// Deletion diff
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_vanished_files_and_folders_are_deleted() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = h.crawler(job(tmp.path(), |_| {}));
    crawler.run_once().await.unwrap();

    fs::remove_dir_all(tmp.path().join("sub")).unwrap();
    h.service.clear_operations();
    let report = crawler.run_once().await.unwrap();

    // b.txt, c.txt, sub/deep, sub.
    assert_eq!(report.stats.deleted, 4);
    assert_eq!(report.state.deleted, 4);
    assert_eq!(h.service.count("docs"), 1);
    assert_eq!(h.service.count("docs_folder"), 1);

    let mut deleted = h.service.deleted_ids();
    deleted.sort();
    let mut expected = vec![
        ids::generate_id("/sub/b.txt"),
        ids::generate_id("/sub/deep/c.txt"),
        ids::generate_id("/sub/deep"),
        ids::generate_id("/sub"),
    ];
    expected.sort();
    assert_eq!(deleted, expected);
}

#[tokio::test]
async fn test_single_vanished_file_is_deleted() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = h.crawler(job(tmp.path(), |_| {}));
    crawler.run_once().await.unwrap();

    fs::remove_file(tmp.path().join("sub/deep/c.txt")).unwrap();
    h.service.clear_operations();
    let report = crawler.run_once().await.unwrap();

    assert_eq!(report.stats.deleted, 1);
    assert_eq!(h.service.deleted_ids(), vec![ids::generate_id("/sub/deep/c.txt")]);
}

#[tokio::test]
async fn test_remove_deleted_disabled_keeps_documents() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = h.crawler(job(tmp.path(), |j| j.fs.remove_deleted = false));
    crawler.run_once().await.unwrap();

    fs::remove_file(tmp.path().join("a.txt")).unwrap();
    let report = crawler.run_once().await.unwrap();
    assert_eq!(report.stats.deleted, 0);
    assert_eq!(h.service.count("docs"), 3);
}

#[tokio::test]
async fn test_excluded_entries_are_not_deleted() {
    let tmp = sample_tree();
    let h = Harness::new();
    h.crawler(job(tmp.path(), |_| {})).run_once().await.unwrap();

    // Once excluded, a.txt is invisible: not reindexed, not deleted.
    let report = h
        .crawler(job(tmp.path(), |j| j.fs.excludes = vec!["/a.txt".into()]))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.stats.deleted, 0);
    assert!(h
        .service
        .exists("docs", &ids::generate_id("/a.txt"))
        .await
        .unwrap());
}

// ═══════════════════════════════════════════════════════════════════════
// Errors and cancellation
// ═══════════════════════════════════════════════════════════════════════

fn json_job(root: &Path, continue_on_error: bool) -> JobConfig {
    job(root, |j| {
        j.fs.continue_on_error = continue_on_error;
        let mut filter = PluginConfig::new("json");
        filter.when = Some("extension == 'json'".into());
        j.filters = vec![filter];
    })
}

#[tokio::test]
async fn test_item_error_aborts_run_and_keeps_state() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "bad.json", "{not json");
    write(tmp.path(), "good.txt", "fine");
    let h = Harness::new();
    let err = h.crawler(json_job(tmp.path(), false)).run_once().await.unwrap_err();

    assert!(matches!(err, CrawlError::Item { .. }));
    assert!(h.state.read("docs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_continue_on_error_skips_bad_item() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "bad.json", "{not json");
    write(tmp.path(), "good.txt", "fine");
    let h = Harness::new();
    let report = h.crawler(json_job(tmp.path(), true)).run_once().await.unwrap();

    assert_eq!(report.stats.indexed, 1);
    assert_eq!(report.stats.errors, 1);
    assert_eq!(h.indexed_files(), vec![ids::generate_id("/good.txt")]);
    assert!(h.state.read("docs").await.unwrap().is_some());
}

/// Raises the close signal on its first document.
struct CloseOnSend {
    signal: Arc<CloseSignal>,
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Output for CloseOnSend {
    fn name(&self) -> &str {
        "close-on-send"
    }

    async fn send(&self, _id: &str, _doc: &Document, _ctx: &RoutingContext) -> Result<(), PipelineError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.signal.close();
        Ok(())
    }
}

#[tokio::test]
async fn test_close_mid_run_stops_and_does_not_persist() {
    let tmp = sample_tree();
    write(tmp.path(), "b.txt", "second root file");
    let h = Harness::new();
    let signal = CloseSignal::new();
    let sent = Arc::new(AtomicUsize::new(0));
    let mut router = Router::new();
    router
        .add_output(
            None,
            Box::new(CloseOnSend {
                signal: signal.clone(),
                sent: sent.clone(),
            }),
        )
        .unwrap();

    let crawler = h.crawler_with(job(tmp.path(), |j| j.fs.index_folders = false), router, signal);
    let err = crawler.run_once().await.unwrap_err();

    assert!(matches!(err, CrawlError::Closed));
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert!(h.state.read("docs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_closed_before_run_does_nothing() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = h.crawler(job(tmp.path(), |_| {}));
    crawler.signal().close();

    assert!(matches!(crawler.run_once().await, Err(CrawlError::Closed)));
    assert!(h.service.operations().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
// Worker loop
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_worker_honours_run_limit() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = Arc::new(h.crawler(job(tmp.path(), |j| j.fs.update_rate = Duration::from_millis(10))));

    let summary = Worker::new(crawler, Some(2)).run().await;
    assert_eq!(summary.runs, 2);
    assert_eq!(summary.failures, 0);
    assert!(summary.indexed >= 3);
}

#[tokio::test]
async fn test_worker_wakes_on_close() {
    let tmp = sample_tree();
    let h = Harness::new();
    let crawler = Arc::new(h.crawler(job(tmp.path(), |j| j.fs.update_rate = Duration::from_secs(3600))));
    let handle = Worker::new(crawler, None).spawn();

    // Let the first run finish, then interrupt the hour-long wait.
    for _ in 0..100 {
        if h.state.read("docs").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let shutdown = CloseSignal::new();
    shutdown.close();
    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        handle.join(&shutdown, Duration::from_secs(5)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(summary.runs, 1);
}
