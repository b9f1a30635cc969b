//! Incremental scan/diff engine.
//!
//! One [`Crawler`] owns one job. [`Crawler::run_once`] walks the job's tree,
//! indexes what changed since the previous run's watermark, deletes what
//! vanished, and persists the new watermark only when the whole traversal
//! completed.
//!
//! ```text
//! read RunState ──▶ visit(/) ──▶ visit(/a) ──▶ ...
//!                     │
//!                     ├─ marker present? skip subtree
//!                     ├─ file changed since W? ──▶ Router::process
//!                     ├─ dir? ──▶ folder doc ──▶ recurse
//!                     └─ remove_deleted? ──▶ diff backend children vs. seen
//!                                            └─ vanished dir ──▶ diff one level down, then delete
//! drain service and outputs (a rejected flush fails the run)
//! write RunState { lastrun = completion - margin }
//! ```
//!
//! Every file and folder document carries `path.root`, the hash of its
//! parent's virtual path. The deletion diff for a directory is a term query
//! on that field, which is why folder ids are the hash of their own
//! virtual path.

use std::collections::HashSet;
use std::future::Future;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use crate::config::JobConfig;
use crate::error::{ClientError, CrawlError};
use crate::extract::detect_content_type;
use crate::ids;
use crate::models::{
    extension_of, Attributes, Document, Entry, EntryKind, FileInfo, FolderDocument, FolderName,
    PathInfo, RoutingContext, RunState,
};
use crate::pipeline::{PipelineItem, Router};
use crate::service::{field_value, search_all, DocumentService, SearchRequest};
use crate::source::FileSource;
use crate::state::StateStore;
use crate::worker::CloseSignal;

/// Subtracted from the completion time before it becomes the next watermark.
pub const WATERMARK_MARGIN: Duration = Duration::from_secs(2);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Counters for a single run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub indexed: u64,
    pub deleted: u64,
    /// Files above the size ceiling.
    pub skipped: u64,
    /// Per-item failures tolerated by `continue_on_error`.
    pub errors: u64,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub stats: RunStats,
}

/// Watermark persisted for a run that completed at `completed`.
pub fn watermark_for(completed: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = Utc
        .timestamp_opt(completed.timestamp(), 0)
        .single()
        .unwrap_or(completed);
    let margin = chrono::Duration::from_std(WATERMARK_MARGIN).unwrap_or_else(|_| chrono::Duration::zero());
    truncated - margin
}

// ═══════════════════════════════════════════════════════════════════════
// Include / exclude rules
// ═══════════════════════════════════════════════════════════════════════

/// Glob rules matched case-insensitively against virtual paths.
///
/// Excludes hide files and directories alike. Includes only restrict
/// files, so directories are still traversed to find matching files.
#[derive(Debug, Clone)]
pub struct PathRules {
    includes: Option<GlobSet>,
    excludes: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    builder.build()
}

impl PathRules {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, globset::Error> {
        let includes = if includes.is_empty() {
            None
        } else {
            Some(build_globset(includes)?)
        };
        Ok(Self {
            includes,
            excludes: build_globset(excludes)?,
        })
    }

    pub fn is_excluded(&self, virtual_path: &str) -> bool {
        self.excludes.is_match(virtual_path)
    }

    /// Whether a file at `virtual_path` is visible to the crawler.
    pub fn accepts_file(&self, virtual_path: &str) -> bool {
        if self.is_excluded(virtual_path) {
            return false;
        }
        match &self.includes {
            None => true,
            Some(includes) => includes.is_match(virtual_path),
        }
    }

    pub fn accepts_dir(&self, virtual_path: &str) -> bool {
        !self.is_excluded(virtual_path)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Crawler
// ═══════════════════════════════════════════════════════════════════════

pub struct Crawler {
    job: JobConfig,
    index: String,
    folder_index: String,
    rules: PathRules,
    source: Arc<dyn FileSource>,
    service: Arc<dyn DocumentService>,
    router: Arc<Router>,
    state: Arc<dyn StateStore>,
    signal: Arc<CloseSignal>,
}

impl Crawler {
    pub fn new(
        job: JobConfig,
        source: Arc<dyn FileSource>,
        service: Arc<dyn DocumentService>,
        router: Arc<Router>,
        state: Arc<dyn StateStore>,
        signal: Arc<CloseSignal>,
    ) -> Result<Self, CrawlError> {
        let rules = PathRules::new(&job.fs.includes, &job.fs.excludes)
            .map_err(|e| CrawlError::Config(format!("job '{}': {}", job.name, e)))?;
        Ok(Self {
            index: job.index().to_string(),
            folder_index: job.folder_index(),
            job,
            rules,
            source,
            service,
            router,
            state,
            signal,
        })
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn signal(&self) -> &Arc<CloseSignal> {
        &self.signal
    }

    /// Indices this crawler writes to.
    pub fn indices(&self) -> Vec<String> {
        let mut indices = vec![self.index.clone()];
        if self.job.fs.index_folders {
            indices.push(self.folder_index.clone());
        }
        indices
    }

    fn check_closed(&self) -> Result<(), CrawlError> {
        if self.signal.is_closed() {
            Err(CrawlError::Closed)
        } else {
            Ok(())
        }
    }

    /// One full traversal. The run state is written only on success.
    pub async fn run_once(&self) -> Result<RunReport, CrawlError> {
        self.check_closed()?;
        let previous = self.state.read(&self.job.name).await?;
        let first_run = previous.is_none();
        let mut state = previous.unwrap_or_else(|| RunState::new(&self.job.name));
        let watermark = state.watermark();
        let root = self.job.fs.url.clone();

        info!(
            job = %self.job.name,
            root = %root.display(),
            protocol = self.source.protocol(),
            watermark = %watermark,
            "starting run"
        );

        self.source.open().await.map_err(|source| CrawlError::Source {
            path: root.clone(),
            source,
        })?;
        let result = self.crawl(&root, watermark, first_run).await;
        if let Err(e) = self.source.close().await {
            warn!(job = %self.job.name, error = %e, "failed to close source");
        }
        let stats = result?;

        // Writes must have landed before the watermark moves past them.
        self.service.drain().await?;
        self.router.drain().await?;
        self.check_closed()?;

        let completed = Utc::now();
        let next_watermark = watermark_for(completed);
        state.last_run = Some(match state.last_run {
            Some(previous) if previous > next_watermark => previous,
            _ => next_watermark,
        });
        state.next_check = Some(
            completed + chrono::Duration::from_std(self.job.fs.update_rate).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        state.indexed += stats.indexed;
        state.deleted += stats.deleted;
        self.state.write(&state).await?;

        info!(
            job = %self.job.name,
            indexed = stats.indexed,
            deleted = stats.deleted,
            skipped = stats.skipped,
            errors = stats.errors,
            "run complete"
        );
        Ok(RunReport { state, stats })
    }

    async fn crawl(&self, root: &Path, watermark: DateTime<Utc>, first_run: bool) -> Result<RunStats, CrawlError> {
        let exists = self.source.exists(root).await.map_err(|source| CrawlError::Source {
            path: root.to_path_buf(),
            source,
        })?;
        if !exists {
            return Err(CrawlError::RootMissing(root.to_path_buf()));
        }

        if first_run && self.job.fs.index_folders {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let root_id = ids::sign(&root.to_string_lossy());
            self.index_folder(&name, root, "/", &root_id).await?;
        }

        let mut stats = RunStats::default();
        self.visit(root.to_path_buf(), "/".to_string(), watermark, &mut stats)
            .await?;
        Ok(stats)
    }

    fn visit<'a>(
        &'a self,
        dir: PathBuf,
        dir_virtual: String,
        watermark: DateTime<Utc>,
        stats: &'a mut RunStats,
    ) -> BoxFuture<'a, Result<(), CrawlError>> {
        Box::pin(async move {
            self.check_closed()?;
            let fs = &self.job.fs;

            let entries = match self.source.list(&dir).await {
                Ok(entries) => entries,
                Err(source) if fs.continue_on_error => {
                    warn!(job = %self.job.name, dir = %dir.display(), error = %source, "cannot list directory, skipping");
                    stats.errors += 1;
                    return Ok(());
                }
                Err(source) => return Err(CrawlError::Source { path: dir, source }),
            };

            if !fs.ignore_marker.is_empty() && entries.iter().any(|e| e.name == fs.ignore_marker) {
                debug!(job = %self.job.name, dir = %dir_virtual, "ignore marker found, skipping subtree");
                return Ok(());
            }

            let parent_id = ids::generate_id(&dir_virtual);
            let mut seen_files = HashSet::new();
            let mut seen_dirs = HashSet::new();

            for entry in entries {
                self.check_closed()?;
                let virtual_path = ids::join_virtual(&dir_virtual, &entry.name);

                match entry.kind {
                    EntryKind::File => {
                        if !self.rules.accepts_file(&virtual_path) {
                            trace!(path = %virtual_path, "file filtered out");
                            continue;
                        }
                        seen_files.insert(entry.name.clone());

                        if fs.ignore_above.is_some_and(|limit| entry.size > limit) {
                            debug!(path = %virtual_path, size = entry.size, "file above size ceiling, skipping");
                            stats.skipped += 1;
                            continue;
                        }
                        if !entry.changed_since(watermark) {
                            trace!(path = %virtual_path, "unchanged since last run");
                            continue;
                        }

                        match self.index_file(&entry, &dir_virtual, &parent_id, &virtual_path).await {
                            Ok(()) => stats.indexed += 1,
                            Err(CrawlError::Closed) => return Err(CrawlError::Closed),
                            Err(e) if fs.continue_on_error => {
                                warn!(job = %self.job.name, path = %entry.path.display(), error = %e, "failed to index file, continuing");
                                stats.errors += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    EntryKind::Directory => {
                        if !self.rules.accepts_dir(&virtual_path) {
                            trace!(path = %virtual_path, "directory filtered out");
                            continue;
                        }
                        seen_dirs.insert(entry.name.clone());
                        if fs.index_folders {
                            self.index_folder(&entry.name, &entry.path, &virtual_path, &parent_id)
                                .await?;
                        }
                        self.visit(entry.path.clone(), virtual_path, watermark, stats)
                            .await?;
                    }
                    EntryKind::Other => {
                        debug!(path = %entry.path.display(), "not a file or directory, skipping");
                    }
                }
            }

            if fs.remove_deleted {
                self.remove_deleted(&dir_virtual, &parent_id, &seen_files, &seen_dirs, stats)
                    .await?;
            }
            Ok(())
        })
    }

    async fn index_file(
        &self,
        entry: &Entry,
        parent_virtual: &str,
        parent_id: &str,
        virtual_path: &str,
    ) -> Result<(), CrawlError> {
        self.check_closed()?;
        let fs = &self.job.fs;
        let real = entry.path.to_string_lossy().to_string();

        let mut doc = Document {
            id: Some(ids::file_id(parent_virtual, &entry.name, fs.filename_as_id)),
            file: FileInfo {
                filename: entry.name.clone(),
                extension: extension_of(&entry.name),
                filesize: fs.add_filesize.then_some(entry.size),
                indexing_date: Some(Utc::now()),
                created: entry.created,
                last_modified: entry.modified,
                last_accessed: entry.accessed,
                url: Some(format!("file://{}", real)),
                ..Default::default()
            },
            path: PathInfo {
                root: parent_id.to_string(),
                virtual_path: virtual_path.to_string(),
                real: real.clone(),
            },
            attributes: fs.attributes_support.then(|| Attributes {
                owner: entry.owner.clone(),
                group: entry.group.clone(),
                permissions: entry.permissions,
            }),
            ..Default::default()
        };

        let mut bytes = None;
        if fs.needs_content() {
            let content = self.read_all(entry).await?;
            if fs.checksum.is_some() {
                doc.file.checksum = Some(hex::encode(Sha256::digest(&content)));
            }
            if fs.store_source {
                doc.attachment = Some(base64::engine::general_purpose::STANDARD.encode(&content));
            }
            if fs.index_content {
                bytes = Some(content);
            }
        }

        let ctx = RoutingContext {
            filename: entry.name.clone(),
            extension: doc.file.extension.clone(),
            path: virtual_path.to_string(),
            size: i64::try_from(entry.size).unwrap_or(i64::MAX),
            source_id: self.job.name.clone(),
            mime_type: detect_content_type(&entry.name).map(str::to_string),
            target_index: self.index.clone(),
            ..Default::default()
        };

        let mut item = PipelineItem::new(doc, real, entry.size);
        if let Some(bytes) = bytes {
            item = item.with_stream(Box::new(Cursor::new(bytes)));
        }

        self.check_closed()?;
        self.router
            .process(item, ctx)
            .await
            .map_err(|source| CrawlError::Item {
                path: entry.path.clone(),
                source,
            })?;
        debug!(job = %self.job.name, path = %virtual_path, "file indexed");
        Ok(())
    }

    async fn read_all(&self, entry: &Entry) -> Result<Vec<u8>, CrawlError> {
        let to_error = |source| CrawlError::Source {
            path: entry.path.clone(),
            source,
        };
        let mut stream = self.source.read_stream(entry).await.map_err(to_error)?;
        tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).map(|_| buf)
        })
        .await
        .map_err(|e| to_error(std::io::Error::other(e)))?
        .map_err(to_error)
    }

    async fn index_folder(
        &self,
        name: &str,
        real: &Path,
        virtual_path: &str,
        parent_id: &str,
    ) -> Result<(), CrawlError> {
        self.check_closed()?;
        let folder = FolderDocument {
            path: PathInfo {
                root: parent_id.to_string(),
                virtual_path: virtual_path.to_string(),
                real: real.to_string_lossy().to_string(),
            },
            file: FolderName {
                filename: name.to_string(),
            },
        };
        let body = serde_json::to_value(&folder).map_err(ClientError::from)?;
        self.service
            .index(&self.folder_index, &ids::generate_id(virtual_path), body, None)
            .await?;
        trace!(job = %self.job.name, path = %virtual_path, "folder indexed");
        Ok(())
    }

    /// Delete every previously indexed child of `dir_virtual` that was not seen.
    fn remove_deleted<'a>(
        &'a self,
        dir_virtual: &'a str,
        dir_id: &'a str,
        seen_files: &'a HashSet<String>,
        seen_dirs: &'a HashSet<String>,
        stats: &'a mut RunStats,
    ) -> BoxFuture<'a, Result<(), CrawlError>> {
        Box::pin(async move {
            self.check_closed()?;

            let known_files = self.known_children(&self.index, dir_id).await?;
            for (id, name) in known_files {
                self.check_closed()?;
                if seen_files.contains(&name) {
                    continue;
                }
                if !self.rules.accepts_file(&ids::join_virtual(dir_virtual, &name)) {
                    continue;
                }
                info!(job = %self.job.name, dir = %dir_virtual, file = %name, "removing deleted file");
                self.service.delete(&self.index, &id).await?;
                stats.deleted += 1;
            }

            if !self.job.fs.index_folders {
                return Ok(());
            }

            let known_dirs = self.known_children(&self.folder_index, dir_id).await?;
            let none = HashSet::new();
            for (id, name) in known_dirs {
                self.check_closed()?;
                if seen_dirs.contains(&name) {
                    continue;
                }
                let child = ids::join_virtual(dir_virtual, &name);
                if !self.rules.accepts_dir(&child) {
                    continue;
                }
                info!(job = %self.job.name, dir = %child, "removing deleted folder");
                self.remove_deleted(&child, &id, &none, &none, stats).await?;
                self.check_closed()?;
                self.service.delete(&self.folder_index, &id).await?;
                stats.deleted += 1;
            }
            Ok(())
        })
    }

    /// `(id, filename)` of every document in `index` whose parent is `dir_id`.
    async fn known_children(&self, index: &str, dir_id: &str) -> Result<Vec<(String, String)>, CrawlError> {
        let request = SearchRequest::new(index)
            .term("path.root", dir_id)
            .fields(&["file.filename"]);
        let hits = search_all(self.service.as_ref(), request).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let name = field_value(&hit.source, "file.filename")?.as_str()?.to_string();
                Some((hit.id, name))
            })
            .collect())
    }
}
