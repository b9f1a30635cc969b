//! Tree sources the crawler walks.
//!
//! The crawler only talks to a [`FileSource`]; each protocol (local disk
//! today) provides one implementation. Listing is one directory at a time
//! so the crawler can compute per-directory deletion diffs.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use walkdir::WalkDir;

use crate::models::{Entry, EntryKind};

/// Raw content of one file, consumed at most once.
pub type ContentStream = Box<dyn Read + Send>;

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Protocol label for logs (`"local"`, ...).
    fn protocol(&self) -> &str;

    /// Acquire any connection the source needs before a run.
    async fn open(&self) -> std::io::Result<()> {
        Ok(())
    }

    /// Release resources acquired by [`open`](FileSource::open).
    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &Path) -> std::io::Result<bool>;

    /// Direct children of `dir`, sorted by name.
    async fn list(&self, dir: &Path) -> std::io::Result<Vec<Entry>>;

    async fn read_stream(&self, entry: &Entry) -> std::io::Result<ContentStream>;
}

/// Local filesystem source.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSource {
    follow_symlinks: bool,
    attributes: bool,
}

impl LocalFileSource {
    pub fn new(follow_symlinks: bool, attributes: bool) -> Self {
        Self {
            follow_symlinks,
            attributes,
        }
    }
}

#[async_trait]
impl FileSource for LocalFileSource {
    fn protocol(&self) -> &str {
        "local"
    }

    async fn exists(&self, path: &Path) -> std::io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn list(&self, dir: &Path) -> std::io::Result<Vec<Entry>> {
        let dir = dir.to_path_buf();
        let follow = self.follow_symlinks;
        let attributes = self.attributes;
        tokio::task::spawn_blocking(move || list_dir(&dir, follow, attributes))
            .await
            .map_err(std::io::Error::other)?
    }

    async fn read_stream(&self, entry: &Entry) -> std::io::Result<ContentStream> {
        let file = std::fs::File::open(&entry.path)?;
        Ok(Box::new(file))
    }
}

fn list_dir(dir: &Path, follow_symlinks: bool, attributes: bool) -> std::io::Result<Vec<Entry>> {
    // Surface an unreadable directory as an error instead of an empty listing.
    std::fs::read_dir(dir)?;

    let mut entries = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(follow_symlinks)
        .sort_by_file_name();

    for item in walker {
        match item {
            Ok(item) => {
                let name = item.file_name().to_string_lossy().to_string();
                let path = item.path().to_path_buf();
                match item.metadata() {
                    Ok(meta) => entries.push(to_entry(name, path, &meta, attributes)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot stat entry");
                        entries.push(other_entry(name, path));
                    }
                }
            }
            Err(e) => {
                // Typically a dangling symlink when following links.
                let Some(path) = e.path().map(PathBuf::from) else {
                    warn!(dir = %dir.display(), error = %e, "listing error");
                    continue;
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                entries.push(other_entry(name, path));
            }
        }
    }

    Ok(entries)
}

fn other_entry(name: String, path: PathBuf) -> Entry {
    Entry {
        name,
        path,
        kind: EntryKind::Other,
        size: 0,
        created: None,
        modified: None,
        accessed: None,
        owner: None,
        group: None,
        permissions: None,
    }
}

fn to_entry(name: String, path: PathBuf, meta: &std::fs::Metadata, attributes: bool) -> Entry {
    let file_type = meta.file_type();
    let kind = if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::Other
    };
    let ts = |t: std::io::Result<std::time::SystemTime>| t.ok().map(DateTime::<Utc>::from);

    let mut entry = Entry {
        name,
        path,
        kind,
        size: meta.len(),
        created: ts(meta.created()),
        modified: ts(meta.modified()),
        accessed: ts(meta.accessed()),
        owner: None,
        group: None,
        permissions: None,
    };

    #[cfg(unix)]
    if attributes {
        use std::os::unix::fs::MetadataExt;
        entry.owner = Some(meta.uid().to_string());
        entry.group = Some(meta.gid().to_string());
        entry.permissions = Some(meta.mode() & 0o7777);
    }
    #[cfg(not(unix))]
    let _ = attributes;

    entry
}
