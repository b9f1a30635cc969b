//! Core data models used throughout the crawler.
//!
//! [`Entry`] is what a [`FileSource`](crate::source::FileSource) lists,
//! [`Document`] and [`FolderDocument`] are what ends up in the backend,
//! [`RoutingContext`] travels with a document through the pipeline, and
//! [`RunState`] is the per-job watermark persisted between runs.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Sockets, devices, dangling links.
    Other,
}

/// One node of the source tree, as produced by a listing.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<u32>,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Changed since `watermark`: modified or created strictly after it.
    /// Entries without a modification time are always considered changed.
    pub fn changed_since(&self, watermark: DateTime<Utc>) -> bool {
        let modified = self.modified.map_or(true, |m| m > watermark);
        let created = self.created.is_some_and(|c| c > watermark);
        modified || created
    }
}

/// Lower-cased extension of `filename`, empty for dotfiles and extensionless names.
pub fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_chars: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathInfo {
    /// Hash of the parent directory's virtual path.
    pub root: String,
    #[serde(rename = "virtual")]
    pub virtual_path: String,
    pub real: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

/// The indexable unit for a file.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Document {
    /// Explicit backend id. When absent, outputs derive one from the path.
    #[serde(skip)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    pub file: FileInfo,
    pub path: PathInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    /// Base64 of the raw bytes when the job stores sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// Fields merged at the top level, e.g. by the `json` filter.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// Top-level fields owned by the crawler.
    pub const RESERVED_FIELDS: &'static [&'static str] =
        &["content", "meta", "file", "path", "attributes", "attachment"];

    /// Merge a top-level field. Refuses names in [`Self::RESERVED_FIELDS`].
    pub fn insert_extra(&mut self, key: String, value: Value) -> bool {
        if Self::RESERVED_FIELDS.contains(&key.as_str()) {
            return false;
        }
        self.extra.insert(key, value);
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FolderName {
    pub filename: String,
}

/// Lightweight record kept for every indexed directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FolderDocument {
    pub path: PathInfo,
    pub file: FolderName,
}

/// Per-item context the pipeline filters mutate and the predicates read.
///
/// Built fresh for every item and never shared between items.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub filename: String,
    pub extension: String,
    /// Virtual path of the item.
    pub path: String,
    pub size: i64,
    /// Name of the job that discovered the item.
    pub source_id: String,
    pub mime_type: Option<String>,
    pub target_index: String,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
}

/// Persisted run metadata for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub name: String,
    /// Watermark: entries changed after this instant are (re)indexed.
    #[serde(rename = "lastrun", default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(rename = "nextCheck", default)]
    pub next_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub indexed: u64,
    #[serde(default)]
    pub deleted: u64,
}

impl RunState {
    /// State for a job that has never completed a run.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_run: None,
            next_check: None,
            indexed: 0,
            deleted: 0,
        }
    }

    /// The watermark, or the beginning of time on a first run.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.last_run.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(modified: Option<DateTime<Utc>>, created: Option<DateTime<Utc>>) -> Entry {
        Entry {
            name: "a.txt".into(),
            path: PathBuf::from("/tmp/a.txt"),
            kind: EntryKind::File,
            size: 1,
            created,
            modified,
            accessed: None,
            owner: None,
            group: None,
            permissions: None,
        }
    }

    #[test]
    fn test_changed_since_watermark() {
        let t0 = Utc::now();
        assert!(!entry(Some(t0 - Duration::seconds(1)), None).changed_since(t0));
        assert!(entry(Some(t0 + Duration::seconds(1)), None).changed_since(t0));
        assert!(!entry(Some(t0), None).changed_since(t0));
        assert!(entry(Some(t0 - Duration::seconds(5)), Some(t0 + Duration::seconds(1))).changed_since(t0));
        assert!(entry(None, None).changed_since(t0));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("Report.PDF"), "pdf");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".bashrc"), "");
    }

    #[test]
    fn test_first_run_watermark_is_min() {
        let state = RunState::new("docs");
        assert_eq!(state.watermark(), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_document_serialization_shape() {
        let mut doc = Document {
            id: Some("abc".into()),
            content: Some("hello".into()),
            file: FileInfo {
                filename: "a.txt".into(),
                extension: "txt".into(),
                ..Default::default()
            },
            path: PathInfo {
                root: "r".into(),
                virtual_path: "/a.txt".into(),
                real: "/data/a.txt".into(),
            },
            ..Default::default()
        };
        doc.extra.insert("title".into(), serde_json::json!("T"));
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["path"]["virtual"], "/a.txt");
        assert_eq!(json["file"]["extension"], "txt");
        assert_eq!(json["title"], "T");
        assert!(json.get("meta").is_none());
    }
}
