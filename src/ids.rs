//! Stable identifiers and virtual paths.
//!
//! A virtual path is an entry's location relative to the scan root,
//! always `/`-separated and starting with `/` (the root itself is `/`).
//! Document ids hash the normalized virtual path, so the same logical
//! file maps to the same id across runs and regardless of whether the
//! input used `/` or `\` separators.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Normalize separators to `/`, collapse repeats, force a leading `/`,
/// and drop any trailing `/` except on the root.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path
        .split(|c: char| c == '/' || c == '\\')
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

/// Virtual path of a child `name` inside the directory at `parent`.
pub fn join_virtual(parent: &str, name: &str) -> String {
    normalize(&format!("{}/{}", parent, name))
}

/// Virtual path of `path` relative to `root`.
pub fn virtual_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    normalize(&relative.to_string_lossy())
}

/// Hex SHA-256 of arbitrary text.
pub fn sign(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable id for a virtual path.
pub fn generate_id(virtual_path: &str) -> String {
    sign(&normalize(virtual_path))
}

/// Id of the file `filename` in directory `parent`, or the raw filename
/// when the job indexes by filename.
pub fn file_id(parent: &str, filename: &str, filename_as_id: bool) -> String {
    if filename_as_id {
        filename.to_string()
    } else {
        generate_id(&join_virtual(parent, filename))
    }
}

/// Backend-safe id derived from a path: separators become `_`.
pub fn id_from_path(path: &str) -> String {
    normalize(path).trim_start_matches('/').replace('/', "_")
}
