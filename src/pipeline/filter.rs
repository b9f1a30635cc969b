//! Built-in filters.
//!
//! - [`ExtractFilter`] turns the raw content into text and metadata.
//! - [`JsonFilter`] parses the raw content as a JSON object and merges it
//!   into the document.
//! - [`TagFilter`] adds fixed tags and metadata to the routing context.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::{Filter, PipelineItem};
use crate::error::PipelineError;
use crate::extract::ContentExtractor;
use crate::models::RoutingContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractOptions {
    /// Maximum characters of extracted text kept; negative keeps everything.
    #[serde(default = "default_indexed_chars")]
    pub indexed_chars: i64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            indexed_chars: default_indexed_chars(),
        }
    }
}

fn default_indexed_chars() -> i64 {
    100_000
}

pub struct ExtractFilter {
    name: String,
    extractor: Arc<dyn ContentExtractor>,
    indexed_chars: Option<usize>,
}

impl ExtractFilter {
    pub fn new(name: &str, extractor: Arc<dyn ContentExtractor>, options: ExtractOptions) -> Self {
        Self {
            name: name.to_string(),
            extractor,
            indexed_chars: usize::try_from(options.indexed_chars).ok(),
        }
    }
}

/// Keep the first `limit` characters of `text`.
fn truncate_chars(text: &mut String, limit: usize) {
    if let Some((byte_index, _)) = text.char_indices().nth(limit) {
        text.truncate(byte_index);
    }
}

impl Filter for ExtractFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, item: &mut PipelineItem, ctx: &mut RoutingContext) -> Result<(), PipelineError> {
        let Some(mut stream) = item.take_stream() else {
            return Ok(());
        };
        let extracted = self
            .extractor
            .extract(&mut stream, &item.doc.file.filename, &item.full_path, item.size)
            .map_err(|source| PipelineError::Extract {
                filter: self.name.clone(),
                source,
            })?;

        if let Some(mut content) = extracted.content {
            if let Some(limit) = self.indexed_chars {
                truncate_chars(&mut content, limit);
                item.doc.file.indexed_chars = Some(limit as u64);
            }
            item.doc.content = Some(content);
        }
        if let Some(content_type) = extracted.content_type {
            ctx.mime_type = Some(content_type.clone());
            item.doc.file.content_type = Some(content_type);
        }
        for (key, value) in extracted.metadata {
            ctx.metadata.insert(key.clone(), value.clone());
            item.doc.meta.insert(key, value);
        }
        Ok(())
    }
}

pub struct JsonFilter {
    name: String,
}

impl JsonFilter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Filter for JsonFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, item: &mut PipelineItem, ctx: &mut RoutingContext) -> Result<(), PipelineError> {
        let Some(stream) = item.take_stream() else {
            return Ok(());
        };
        let parsed: Value = serde_json::from_reader(stream).map_err(|e| PipelineError::Filter {
            filter: self.name.clone(),
            message: format!("invalid JSON: {}", e),
        })?;
        let Value::Object(fields) = parsed else {
            return Err(PipelineError::Filter {
                filter: self.name.clone(),
                message: "expected a JSON object".into(),
            });
        };

        ctx.mime_type = Some("application/json".into());
        for (key, value) in fields {
            ctx.metadata.insert(key.clone(), value.clone());
            if !item.doc.insert_extra(key.clone(), value) {
                warn!(filter = %self.name, field = %key, path = %ctx.path, "JSON field clashes with a document field, not merged");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagOptions {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Redirect the item to another index.
    #[serde(default)]
    pub target_index: Option<String>,
}

pub struct TagFilter {
    name: String,
    options: TagOptions,
}

impl TagFilter {
    pub fn new(name: &str, options: TagOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
        }
    }
}

impl Filter for TagFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _item: &mut PipelineItem, ctx: &mut RoutingContext) -> Result<(), PipelineError> {
        ctx.tags.extend(self.options.tags.iter().cloned());
        for (key, value) in &self.options.metadata {
            ctx.metadata.insert(key.clone(), value.clone());
        }
        if let Some(index) = &self.options.target_index {
            ctx.target_index = index.clone();
        }
        Ok(())
    }
}
