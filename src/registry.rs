//! Plugin registry: type name → constructor.
//!
//! Every `[[jobs.filters]]` and `[[jobs.outputs]]` entry names a `type`.
//! The registry maps that name to a constructor that parses the entry's
//! options into the plugin's own typed options struct, once, when the
//! job's router is built.
//!
//! | Kind | Type | Options |
//! |------|------|---------|
//! | filter | `extract` | `indexed_chars` |
//! | filter | `json` | none |
//! | filter | `tag` | `tags`, `metadata`, `target_index` |
//! | output | `index` | `index`, `pipeline` |
//!
//! Additional kinds are added with [`PluginRegistry::register_filter`] and
//! [`PluginRegistry::register_output`] before routers are built.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{JobConfig, PluginConfig};
use crate::error::PipelineError;
use crate::extract::ContentExtractor;
use crate::pipeline::filter::{ExtractFilter, ExtractOptions, JsonFilter, TagFilter, TagOptions};
use crate::pipeline::output::{IndexOptions, IndexOutput};
use crate::pipeline::{Filter, Output, Router};
use crate::service::DocumentService;

/// Shared collaborators handed to every constructor.
#[derive(Clone)]
pub struct BuildContext {
    pub service: Arc<dyn DocumentService>,
    pub extractor: Arc<dyn ContentExtractor>,
}

pub type FilterFactory = fn(&PluginConfig, &BuildContext) -> Result<Box<dyn Filter>, PipelineError>;
pub type OutputFactory = fn(&PluginConfig, &BuildContext) -> Result<Box<dyn Output>, PipelineError>;

// ═══════════════════════════════════════════════════════════════════════
// Option parsing
// ═══════════════════════════════════════════════════════════════════════

/// Parse a plugin entry's options into `T`. The `name` key is a label, not an option.
pub fn parse_options<T: DeserializeOwned>(plugin: &PluginConfig) -> Result<T, PipelineError> {
    let mut table = plugin.options.clone();
    table.remove("name");
    toml::Value::Table(table).try_into().map_err(|e| {
        PipelineError::Config(format!(
            "invalid options for {} '{}': {}",
            plugin.kind,
            plugin.label(),
            e
        ))
    })
}

fn build_extract(plugin: &PluginConfig, ctx: &BuildContext) -> Result<Box<dyn Filter>, PipelineError> {
    let options: ExtractOptions = parse_options(plugin)?;
    Ok(Box::new(ExtractFilter::new(&plugin.label(), ctx.extractor.clone(), options)))
}

fn build_json(plugin: &PluginConfig, _ctx: &BuildContext) -> Result<Box<dyn Filter>, PipelineError> {
    parse_options::<toml::Table>(plugin).and_then(|rest| {
        if rest.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "json filter '{}' takes no options",
                plugin.label()
            )))
        }
    })?;
    Ok(Box::new(JsonFilter::new(&plugin.label())))
}

fn build_tag(plugin: &PluginConfig, _ctx: &BuildContext) -> Result<Box<dyn Filter>, PipelineError> {
    let options: TagOptions = parse_options(plugin)?;
    Ok(Box::new(TagFilter::new(&plugin.label(), options)))
}

fn build_index(plugin: &PluginConfig, ctx: &BuildContext) -> Result<Box<dyn Output>, PipelineError> {
    let options: IndexOptions = parse_options(plugin)?;
    Ok(Box::new(IndexOutput::new(&plugin.label(), ctx.service.clone(), options)))
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct PluginRegistry {
    filters: HashMap<String, FilterFactory>,
    outputs: HashMap<String, OutputFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PluginRegistry {
    /// A registry with no kinds registered.
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_filter("extract", build_extract);
        registry.register_filter("json", build_json);
        registry.register_filter("tag", build_tag);
        registry.register_output("index", build_index);
        registry
    }

    pub fn register_filter(&mut self, kind: &str, factory: FilterFactory) {
        self.filters.insert(kind.to_string(), factory);
    }

    pub fn register_output(&mut self, kind: &str, factory: OutputFactory) {
        self.outputs.insert(kind.to_string(), factory);
    }

    pub fn filter_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn output_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.outputs.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build_filter(&self, plugin: &PluginConfig, ctx: &BuildContext) -> Result<Box<dyn Filter>, PipelineError> {
        let factory = self.filters.get(&plugin.kind).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown filter type '{}' (known: {})",
                plugin.kind,
                self.filter_kinds().join(", ")
            ))
        })?;
        factory(plugin, ctx)
    }

    pub fn build_output(&self, plugin: &PluginConfig, ctx: &BuildContext) -> Result<Box<dyn Output>, PipelineError> {
        let factory = self.outputs.get(&plugin.kind).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown output type '{}' (known: {})",
                plugin.kind,
                self.output_kinds().join(", ")
            ))
        })?;
        factory(plugin, ctx)
    }

    /// Build the router for `job`, applying the default filter and output
    /// when the job configures none.
    pub fn build_router(&self, job: &JobConfig, ctx: &BuildContext) -> Result<Router, PipelineError> {
        let mut router = Router::new();

        let default_filters;
        let filters = if job.filters.is_empty() {
            default_filters = if job.fs.index_content {
                vec![PluginConfig::new("extract")]
            } else {
                Vec::new()
            };
            &default_filters
        } else {
            &job.filters
        };
        for plugin in filters {
            router.add_filter(plugin.when.clone(), self.build_filter(plugin, ctx)?)?;
        }

        let default_outputs;
        let outputs = if job.outputs.is_empty() {
            default_outputs = vec![PluginConfig::new("index")];
            &default_outputs
        } else {
            &job.outputs
        };
        for plugin in outputs {
            router.add_output(plugin.when.clone(), self.build_output(plugin, ctx)?)?;
        }

        debug!(
            job = %job.name,
            filters = ?router.filter_names(),
            outputs = ?router.output_names(),
            "pipeline built"
        );
        Ok(router)
    }
}
