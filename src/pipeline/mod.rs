//! Pipeline router: ordered filters, then conditional fan-out to outputs.
//!
//! ```text
//! PipelineItem + RoutingContext
//!        │
//!        ▼
//!   filter 1 (when?) ─► filter 2 (when?) ─► ...      mutate doc + context
//!        │
//!        ▼
//!   output 1 (when?) ─► output 2 (when?) ─► ...      sequential, in order
//! ```
//!
//! Every filter and output carries an optional `when` predicate evaluated
//! against the item's [`RoutingContext`]. Filters see the context as left
//! by the previous filters; outputs see the final context. The raw content
//! stream can be consumed by one filter only.
//!
//! Filters run on the blocking pool, since extraction is synchronous and
//! can be slow. Dispatch is sequential within the calling task: a slow
//! output delays the outputs after it. A predicate that fails to evaluate aborts the item
//! with [`PipelineError::Condition`] rather than skipping the stage.

pub mod filter;
pub mod output;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::condition::{self, ConditionEvaluator};
use crate::error::PipelineError;
use crate::ids;
use crate::models::{Document, RoutingContext};
use crate::source::ContentStream;

pub use filter::{ExtractFilter, JsonFilter, TagFilter};
pub use output::IndexOutput;

/// A document on its way through the router, with its raw content.
pub struct PipelineItem {
    pub doc: Document,
    /// Source path, passed to extractors.
    pub full_path: String,
    pub size: u64,
    stream: Option<ContentStream>,
}

impl PipelineItem {
    pub fn new(doc: Document, full_path: impl Into<String>, size: u64) -> Self {
        Self {
            doc,
            full_path: full_path.into(),
            size,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: ContentStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Take the raw content. Later callers get `None`.
    pub fn take_stream(&mut self) -> Option<ContentStream> {
        self.stream.take()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }
}

/// Mutates a document and its routing context. Called on a blocking thread.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, item: &mut PipelineItem, ctx: &mut RoutingContext) -> Result<(), PipelineError>;
}

/// Destination for routed documents.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, id: &str, doc: &Document, ctx: &RoutingContext) -> Result<(), PipelineError>;

    async fn flush(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Wait until everything sent so far has been written.
    async fn drain(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct Stage<T: ?Sized> {
    when: Option<String>,
    plugin: Arc<T>,
}

/// Outcome of routing one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routed {
    pub filters_applied: usize,
    /// Names of the outputs that received the document.
    pub outputs: Vec<String>,
}

#[derive(Default)]
pub struct Router {
    filters: Vec<Stage<dyn Filter>>,
    outputs: Vec<Stage<dyn Output>>,
    evaluator: ConditionEvaluator,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter. `when` is compiled now; an invalid predicate is a
    /// configuration error.
    pub fn add_filter(&mut self, when: Option<String>, filter: Box<dyn Filter>) -> Result<(), PipelineError> {
        validate(&when)?;
        self.filters.push(Stage {
            when,
            plugin: Arc::from(filter),
        });
        Ok(())
    }

    pub fn add_output(&mut self, when: Option<String>, output: Box<dyn Output>) -> Result<(), PipelineError> {
        validate(&when)?;
        self.outputs.push(Stage {
            when,
            plugin: Arc::from(output),
        });
        Ok(())
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|s| s.plugin.name()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|s| s.plugin.name()).collect()
    }

    /// Run `item` through the filters, then send it to every matching output.
    pub async fn process(
        &self,
        mut item: PipelineItem,
        mut ctx: RoutingContext,
    ) -> Result<Routed, PipelineError> {
        let mut routed = Routed::default();

        for stage in &self.filters {
            if !self.evaluator.evaluate(stage.when.as_deref(), &ctx)? {
                trace!(filter = stage.plugin.name(), path = %ctx.path, "filter skipped");
                continue;
            }
            let filter = stage.plugin.clone();
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let (mut item, mut ctx) = (item, ctx);
                let result = filter.apply(&mut item, &mut ctx);
                ((item, ctx), result)
            })
            .await
            .map_err(|e| PipelineError::Filter {
                filter: stage.plugin.name().to_string(),
                message: format!("filter task failed: {}", e),
            })?;
            (item, ctx) = returned;
            result?;
            routed.filters_applied += 1;
        }

        let id = item
            .doc
            .id
            .clone()
            .unwrap_or_else(|| ids::id_from_path(&ctx.path));

        for stage in &self.outputs {
            if !self.evaluator.evaluate(stage.when.as_deref(), &ctx)? {
                trace!(output = stage.plugin.name(), path = %ctx.path, "output skipped");
                continue;
            }
            stage.plugin.send(&id, &item.doc, &ctx).await?;
            routed.outputs.push(stage.plugin.name().to_string());
        }

        debug!(path = %ctx.path, id = %id, outputs = ?routed.outputs, "item routed");
        Ok(routed)
    }

    pub async fn flush(&self) -> Result<(), PipelineError> {
        for stage in &self.outputs {
            stage.plugin.flush().await?;
        }
        Ok(())
    }

    pub async fn drain(&self) -> Result<(), PipelineError> {
        for stage in &self.outputs {
            stage.plugin.drain().await?;
        }
        Ok(())
    }

    /// Close every output, returning the first error after trying them all.
    pub async fn close(&self) -> Result<(), PipelineError> {
        let mut first_error = None;
        for stage in &self.outputs {
            if let Err(e) = stage.plugin.close().await {
                tracing::warn!(output = stage.plugin.name(), error = %e, "failed to close output");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn validate(when: &Option<String>) -> Result<(), PipelineError> {
    match when.as_deref().map(str::trim) {
        None | Some("") => Ok(()),
        Some(expr) if expr.eq_ignore_ascii_case("true") || expr.eq_ignore_ascii_case("false") => Ok(()),
        Some(expr) => condition::compile(expr).map(|_| ()).map_err(PipelineError::from),
    }
}
