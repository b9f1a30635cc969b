//! Built-in outputs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::Output;
use crate::error::PipelineError;
use crate::models::{Document, RoutingContext};
use crate::service::DocumentService;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexOptions {
    /// Target index; defaults to the item's `targetIndex`.
    #[serde(default)]
    pub index: Option<String>,
    /// Ingest pipeline the backend runs on each document.
    #[serde(default)]
    pub pipeline: Option<String>,
}

/// Writes documents through a [`DocumentService`].
pub struct IndexOutput {
    name: String,
    service: Arc<dyn DocumentService>,
    options: IndexOptions,
}

impl IndexOutput {
    pub fn new(name: &str, service: Arc<dyn DocumentService>, options: IndexOptions) -> Self {
        Self {
            name: name.to_string(),
            service,
            options,
        }
    }

    pub fn index(&self) -> Option<&str> {
        self.options.index.as_deref()
    }

    fn wrap(&self, source: crate::error::ClientError) -> PipelineError {
        PipelineError::Output {
            output: self.name.clone(),
            source,
        }
    }
}

#[async_trait]
impl Output for IndexOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, id: &str, doc: &Document, ctx: &RoutingContext) -> Result<(), PipelineError> {
        let index = self.options.index.as_deref().unwrap_or(&ctx.target_index);
        if index.is_empty() {
            return Err(PipelineError::Config(format!(
                "output '{}' has no target index",
                self.name
            )));
        }
        let body = serde_json::to_value(doc).map_err(|e| self.wrap(e.into()))?;
        self.service
            .index(index, id, body, self.options.pipeline.as_deref())
            .await
            .map_err(|e| self.wrap(e))
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        self.service.flush().await.map_err(|e| self.wrap(e))
    }

    async fn drain(&self) -> Result<(), PipelineError> {
        self.service.drain().await.map_err(|e| self.wrap(e))
    }
}
