//! Document/management service abstraction.
//!
//! The crawler and the `index` output never talk HTTP directly; they go
//! through a [`DocumentService`]. Two implementations ship with the crate:
//!
//! | Implementation | Used by |
//! |----------------|---------|
//! | [`IndexClient`](crate::client::IndexClient) | normal runs, batched writes against the backend |
//! | [`InMemoryService`] | `--dry-run` and tests |
//!
//! Writes (`index`, `delete`) may be queued and are only guaranteed to be
//! visible after the service is drained or closed. Reads (`search`, `get`,
//! `exists`) go straight to the backend.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;

pub use memory::InMemoryService;

/// Largest page requested by callers that walk a whole result set.
pub const MAX_PAGE_SIZE: usize = 1000;

/// A term-filtered listing of one index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    /// Exact match on a (dotted) field, e.g. `("path.root", "<hash>")`.
    pub term: Option<(String, String)>,
    /// Source fields to return; empty returns the whole source.
    pub fields: Vec<String>,
    pub from: usize,
    pub size: usize,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            term: None,
            fields: Vec::new(),
            from: 0,
            size: MAX_PAGE_SIZE,
        }
    }

    pub fn term(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.term = Some((field.into(), value.into()));
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn page(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    /// Total number of matches, regardless of paging.
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

/// Read `field` from a JSON document using dotted notation (`file.filename`).
pub fn field_value<'a>(source: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(source, |value, key| value.as_object()?.get(key))
}

#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Connect and prepare the given indices.
    async fn start(&self, indices: &[String]) -> Result<(), ClientError>;

    /// Flush pending writes and release connections. Idempotent.
    async fn close(&self) -> Result<(), ClientError>;

    async fn index(
        &self,
        index: &str,
        id: &str,
        document: Value,
        pipeline: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn delete(&self, index: &str, id: &str) -> Result<(), ClientError>;

    /// Ask for queued writes to be sent now, without waiting for them.
    async fn flush(&self) -> Result<(), ClientError>;

    /// Send queued writes and wait for the backend to answer. Fails with the
    /// first request-level error since the previous drain.
    async fn drain(&self) -> Result<(), ClientError>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError>;

    async fn exists(&self, index: &str, id: &str) -> Result<bool, ClientError>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, ClientError>;
}

/// Run `request` page by page and collect every hit.
pub async fn search_all(
    service: &dyn DocumentService,
    request: SearchRequest,
) -> Result<Vec<SearchHit>, ClientError> {
    let size = request.size.clamp(1, MAX_PAGE_SIZE);
    let mut hits = Vec::new();
    let mut from = request.from;
    loop {
        let page = service
            .search(&request.clone().page(from, size))
            .await?;
        let count = page.hits.len();
        hits.extend(page.hits);
        from += count;
        if count < size || from as u64 >= page.total {
            break;
        }
    }
    Ok(hits)
}
