//! In-memory [`DocumentService`].
//!
//! Writes apply immediately and are also appended to an operation log so
//! tests can assert on exactly what a run sent. `--dry-run` uses it to
//! exercise a job without touching the backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{field_value, DocumentService, SearchHit, SearchRequest, SearchResponse};
use crate::error::ClientError;

/// One write received by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Index {
        index: String,
        id: String,
        pipeline: Option<String>,
    },
    Delete {
        index: String,
        id: String,
    },
}

#[derive(Default)]
struct Inner {
    indices: HashMap<String, BTreeMap<String, Value>>,
    log: Vec<Operation>,
    started: bool,
    closed: bool,
}

#[derive(Default)]
pub struct InMemoryService {
    inner: Mutex<Inner>,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every write received so far, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().log.clear();
    }

    /// Ids of documents written with an index operation since the last clear.
    pub fn indexed_ids(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                Operation::Index { id, .. } => Some(id.clone()),
                Operation::Delete { .. } => None,
            })
            .collect()
    }

    /// Ids of documents deleted since the last clear.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                Operation::Delete { id, .. } => Some(id.clone()),
                Operation::Index { .. } => None,
            })
            .collect()
    }

    /// Current documents of `index`, ordered by id.
    pub fn documents(&self, index: &str) -> Vec<(String, Value)> {
        self.lock()
            .indices
            .get(index)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, index: &str) -> usize {
        self.lock().indices.get(index).map_or(0, |docs| docs.len())
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn matches_term(source: &Value, term: &Option<(String, String)>) -> bool {
    let Some((field, expected)) = term else {
        return true;
    };
    match field_value(source, field) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    }
}

fn project(source: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return source.clone();
    }
    // Rebuild the nested shape the backend returns for source filtering.
    let mut out = Value::Object(serde_json::Map::new());
    for field in fields {
        let Some(value) = field_value(source, field) else {
            continue;
        };
        let mut slot = &mut out;
        for key in field.split('.') {
            if !(slot.is_object() || slot.is_null()) {
                *slot = Value::Null;
            }
            slot = &mut slot[key];
        }
        *slot = value.clone();
    }
    out
}

#[async_trait]
impl DocumentService for InMemoryService {
    async fn start(&self, indices: &[String]) -> Result<(), ClientError> {
        let mut inner = self.lock();
        for index in indices {
            inner.indices.entry(index.clone()).or_default();
        }
        inner.started = true;
        inner.closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.lock().closed = true;
        Ok(())
    }

    async fn index(
        &self,
        index: &str,
        id: &str,
        document: Value,
        pipeline: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        inner
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), document);
        inner.log.push(Operation::Index {
            index: index.to_string(),
            id: id.to_string(),
            pipeline: pipeline.map(String::from),
        });
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        if let Some(docs) = inner.indices.get_mut(index) {
            docs.remove(id);
        }
        inner.log.push(Operation::Delete {
            index: index.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn flush(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn drain(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError> {
        let inner = self.lock();
        let Some(docs) = inner.indices.get(&request.index) else {
            return Ok(SearchResponse::default());
        };
        let matching: Vec<(&String, &Value)> = docs
            .iter()
            .filter(|(_, source)| matches_term(source, &request.term))
            .collect();
        let hits = matching
            .iter()
            .skip(request.from)
            .take(request.size)
            .map(|(id, source)| SearchHit {
                id: (*id).clone(),
                source: project(source, &request.fields),
            })
            .collect();
        Ok(SearchResponse {
            total: matching.len() as u64,
            hits,
        })
    }

    async fn exists(&self, index: &str, id: &str) -> Result<bool, ClientError> {
        Ok(self
            .lock()
            .indices
            .get(index)
            .is_some_and(|docs| docs.contains_key(id)))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, ClientError> {
        Ok(self
            .lock()
            .indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned())
    }
}
