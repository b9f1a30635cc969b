//! Wire format for the search backend.
//!
//! Batched writes use the NDJSON `_bulk` format: one action line per
//! operation, followed by the document line for index operations. The
//! response carries one item per action, in submission order, each with
//! its own status and optional error.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::bulk::{BulkOperation, ItemFailure, ItemOutcome, OpKind};
use crate::error::ClientError;
use crate::service::{SearchHit, SearchRequest, SearchResponse};

/// Percent-encode one URL path segment (index name or document id).
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Action line for one operation.
fn action_line(op: &BulkOperation) -> Value {
    let mut meta = Map::new();
    meta.insert("_index".into(), Value::String(op.index.clone()));
    meta.insert("_id".into(), Value::String(op.id.clone()));
    match op.kind {
        OpKind::Index => {
            if let Some(pipeline) = &op.pipeline {
                meta.insert("pipeline".into(), Value::String(pipeline.clone()));
            }
            json!({ "index": meta })
        }
        OpKind::Delete => json!({ "delete": meta }),
    }
}

/// Serialize a batch into an NDJSON `_bulk` body.
pub fn encode_bulk(ops: &[BulkOperation]) -> Result<String, ClientError> {
    let mut body = String::new();
    for op in ops {
        body.push_str(&serde_json::to_string(&action_line(op))?);
        body.push('\n');
        if op.kind == OpKind::Index {
            let document = op.document.as_ref().unwrap_or(&Value::Null);
            body.push_str(&serde_json::to_string(document)?);
            body.push('\n');
        }
    }
    Ok(body)
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

fn failure_of(item: &BulkItem) -> ItemFailure {
    let (error_type, reason) = match &item.error {
        Some(Value::Object(err)) => (
            err.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            err.get("reason").and_then(Value::as_str).unwrap_or("").to_string(),
        ),
        Some(other) => ("unknown".to_string(), other.to_string()),
        None => ("unknown".to_string(), format!("status {}", item.status)),
    };
    ItemFailure {
        status: item.status,
        error_type,
        reason,
    }
}

/// Map a `_bulk` response to one outcome per submitted operation.
pub fn parse_bulk_response(body: &str, ops: &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError> {
    let response: BulkResponse = serde_json::from_str(body)?;
    if response.items.len() != ops.len() {
        return Err(ClientError::Decode(format!(
            "bulk response has {} items for {} operations",
            response.items.len(),
            ops.len()
        )));
    }

    let mut outcomes = Vec::with_capacity(ops.len());
    for (op, wrapper) in ops.iter().zip(response.items) {
        let Some((_, raw)) = wrapper.into_iter().next() else {
            return Err(ClientError::Decode("empty bulk response item".into()));
        };
        let item: BulkItem = serde_json::from_value(raw)?;
        let not_found_delete = op.kind == OpKind::Delete
            && item.status == 404
            && item.error.is_none();
        let outcome = if (200..300).contains(&item.status) || not_found_delete {
            ItemOutcome::Success {
                not_found: item.result.as_deref() == Some("not_found"),
            }
        } else {
            ItemOutcome::Failed(failure_of(&item))
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Body of a term-filtered `_search` request.
pub fn search_body(request: &SearchRequest) -> Value {
    let query = match &request.term {
        Some((field, value)) => {
            let mut term = Map::new();
            term.insert(field.clone(), Value::String(value.clone()));
            json!({ "term": term })
        }
        None => json!({ "match_all": {} }),
    };
    let mut body = json!({
        "query": query,
        "from": request.from,
        "size": request.size,
        "track_total_hits": true,
    });
    if !request.fields.is_empty() {
        body["_source"] = json!(request.fields);
    }
    body
}

#[derive(Deserialize)]
struct RawSearch {
    hits: RawHits,
}

#[derive(Deserialize)]
struct RawHits {
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

pub fn parse_search_response(body: &str) -> Result<SearchResponse, ClientError> {
    let raw: RawSearch = serde_json::from_str(body)?;
    let hits: Vec<SearchHit> = raw
        .hits
        .hits
        .into_iter()
        .map(|h| SearchHit {
            id: h.id,
            source: h.source,
        })
        .collect();
    // `total` is `{value, relation}` on recent backends and a bare number on older ones.
    let total = match raw.hits.total {
        Some(Value::Object(t)) => t.get("value").and_then(Value::as_u64),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
    .unwrap_or(hits.len() as u64);
    Ok(SearchResponse { total, hits })
}

/// `_source` of a GET-by-id response, or `None` when not found.
pub fn parse_get_response(body: &str) -> Result<Option<Value>, ClientError> {
    let raw: Value = serde_json::from_str(body)?;
    if raw.get("found").and_then(Value::as_bool) == Some(false) {
        return Ok(None);
    }
    Ok(raw.get("_source").cloned())
}
