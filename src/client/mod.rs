//! Resilient indexing client.
//!
//! [`IndexClient`] is the [`DocumentService`] used for real runs. It layers:
//!
//! ```text
//! index()/delete() ──► BulkProcessor ──► ClientCore::execute ──┐
//! search()/get()/exists() ─────────────► ClientCore::perform ──┤
//!                                                             ▼
//!                                        EndpointPool ──► Transport (reqwest)
//! ```
//!
//! Every HTTP call picks an endpoint from the pool. A refused connection on
//! a multi-endpoint pool removes that endpoint and retries the same request
//! on the next one; when no endpoint is left the call fails with
//! [`ClientError::AllEndpointsExhausted`].

pub mod bulk;
pub mod endpoints;
pub mod transport;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::ClientError;
use crate::service::{DocumentService, SearchRequest, SearchResponse};

pub use bulk::{
    BulkExecutor, BulkListener, BulkOperation, BulkProcessor, BulkSettings, ItemFailure,
    ItemOutcome, LoggingListener, OpKind,
};
pub use endpoints::EndpointPool;
pub use transport::{HttpTransport, Method, Request, Response, Transport, TransportError};

use wire::encode_segment;

/// Default bound on draining the bulk queue during [`IndexClient::close`].
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoint selection and failover around a [`Transport`].
pub struct ClientCore {
    pool: EndpointPool,
    transport: Arc<dyn Transport>,
}

impl ClientCore {
    pub fn new(pool: EndpointPool, transport: Arc<dyn Transport>) -> Self {
        Self { pool, transport }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    /// Next endpoint not yet tried for the current request. A periodic
    /// reintroduction can hand back one that just failed, so skip those.
    fn pick(&self, tried: &[String]) -> Result<String, ClientError> {
        for _ in 0..self.pool.len().max(1) {
            let endpoint = self.pool.next()?;
            if !tried.contains(&endpoint) {
                return Ok(endpoint);
            }
        }
        Err(ClientError::AllEndpointsExhausted {
            tried: tried.to_vec(),
        })
    }

    /// Send `request`, failing over to the next endpoint on refused connections.
    pub async fn perform(&self, request: &Request) -> Result<Response, ClientError> {
        let mut tried: Vec<String> = Vec::new();
        loop {
            let endpoint = match self.pick(&tried) {
                Ok(endpoint) => endpoint,
                Err(ClientError::AllEndpointsExhausted { .. }) if !tried.is_empty() => {
                    return Err(ClientError::AllEndpointsExhausted { tried })
                }
                Err(e) => return Err(e),
            };

            match self.transport.send(&endpoint, request).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Connect(message)) => {
                    if self.pool.is_single() {
                        return Err(ClientError::Connect { endpoint, message });
                    }
                    warn!(endpoint = %endpoint, error = %message, "connection failed, trying next endpoint");
                    self.pool.remove(&endpoint);
                    tried.push(endpoint);
                    if tried.len() >= self.pool.len() {
                        return Err(ClientError::AllEndpointsExhausted { tried });
                    }
                }
                Err(TransportError::Other(message)) => {
                    return Err(ClientError::Transport(format!("{}: {}", endpoint, message)))
                }
            }
        }
    }

    /// Like [`perform`](Self::perform), but non-2xx responses become [`ClientError::Http`].
    pub async fn perform_ok(&self, request: &Request) -> Result<Response, ClientError> {
        let response = self.perform(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Http {
                status: response.status,
                body: response.body,
            })
        }
    }
}

#[async_trait]
impl BulkExecutor for ClientCore {
    async fn execute(&self, ops: &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let body = wire::encode_bulk(ops)?;
        let response = self
            .perform_ok(&Request::new(Method::Post, "/_bulk").ndjson(body))
            .await?;
        wire::parse_bulk_response(&response.body, ops)
    }
}

pub struct IndexClient {
    core: Arc<ClientCore>,
    bulk: BulkProcessor,
    create_indices: bool,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl IndexClient {
    /// Client over HTTP with the default logging listener.
    pub fn new(config: &BackendConfig) -> Result<Self, ClientError> {
        let transport =
            HttpTransport::new(config).map_err(|e| ClientError::Config(e.to_string()))?;
        Self::with_transport(config, Arc::new(transport), Arc::new(LoggingListener::new()))
    }

    pub fn with_transport(
        config: &BackendConfig,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn BulkListener>,
    ) -> Result<Self, ClientError> {
        let pool = EndpointPool::new(&config.endpoints, config.reintroduce_every)?;
        let core = Arc::new(ClientCore::new(pool, transport));
        let bulk = BulkProcessor::new(BulkSettings::from_config(config), core.clone(), listener);
        Ok(Self {
            core,
            bulk,
            create_indices: config.create_indices,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            closed: AtomicBool::new(false),
        })
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    pub fn pending(&self) -> usize {
        self.bulk.pending()
    }

    async fn ensure_index(&self, index: &str) -> Result<(), ClientError> {
        let path = format!("/{}", encode_segment(index));
        let response = self.core.perform(&Request::new(Method::Head, &path)).await?;
        match response.status {
            200 => Ok(()),
            404 if self.create_indices => {
                let created = self.core.perform(&Request::new(Method::Put, &path)).await?;
                if created.is_success() || created.body.contains("resource_already_exists_exception") {
                    info!(index, "created index");
                    Ok(())
                } else {
                    Err(ClientError::Http {
                        status: created.status,
                        body: created.body,
                    })
                }
            }
            404 => Err(ClientError::Config(format!(
                "index '{}' does not exist and create_indices is disabled",
                index
            ))),
            status => Err(ClientError::Http {
                status,
                body: response.body,
            }),
        }
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentService for IndexClient {
    async fn start(&self, indices: &[String]) -> Result<(), ClientError> {
        self.check_open()?;
        let info = self.core.perform_ok(&Request::new(Method::Get, "/")).await?;
        let version = serde_json::from_str::<Value>(&info.body)
            .ok()
            .and_then(|v| v["version"]["number"].as_str().map(String::from));
        info!(
            endpoints = ?self.core.pool().configured(),
            version = version.as_deref().unwrap_or("unknown"),
            "connected to backend"
        );
        for index in indices {
            self.ensure_index(index).await?;
        }
        self.bulk.start();
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.bulk.close(self.close_timeout).await;
        self.core.transport.close().await;
        debug!("index client closed");
        result
    }

    async fn index(
        &self,
        index: &str,
        id: &str,
        document: Value,
        pipeline: Option<&str>,
    ) -> Result<(), ClientError> {
        self.check_open()?;
        self.bulk.submit(BulkOperation::index(
            index,
            id,
            document,
            pipeline.map(String::from),
        ))
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), ClientError> {
        self.check_open()?;
        self.bulk.submit(BulkOperation::delete(index, id))
    }

    async fn flush(&self) -> Result<(), ClientError> {
        self.bulk.flush();
        Ok(())
    }

    async fn drain(&self) -> Result<(), ClientError> {
        self.bulk.drain().await
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError> {
        let path = format!("/{}/_search", encode_segment(&request.index));
        let response = self
            .core
            .perform(&Request::new(Method::Post, path).json(&wire::search_body(request)))
            .await?;
        match response.status {
            // The index is created lazily by the first write.
            404 => Ok(SearchResponse::default()),
            s if (200..300).contains(&s) => wire::parse_search_response(&response.body),
            status => Err(ClientError::Http {
                status,
                body: response.body,
            }),
        }
    }

    async fn exists(&self, index: &str, id: &str) -> Result<bool, ClientError> {
        let path = format!("/{}/_doc/{}", encode_segment(index), encode_segment(id));
        let response = self.core.perform(&Request::new(Method::Head, path)).await?;
        match response.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(ClientError::Http {
                status,
                body: response.body,
            }),
        }
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, ClientError> {
        let path = format!("/{}/_doc/{}", encode_segment(index), encode_segment(id));
        let response = self.core.perform(&Request::new(Method::Get, path)).await?;
        match response.status {
            404 => Ok(None),
            s if (200..300).contains(&s) => wire::parse_get_response(&response.body),
            status => Err(ClientError::Http {
                status,
                body: response.body,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Refuses connections to `down` endpoints and answers everything else.
    struct ScriptedTransport {
        down: HashSet<String>,
        sent: Mutex<Vec<(String, Method, String)>>,
    }

    impl ScriptedTransport {
        fn new(down: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                down: down.iter().map(|s| s.to_string()).collect(),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn endpoints_used(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(e, _, _)| e.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((endpoint.to_string(), request.method, request.path.clone()));
            if self.down.contains(endpoint) {
                return Err(TransportError::Connect("connection refused".into()));
            }
            let body = match (request.method, request.path.as_str()) {
                (Method::Post, "/_bulk") => {
                    let actions = request
                        .body
                        .as_deref()
                        .unwrap_or("")
                        .lines()
                        .filter(|l| l.starts_with("{\"index\"") || l.starts_with("{\"delete\""))
                        .count();
                    let items: Vec<Value> = (0..actions)
                        .map(|_| json!({"index": {"status": 201}}))
                        .collect();
                    json!({"errors": false, "items": items}).to_string()
                }
                _ => json!({"version": {"number": "8.0.0"}}).to_string(),
            };
            Ok(Response { status: 200, body })
        }
    }

    fn config(endpoints: &[&str], every: u64) -> BackendConfig {
        BackendConfig {
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            reintroduce_every: every,
            ..BackendConfig::default()
        }
    }

    #[tokio::test]
    async fn test_failover_to_second_endpoint() {
        let transport = ScriptedTransport::new(&["http://h1:9200"]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200", "http://h2:9200"], 10),
            transport.clone(),
            Arc::new(LoggingListener::new()),
        )
        .unwrap();

        client.index("docs", "1", json!({"a": 1}), None).await.unwrap();
        client.drain().await.unwrap();

        assert_eq!(transport.endpoints_used(), vec!["http://h1:9200", "http://h2:9200"]);
        assert_eq!(client.core().pool().live(), vec!["http://h2:9200"]);

        // h1 stays out of rotation until the reintroduction period.
        client.exists("docs", "1").await.unwrap();
        client.exists("docs", "1").await.unwrap();
        assert!(transport.endpoints_used()[2..].iter().all(|e| e == "http://h2:9200"));
    }

    #[tokio::test]
    async fn test_all_endpoints_down_is_exhausted() {
        let transport = ScriptedTransport::new(&["http://h1:9200", "http://h2:9200"]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200", "http://h2:9200"], 10),
            transport.clone(),
            Arc::new(LoggingListener::new()),
        )
        .unwrap();

        match client.get("docs", "1").await {
            Err(ClientError::AllEndpointsExhausted { tried }) => {
                assert_eq!(tried, vec!["http://h1:9200", "http://h2:9200"])
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_with_reintroduction_on_every_call() {
        let transport = ScriptedTransport::new(&["http://h1:9200", "http://h2:9200"]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200", "http://h2:9200"], 1),
            transport.clone(),
            Arc::new(LoggingListener::new()),
        )
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.exists("docs", "1"))
            .await
            .expect("failover loop did not terminate");
        match result {
            Err(ClientError::AllEndpointsExhausted { mut tried }) => {
                tried.sort();
                assert_eq!(tried, vec!["http://h1:9200", "http://h2:9200"]);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(transport.endpoints_used().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_reports_exhaustion_once() {
        let transport = ScriptedTransport::new(&["http://h1:9200", "http://h2:9200"]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200", "http://h2:9200"], 10),
            transport,
            Arc::new(LoggingListener::new()),
        )
        .unwrap();
        client.index("docs", "1", json!({"a": 1}), None).await.unwrap();
        assert!(matches!(
            client.drain().await,
            Err(ClientError::AllEndpointsExhausted { .. })
        ));
        client.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_endpoint_connect_error() {
        let transport = ScriptedTransport::new(&["http://h1:9200"]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200"], 10),
            transport,
            Arc::new(LoggingListener::new()),
        )
        .unwrap();
        assert!(matches!(
            client.exists("docs", "1").await,
            Err(ClientError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_writes() {
        let transport = ScriptedTransport::new(&[]);
        let client = IndexClient::with_transport(
            &config(&["http://h1:9200"], 10),
            transport,
            Arc::new(LoggingListener::new()),
        )
        .unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(
            client.delete("docs", "1").await,
            Err(ClientError::Closed)
        ));
    }
}
