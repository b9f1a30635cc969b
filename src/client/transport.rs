//! HTTP transport underneath the indexing client.
//!
//! The client addresses one endpoint per request and needs to tell a
//! refused connection (fail over to another endpoint) from everything else
//! (surface to the caller). [`Transport`] captures exactly that split so the
//! failover logic can be tested without sockets.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;

use crate::config::BackendConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path and query, starting with `/`.
    pub path: String,
    pub body: Option<String>,
    /// Sent as `Content-Type` when a body is present.
    pub content_type: &'static str,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            content_type: "application/json",
        }
    }

    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self.content_type = "application/json";
        self
    }

    pub fn ndjson(mut self, body: String) -> Self {
        self.body = Some(body);
        self.content_type = "application/x-ndjson";
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The connection attempt itself failed; the request never reached the server.
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError>;

    async fn close(&self) {}
}

/// `reqwest`-backed transport with optional basic or API-key auth.
pub struct HttpTransport {
    client: reqwest::Client,
    authorization: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(5).min(config.request_timeout))
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;

        let authorization = match (&config.api_key, &config.username, &config.password) {
            (Some(key), _, _) => Some(format!("ApiKey {}", key)),
            (None, Some(user), Some(pass)) => Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
            )),
            _ => None,
        };

        Ok(Self {
            client,
            authorization,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, &url);
        if let Some(auth) = &self.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Other(format!("failed to read response body: {}", e)))?;
        Ok(Response { status, body })
    }
}
