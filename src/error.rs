//! Error types for the crawler, pipeline, and indexing client.
//!
//! Each subsystem gets its own enum so callers can tell a routing
//! predicate failure from a backend outage without string matching.
//! The binary wraps all of them in `anyhow` at the edge.

use std::path::PathBuf;

use thiserror::Error;

/// A routing predicate failed to compile or to evaluate.
///
/// Never coerced to "no match": a predicate that cannot be evaluated
/// must surface, otherwise an output would be silently skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("invalid condition `{expression}`: {message}")]
    Parse { expression: String, message: String },

    #[error("condition `{expression}` failed to evaluate: {message}")]
    Evaluation { expression: String, message: String },
}

/// Errors raised by the resilient indexing client.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Every endpoint in the pool refused the connection.
    #[error("all endpoints exhausted (tried: {})", tried.join(", "))]
    AllEndpointsExhausted { tried: Vec<String> },

    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("client is closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::AllEndpointsExhausted { .. } => "exhausted",
            ClientError::Connect { .. } => "connect",
            ClientError::Http { .. } => "http",
            ClientError::Decode(_) => "decode",
            ClientError::Transport(_) => "transport",
            ClientError::Closed => "closed",
            ClientError::Timeout(_) => "timeout",
            ClientError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}

/// Content extraction failure for a single item.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to read content: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Errors raised while routing one item through filters and outputs.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("failed to read item content: {0}")]
    Io(#[from] std::io::Error),

    #[error("filter `{filter}` failed: {source}")]
    Extract {
        filter: String,
        #[source]
        source: ExtractError,
    },

    #[error("filter `{filter}` rejected the item: {message}")]
    Filter { filter: String, message: String },

    #[error("output `{output}` failed: {source}")]
    Output {
        output: String,
        #[source]
        source: ClientError,
    },
}

/// Run-state persistence failures.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("run-state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run-state file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Errors that end a crawl run.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("scan root does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("cannot read {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to index {}: {source}", path.display())]
    Item {
        path: PathBuf,
        #[source]
        source: PipelineError,
    },

    #[error("invalid job configuration: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] ClientError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    State(#[from] StateError),

    /// The close flag was raised while the run was in progress.
    #[error("run aborted: crawler is closing")]
    Closed,
}
