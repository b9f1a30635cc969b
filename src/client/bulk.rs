//! Batched writes with per-operation outcomes.
//!
//! [`BulkProcessor`] queues index/delete operations and sends them as one
//! batched request when any threshold is reached:
//!
//! | Trigger | Setting |
//! |---------|---------|
//! | queued operations | `bulk_size` |
//! | queued payload bytes | `byte_size` |
//! | time since the last flush | `flush_interval` |
//! | explicit request | [`BulkProcessor::flush`] |
//!
//! A single flush task executes batches one after the other, so operations
//! queued before a flush always reach the backend before operations queued
//! after it. Each operation's outcome is reported to a [`BulkListener`];
//! failures matching the configured `retry_on` signature are resent with
//! exponential backoff, up to `max_retries` times. Later operations on the
//! same document in that batch are resent with it, in their original order,
//! so a retried index never lands after a delete submitted behind it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::ClientError;

// ═══════════════════════════════════════════════════════════════════════
// Operations and outcomes
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Index,
    Delete,
}

/// A queued write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub kind: OpKind,
    pub index: String,
    pub id: String,
    /// Ingest pipeline applied by the backend (index operations only).
    pub pipeline: Option<String>,
    pub document: Option<Value>,
}

impl BulkOperation {
    pub fn index(index: &str, id: &str, document: Value, pipeline: Option<String>) -> Self {
        Self {
            kind: OpKind::Index,
            index: index.to_string(),
            id: id.to_string(),
            pipeline,
            document: Some(document),
        }
    }

    pub fn delete(index: &str, id: &str) -> Self {
        Self {
            kind: OpKind::Delete,
            index: index.to_string(),
            id: id.to_string(),
            pipeline: None,
            document: None,
        }
    }

    fn key(&self) -> (&str, &str) {
        (&self.index, &self.id)
    }

    /// Approximate number of bytes this operation adds to a request body.
    pub fn estimated_size(&self) -> u64 {
        let action = 48 + self.index.len() + self.id.len();
        let document = self
            .document
            .as_ref()
            .and_then(|d| serde_json::to_vec(d).ok())
            .map_or(0, |bytes| bytes.len() + 1);
        (action + document) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub status: u16,
    pub error_type: String,
    pub reason: String,
}

impl ItemFailure {
    /// Whether this failure carries the retryable error `signature`.
    pub fn matches(&self, signature: &str) -> bool {
        !signature.is_empty() && (self.error_type == signature || self.reason.contains(signature))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// `not_found` is set when a delete targeted an id the backend didn't have.
    Success { not_found: bool },
    Failed(ItemFailure),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Executor and listener seams
// ═══════════════════════════════════════════════════════════════════════

/// Sends one batch and returns one outcome per operation, in order.
#[async_trait]
pub trait BulkExecutor: Send + Sync {
    async fn execute(&self, ops: &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError>;
}

/// Receives the outcome of every operation the processor sends.
pub trait BulkListener: Send + Sync {
    fn before_bulk(&self, _batch: u64, _ops: usize) {}

    fn on_success(&self, _batch: u64, _op: &BulkOperation) {}

    /// An operation failed for good (not retryable or retries exhausted).
    fn on_failure(&self, _batch: u64, _op: &BulkOperation, _failure: &ItemFailure) {}

    fn on_retry(&self, _batch: u64, _op: &BulkOperation, _attempt: u32) {}

    /// The whole request failed; none of `ops` were applied.
    fn on_batch_error(&self, _batch: u64, _ops: &[BulkOperation], _error: &ClientError) {}
}

/// Default listener: logs failures and keeps running totals.
#[derive(Debug, Default)]
pub struct LoggingListener {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(succeeded, failed)` operation counts so far.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

impl BulkListener for LoggingListener {
    fn before_bulk(&self, batch: u64, ops: usize) {
        debug!(batch, ops, "sending bulk request");
    }

    fn on_success(&self, _batch: u64, _op: &BulkOperation) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failure(&self, batch: u64, op: &BulkOperation, failure: &ItemFailure) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            batch,
            index = %op.index,
            id = %op.id,
            status = failure.status,
            error_type = %failure.error_type,
            reason = %failure.reason,
            "bulk operation failed"
        );
    }

    fn on_retry(&self, batch: u64, op: &BulkOperation, attempt: u32) {
        debug!(batch, id = %op.id, attempt, "retrying bulk operation");
    }

    fn on_batch_error(&self, batch: u64, ops: &[BulkOperation], error: &ClientError) {
        self.failed.fetch_add(ops.len() as u64, Ordering::Relaxed);
        error!(batch, ops = ops.len(), error = %error, "bulk request failed");
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub bulk_size: usize,
    pub byte_size: u64,
    pub flush_interval: Duration,
    pub retry_on: String,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl BulkSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            bulk_size: config.bulk_size.max(1),
            byte_size: config.byte_size,
            flush_interval: config.flush_interval,
            retry_on: config.retry_on.clone(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based): backoff × 2^(attempt-1), capped at ×32.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

/// Whole-request failures worth resending as-is.
fn is_transient(error: &ClientError) -> bool {
    match error {
        ClientError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
        ClientError::Connect { .. } => true,
        _ => false,
    }
}

#[derive(Default)]
struct Queue {
    ops: Vec<BulkOperation>,
    bytes: u64,
}

struct Shared {
    settings: BulkSettings,
    executor: Arc<dyn BulkExecutor>,
    listener: Arc<dyn BulkListener>,
    queue: Mutex<Queue>,
    /// Held while batches execute so they go out one at a time, in order.
    exec: tokio::sync::Mutex<()>,
    wake: Notify,
    closed: AtomicBool,
    batches: AtomicU64,
    /// First request-level error not yet returned by `drain`.
    error: Mutex<Option<ClientError>>,
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_batch(&self) -> Vec<BulkOperation> {
        let mut queue = self.lock_queue();
        let count = queue.ops.len().min(self.settings.bulk_size);
        let batch: Vec<BulkOperation> = queue.ops.drain(..count).collect();
        let sent: u64 = batch.iter().map(BulkOperation::estimated_size).sum();
        queue.bytes = queue.bytes.saturating_sub(sent);
        batch
    }

    /// Send everything queued, batch by batch.
    async fn flush_pending(&self) {
        let _guard = self.exec.lock().await;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            self.execute_batch(batch).await;
        }
    }

    async fn execute_batch(&self, ops: Vec<BulkOperation>) {
        let batch = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = ops;
        let mut attempt: u32 = 0;

        loop {
            self.listener.before_bulk(batch, pending.len());
            match self.executor.execute(&pending).await {
                Ok(outcomes) => {
                    let mut retry = Vec::new();
                    // Documents with an operation being retried.
                    let mut held: HashSet<(String, String)> = HashSet::new();
                    for (op, outcome) in pending.into_iter().zip(outcomes) {
                        let (index, id) = op.key();
                        if held.contains(&(index.to_string(), id.to_string())) {
                            retry.push(op);
                            continue;
                        }
                        match outcome {
                            ItemOutcome::Success { .. } => self.listener.on_success(batch, &op),
                            ItemOutcome::Failed(failure)
                                if failure.matches(&self.settings.retry_on)
                                    && attempt < self.settings.max_retries =>
                            {
                                held.insert((index.to_string(), id.to_string()));
                                retry.push(op);
                            }
                            ItemOutcome::Failed(failure) => {
                                self.listener.on_failure(batch, &op, &failure)
                            }
                        }
                    }
                    if retry.is_empty() {
                        return;
                    }
                    pending = retry;
                }
                Err(e) if is_transient(&e) && attempt < self.settings.max_retries => {
                    warn!(batch, attempt, error = %e, "bulk request failed, retrying");
                }
                Err(e) => {
                    self.listener.on_batch_error(batch, &pending, &e);
                    self.error
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .get_or_insert(e);
                    return;
                }
            }

            attempt += 1;
            for op in &pending {
                self.listener.on_retry(batch, op, attempt);
            }
            tokio::time::sleep(self.settings.backoff(attempt)).await;
        }
    }
}

async fn flush_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.settings.flush_interval) => {}
            _ = shared.wake.notified() => {}
        }
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        shared.flush_pending().await;
    }
    debug!("bulk flush task stopped");
}

pub struct BulkProcessor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BulkProcessor {
    pub fn new(
        settings: BulkSettings,
        executor: Arc<dyn BulkExecutor>,
        listener: Arc<dyn BulkListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                executor,
                listener,
                queue: Mutex::new(Queue::default()),
                exec: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                batches: AtomicU64::new(0),
                error: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BulkSettings {
        &self.shared.settings
    }

    /// Spawn the background flush task. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        *task = Some(tokio::spawn(flush_loop(self.shared.clone())));
    }

    /// Queue an operation. Safe to call from many tasks at once.
    pub fn submit(&self, op: BulkOperation) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let size = op.estimated_size();
        let full = {
            let mut queue = self.shared.lock_queue();
            queue.ops.push(op);
            queue.bytes += size;
            queue.ops.len() >= self.shared.settings.bulk_size
                || queue.bytes >= self.shared.settings.byte_size
        };
        if full {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.shared.lock_queue().ops.len()
    }

    /// Ask the flush task to send the queue now. Does not wait.
    pub fn flush(&self) {
        self.shared.wake.notify_one();
    }

    /// Send everything queued and wait for it. Returns the first request-level
    /// error seen since the previous drain.
    pub async fn drain(&self) -> Result<(), ClientError> {
        self.shared.flush_pending().await;
        let error = self
            .shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop accepting operations, drain the queue, and stop the flush task.
    /// Idempotent; bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.wake.notify_one();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();

        let shutdown = async {
            if let Some(task) = &task {
                // Wait for the task to observe the close flag.
                while !task.is_finished() {
                    self.shared.wake.notify_one();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            self.drain().await
        };

        let outcome = tokio::time::timeout(timeout, shutdown).await;
        match outcome {
            Ok(result) => {
                info!(batches = self.shared.batches.load(Ordering::Relaxed), "bulk processor closed");
                result
            }
            Err(_) => {
                if let Some(task) = task {
                    task.abort();
                }
                warn!(
                    pending = self.pending(),
                    ?timeout,
                    "bulk processor did not drain before the close timeout"
                );
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Respond = dyn Fn(u32, &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError> + Send + Sync;

    struct FakeExecutor {
        calls: Mutex<Vec<Vec<String>>>,
        respond: Box<Respond>,
    }

    impl FakeExecutor {
        fn new(
            respond: impl Fn(u32, &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(|_, ops| Ok(vec![ItemOutcome::Success { not_found: false }; ops.len()]))
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BulkExecutor for FakeExecutor {
        async fn execute(&self, ops: &[BulkOperation]) -> Result<Vec<ItemOutcome>, ClientError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(ops.iter().map(|o| o.id.clone()).collect());
                calls.len() as u32
            };
            (self.respond)(attempt, ops)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl BulkListener for Recorder {
        fn on_success(&self, _batch: u64, op: &BulkOperation) {
            self.events.lock().unwrap().push(format!("ok:{}", op.id));
        }
        fn on_failure(&self, _batch: u64, op: &BulkOperation, failure: &ItemFailure) {
            self.events
                .lock()
                .unwrap()
                .push(format!("fail:{}:{}", op.id, failure.error_type));
        }
        fn on_batch_error(&self, _batch: u64, ops: &[BulkOperation], _error: &ClientError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("batch_error:{}", ops.len()));
        }
    }

    fn settings() -> BulkSettings {
        BulkSettings {
            bulk_size: 100,
            byte_size: 10 * 1024 * 1024,
            flush_interval: Duration::from_secs(3600),
            retry_on: "es_rejected_execution_exception".into(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn op(id: &str) -> BulkOperation {
        BulkOperation::index("docs", id, json!({"n": id}), None)
    }

    fn failure(kind: &str) -> ItemOutcome {
        ItemOutcome::Failed(ItemFailure {
            status: 400,
            error_type: kind.into(),
            reason: "nope".into(),
        })
    }

    async fn wait_for_calls(executor: &FakeExecutor, n: usize) {
        for _ in 0..200 {
            if executor.calls().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executor saw {} calls, expected {}", executor.calls().len(), n);
    }

    #[tokio::test]
    async fn test_partial_failure_reported_per_operation() {
        let executor = FakeExecutor::new(|_, ops| {
            Ok(ops
                .iter()
                .map(|op| {
                    if op.id == "2" {
                        failure("mapper_parsing_exception")
                    } else {
                        ItemOutcome::Success { not_found: false }
                    }
                })
                .collect())
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        for id in ["1", "2", "3"] {
            bulk.submit(op(id)).unwrap();
        }
        bulk.drain().await.unwrap();

        assert_eq!(executor.calls().len(), 1);
        assert_eq!(
            recorder.events(),
            vec!["ok:1", "fail:2:mapper_parsing_exception", "ok:3"]
        );
    }

    #[tokio::test]
    async fn test_retry_only_failed_operation() {
        let executor = FakeExecutor::new(|attempt, ops| {
            Ok(ops
                .iter()
                .map(|op| {
                    if attempt == 1 && op.id == "2" {
                        failure("es_rejected_execution_exception")
                    } else {
                        ItemOutcome::Success { not_found: false }
                    }
                })
                .collect())
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        for id in ["1", "2", "3"] {
            bulk.submit(op(id)).unwrap();
        }
        bulk.drain().await.unwrap();

        assert_eq!(executor.calls(), vec![vec!["1", "2", "3"], vec!["2"]]);
        assert_eq!(recorder.events(), vec!["ok:1", "ok:3", "ok:2"]);
    }

    #[tokio::test]
    async fn test_retry_keeps_same_document_order() {
        let sent: Arc<Mutex<Vec<Vec<(String, OpKind)>>>> = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let executor = FakeExecutor::new(move |attempt, ops| {
            log.lock()
                .unwrap()
                .push(ops.iter().map(|o| (o.id.clone(), o.kind)).collect());
            Ok(ops
                .iter()
                .map(|op| {
                    if attempt == 1 && op.kind == OpKind::Index {
                        failure("es_rejected_execution_exception")
                    } else {
                        ItemOutcome::Success { not_found: false }
                    }
                })
                .collect())
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        bulk.submit(op("x")).unwrap();
        bulk.submit(BulkOperation::delete("docs", "x")).unwrap();
        bulk.submit(BulkOperation::delete("docs", "y")).unwrap();
        bulk.drain().await.unwrap();

        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        // The delete of "x" goes out again behind its index; "y" is done.
        assert_eq!(
            sent[1],
            vec![("x".to_string(), OpKind::Index), ("x".to_string(), OpKind::Delete)]
        );
        assert_eq!(recorder.events(), vec!["ok:y", "ok:x", "ok:x"]);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let executor = FakeExecutor::new(|_, ops| {
            Ok(vec![failure("es_rejected_execution_exception"); ops.len()])
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        bulk.submit(op("1")).unwrap();
        bulk.drain().await.unwrap();

        // First attempt plus max_retries.
        assert_eq!(executor.calls().len(), 3);
        assert_eq!(recorder.events(), vec!["fail:1:es_rejected_execution_exception"]);
    }

    #[tokio::test]
    async fn test_throttled_batch_is_resent() {
        let executor = FakeExecutor::new(|attempt, ops| {
            if attempt == 1 {
                Err(ClientError::Http {
                    status: 429,
                    body: "too many requests".into(),
                })
            } else {
                Ok(vec![ItemOutcome::Success { not_found: false }; ops.len()])
            }
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        bulk.submit(op("1")).unwrap();
        bulk.drain().await.unwrap();
        assert_eq!(executor.calls().len(), 2);
        assert_eq!(recorder.events(), vec!["ok:1"]);
    }

    #[tokio::test]
    async fn test_exhausted_endpoints_surface_from_drain() {
        let executor = FakeExecutor::new(|_, _| {
            Err(ClientError::AllEndpointsExhausted {
                tried: vec!["http://h1:9200".into()],
            })
        });
        let recorder = Arc::new(Recorder::default());
        let bulk = BulkProcessor::new(settings(), executor.clone(), recorder.clone());
        bulk.submit(op("1")).unwrap();
        bulk.submit(op("2")).unwrap();

        let err = bulk.drain().await.unwrap_err();
        assert!(matches!(err, ClientError::AllEndpointsExhausted { .. }));
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(recorder.events(), vec!["batch_error:2"]);
        // Reported once.
        bulk.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_first_unreported_error_is_kept() {
        let executor = FakeExecutor::new(|attempt, _| {
            Err(ClientError::Http {
                status: 400,
                body: format!("bad request {}", attempt),
            })
        });
        let bulk = BulkProcessor::new(settings(), executor.clone(), Arc::new(LoggingListener::new()));
        for id in ["1", "2", "3"] {
            bulk.submit(op(id)).unwrap();
            bulk.shared.flush_pending().await;
        }
        assert_eq!(executor.calls().len(), 3);

        match bulk.drain().await {
            Err(ClientError::Http { body, .. }) => assert_eq!(body, "bad request 1"),
            other => panic!("expected the first failure, got {:?}", other),
        }
        bulk.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_count_threshold_triggers_flush() {
        let executor = FakeExecutor::ok();
        let bulk = BulkProcessor::new(
            BulkSettings {
                bulk_size: 2,
                ..settings()
            },
            executor.clone(),
            Arc::new(LoggingListener::new()),
        );
        bulk.start();
        bulk.submit(op("1")).unwrap();
        bulk.submit(op("2")).unwrap();
        wait_for_calls(&executor, 1).await;
        assert_eq!(executor.calls()[0], vec!["1", "2"]);
        bulk.close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_triggers_flush() {
        let executor = FakeExecutor::ok();
        let bulk = BulkProcessor::new(
            BulkSettings {
                flush_interval: Duration::from_millis(20),
                ..settings()
            },
            executor.clone(),
            Arc::new(LoggingListener::new()),
        );
        bulk.start();
        bulk.submit(op("1")).unwrap();
        wait_for_calls(&executor, 1).await;
        bulk.close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_boundaries_keep_fifo_order() {
        let executor = FakeExecutor::ok();
        let bulk = BulkProcessor::new(settings(), executor.clone(), Arc::new(LoggingListener::new()));
        bulk.submit(op("a")).unwrap();
        bulk.submit(op("b")).unwrap();
        bulk.drain().await.unwrap();
        bulk.submit(op("c")).unwrap();
        bulk.drain().await.unwrap();
        assert_eq!(executor.calls(), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[tokio::test]
    async fn test_close_drains_and_is_idempotent() {
        let executor = FakeExecutor::ok();
        let listener = Arc::new(LoggingListener::new());
        let bulk = BulkProcessor::new(settings(), executor.clone(), listener.clone());
        bulk.start();
        bulk.submit(op("1")).unwrap();
        bulk.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(executor.calls(), vec![vec!["1"]]);
        assert_eq!(listener.totals(), (1, 0));

        bulk.close(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(bulk.submit(op("2")), Err(ClientError::Closed)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let s = BulkSettings {
            retry_backoff: Duration::from_millis(100),
            ..settings()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(2), Duration::from_millis(200));
        assert_eq!(s.backoff(4), Duration::from_millis(800));
        assert_eq!(s.backoff(20), Duration::from_millis(3200));
    }

    #[test]
    fn test_failure_signature_match() {
        let f = ItemFailure {
            status: 429,
            error_type: "es_rejected_execution_exception".into(),
            reason: "queue full".into(),
        };
        assert!(f.matches("es_rejected_execution_exception"));
        assert!(f.matches("queue full"));
        assert!(!f.matches(""));
        assert!(!f.matches("mapper_parsing_exception"));
    }
}
