//! Per-job scheduling loop.
//!
//! Each job gets one tokio task that runs [`Crawler::run_once`], then waits
//! for the job's `update_rate` before the next run. The wait listens on the
//! job's [`CloseSignal`], so a shutdown wakes the worker immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crawler::Crawler;
use crate::error::CrawlError;

/// Cooperative close flag plus a wake-up for sleeping workers.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    wake: Notify,
}

impl CloseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise the flag, then wake anything waiting on it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Resolves once the signal is closed.
    pub async fn closed(&self) {
        while !self.wait(Duration::from_secs(3600)).await {}
    }

    /// Wait up to `timeout`. Returns `true` when the signal was closed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a close in between is not lost.
        notified.as_mut().enable();
        if self.is_closed() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(timeout) => self.is_closed(),
        }
    }
}

/// What a worker did before it stopped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub runs: u64,
    pub failures: u64,
    pub indexed: u64,
    pub deleted: u64,
}

pub struct Worker {
    crawler: Arc<Crawler>,
    /// Number of runs before stopping; `None` loops until closed.
    max_runs: Option<u64>,
}

impl Worker {
    pub fn new(crawler: Arc<Crawler>, max_runs: Option<u64>) -> Self {
        Self { crawler, max_runs }
    }

    pub fn spawn(self) -> WorkerHandle {
        let name = self.crawler.job().name.clone();
        let signal = self.crawler.signal().clone();
        let task = tokio::spawn(async move { self.run().await });
        WorkerHandle { name, signal, task }
    }

    pub async fn run(&self) -> WorkerSummary {
        let job = self.crawler.job();
        let signal = self.crawler.signal();
        let mut summary = WorkerSummary::default();

        loop {
            if signal.is_closed() {
                break;
            }

            summary.runs += 1;
            match self.crawler.run_once().await {
                Ok(report) => {
                    summary.indexed += report.stats.indexed;
                    summary.deleted += report.stats.deleted;
                }
                Err(CrawlError::Closed) => {
                    info!(job = %job.name, "run aborted by shutdown");
                    break;
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(job = %job.name, error = %e, "run failed");
                }
            }

            if self.max_runs.is_some_and(|max| summary.runs >= max) {
                debug!(job = %job.name, runs = summary.runs, "run limit reached");
                break;
            }

            debug!(job = %job.name, wait = ?job.fs.update_rate, "waiting for next run");
            if signal.wait(job.fs.update_rate).await {
                break;
            }
        }

        info!(job = %job.name, runs = summary.runs, failures = summary.failures, "worker stopped");
        summary
    }
}

pub struct WorkerHandle {
    name: String,
    signal: Arc<CloseSignal>,
    task: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn close(&self) {
        self.signal.close();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to finish on its own or for `shutdown`. After a
    /// shutdown the worker gets `timeout` to stop; one still running after
    /// that is logged and left detached, and `None` is returned.
    pub async fn join(mut self, shutdown: &CloseSignal, timeout: Duration) -> Option<WorkerSummary> {
        let early = tokio::select! {
            result = &mut self.task => Some(result),
            _ = shutdown.closed() => None,
        };
        if let Some(result) = early {
            return self.finished(result);
        }
        self.signal.close();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(result) => self.finished(result),
            Err(_) => {
                warn!(job = %self.name, timeout = ?timeout, "worker still running after close timeout");
                None
            }
        }
    }

    fn finished(&self, result: Result<WorkerSummary, tokio::task::JoinError>) -> Option<WorkerSummary> {
        match result {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(job = %self.name, error = %e, "worker task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_wait_times_out_when_open() {
        let signal = CloseSignal::new();
        assert!(!signal.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_immediately() {
        let signal = CloseSignal::new();
        let waiter = signal.clone();
        let started = Instant::now();
        let task = tokio::spawn(async move { waiter.wait(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.close();
        assert!(task.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let signal = CloseSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        signal.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_close_returns_at_once() {
        let signal = CloseSignal::new();
        signal.close();
        assert!(signal.is_closed());
        assert!(signal.wait(Duration::from_secs(60)).await);
    }
}
