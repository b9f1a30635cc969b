//! Wires configuration into running crawlers.
//!
//! | Command | Entry point |
//! |---------|-------------|
//! | `fscrawl run` | [`run`] |
//! | `fscrawl status` | [`status`] |
//! | `fscrawl restart` | [`restart`] |
//!
//! Shutdown order for `run`: workers are closed first so no new item
//! enters a pipeline, then every router flushes and closes its outputs,
//! then the backend client drains its queue and closes its transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::client::{IndexClient, DEFAULT_CLOSE_TIMEOUT};
use crate::config::{Config, JobConfig};
use crate::crawler::Crawler;
use crate::extract::DefaultExtractor;
use crate::registry::{BuildContext, PluginRegistry};
use crate::service::{DocumentService, InMemoryService};
use crate::source::LocalFileSource;
use crate::state::{FileStateStore, InMemoryStateStore, StateStore};
use crate::worker::{CloseSignal, Worker, WorkerSummary};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Jobs to run; empty runs every configured job.
    pub jobs: Vec<String>,
    /// Runs per job before stopping; `None` loops until interrupted.
    pub loops: Option<u64>,
    /// Discard run state before the first run.
    pub restart: bool,
    /// Bound on each shutdown phase.
    pub close_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            loops: None,
            restart: false,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Per-job outcome of [`run_with`]. `None` when the worker did not stop in time.
pub type RunSummary = Vec<(String, Option<WorkerSummary>)>;

/// The configured jobs named in `names`, or all of them.
pub fn select_jobs<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a JobConfig>> {
    if names.is_empty() {
        if config.jobs.is_empty() {
            bail!("no jobs configured");
        }
        return Ok(config.jobs.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            config
                .jobs
                .iter()
                .find(|job| &job.name == name)
                .with_context(|| format!("unknown job '{}'", name))
        })
        .collect()
}

/// Indices a job writes to, including indices named by its outputs.
fn job_indices(job: &JobConfig) -> Vec<String> {
    let mut indices = vec![job.index().to_string()];
    if job.fs.index_folders {
        indices.push(job.folder_index());
    }
    for output in &job.outputs {
        if let Some(index) = output.options.get("index").and_then(|v| v.as_str()) {
            indices.push(index.to_string());
        }
    }
    indices
}

/// `fscrawl run`: crawl against the configured backend, or an in-memory one
/// for a dry run.
pub async fn run(config: &Config, options: RunOptions, dry_run: bool) -> Result<()> {
    let summary = if dry_run {
        let service = Arc::new(InMemoryService::new());
        let summary = run_with(config, &options, service.clone(), Arc::new(InMemoryStateStore::new())).await?;
        println!("dry run: {} write(s) recorded, nothing sent", service.operations().len());
        summary
    } else {
        let client = IndexClient::new(&config.backend)
            .context("Failed to create backend client")?
            .close_timeout(options.close_timeout);
        let state = FileStateStore::new(config.state.dir());
        run_with(config, &options, Arc::new(client), Arc::new(state)).await?
    };

    let mut failures = 0;
    for (name, outcome) in &summary {
        match outcome {
            Some(s) => {
                println!(
                    "{}: {} run(s), {} failed, {} indexed, {} deleted",
                    name, s.runs, s.failures, s.indexed, s.deleted
                );
                failures += s.failures;
            }
            None => println!("{}: did not stop cleanly", name),
        }
    }
    if failures > 0 {
        bail!("{} run(s) failed", failures);
    }
    Ok(())
}

/// Run the selected jobs against `service` and `state` until each worker
/// reaches its run limit or the process is interrupted.
pub async fn run_with(
    config: &Config,
    options: &RunOptions,
    service: Arc<dyn DocumentService>,
    state: Arc<dyn StateStore>,
) -> Result<RunSummary> {
    let jobs = select_jobs(config, &options.jobs)?;

    if options.restart {
        for job in &jobs {
            state
                .reset(&job.name)
                .await
                .with_context(|| format!("Failed to reset run state for job '{}'", job.name))?;
            info!(job = %job.name, "run state discarded");
        }
    }

    let registry = PluginRegistry::with_builtins();
    let ctx = BuildContext {
        service: service.clone(),
        extractor: Arc::new(DefaultExtractor),
    };

    let mut crawlers = Vec::new();
    let mut indices = Vec::new();
    for job in &jobs {
        let router = registry
            .build_router(job, &ctx)
            .with_context(|| format!("Failed to build pipeline for job '{}'", job.name))?;
        let source = LocalFileSource::new(job.fs.follow_symlinks, job.fs.attributes_support);
        let crawler = Crawler::new(
            (*job).clone(),
            Arc::new(source),
            service.clone(),
            Arc::new(router),
            state.clone(),
            CloseSignal::new(),
        )?;
        for index in job_indices(job) {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        crawlers.push(Arc::new(crawler));
    }

    service.start(&indices).await.context("Failed to start backend client")?;

    let handles: Vec<_> = crawlers
        .iter()
        .map(|crawler| Worker::new(crawler.clone(), options.loops).spawn())
        .collect();

    let shutdown = CloseSignal::new();
    let interrupt = {
        let shutdown = shutdown.clone();
        let signals: Vec<_> = crawlers.iter().map(|c| c.signal().clone()).collect();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                for signal in &signals {
                    signal.close();
                }
                shutdown.close();
            }
        })
    };

    let mut summary = Vec::new();
    for handle in handles {
        let name = handle.name().to_string();
        summary.push((name, handle.join(&shutdown, options.close_timeout).await));
    }
    interrupt.abort();

    for crawler in &crawlers {
        let router = crawler.router();
        if let Err(e) = router.flush().await {
            warn!(job = %crawler.job().name, error = %e, "failed to flush outputs");
        }
        if let Err(e) = router.close().await {
            warn!(job = %crawler.job().name, error = %e, "failed to close outputs");
        }
    }

    match tokio::time::timeout(options.close_timeout, service.close()).await {
        Ok(Ok(())) => Ok(summary),
        Ok(Err(e)) => Err(e).context("Backend client closed with unsent writes"),
        Err(_) => bail!(
            "backend client did not close within {:?}",
            options.close_timeout
        ),
    }
}

/// `fscrawl status`: print the persisted run state of each job.
pub async fn status(config: &Config, jobs: &[String]) -> Result<()> {
    let store = FileStateStore::new(config.state.dir());
    for job in select_jobs(config, jobs)? {
        match store
            .read(&job.name)
            .await
            .with_context(|| format!("Failed to read run state for job '{}'", job.name))?
        {
            Some(state) => {
                println!("{}", job.name);
                if let Some(last_run) = state.last_run {
                    println!("  last run:   {}", last_run.to_rfc3339());
                }
                if let Some(next_check) = state.next_check {
                    println!("  next check: {}", next_check.to_rfc3339());
                }
                println!("  indexed:    {}", state.indexed);
                println!("  deleted:    {}", state.deleted);
            }
            None => println!("{}: never run", job.name),
        }
    }
    Ok(())
}

/// `fscrawl restart`: discard a job's run state so the next run reindexes everything.
pub async fn restart(config: &Config, job: &str) -> Result<()> {
    let job = select_jobs(config, &[job.to_string()])?[0];
    let store = FileStateStore::new(config.state.dir());
    store
        .reset(&job.name)
        .await
        .with_context(|| format!("Failed to reset run state for job '{}'", job.name))?;
    println!("{}: run state discarded", job.name);
    Ok(())
}
