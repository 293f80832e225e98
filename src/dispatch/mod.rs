//! Batch retrieval and the job-queue boundary.
//!
//! Everything here sits on top of a [`Retriever`], normally an
//! [`EngineSelector`]: ordered fan-out with [`fetch_many`], a URL-keyed
//! [`ContentCache`], and a [`WorkerPool`] that drains jobs from a
//! [`JobSupplier`] with bounded concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{DEFAULT_MAX_CONCURRENCY, Settings};
use crate::engines::EngineTier;
use crate::selector::{EngineSelector, FetchOptions, FetchResponse, FetchResult};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Anything that turns a URL into content.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, url: &str, options: FetchOptions) -> FetchResult<FetchResponse>;
}

#[async_trait]
impl Retriever for EngineSelector {
    async fn retrieve(&self, url: &str, options: FetchOptions) -> FetchResult<FetchResponse> {
        self.fetch_with(url, options).await
    }
}

/// Fetch every URL with at most `limit` in flight. Results keep input order.
pub async fn fetch_many<R, I, S>(retriever: &R, urls: I, limit: usize) -> Vec<FetchResult<FetchResponse>>
where
    R: Retriever + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let permits = Semaphore::new(limit.max(1));
    let permits = &permits;
    let fetches = urls.into_iter().map(|url| async move {
        // The semaphore is local and never closed.
        let _permit = permits.acquire().await.ok();
        retriever.retrieve(url.as_ref(), FetchOptions::default()).await
    });
    join_all(fetches).await
}

/// Cache key for `url`: lower-case host, no fragment, no trailing slash.
pub fn normalize_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return url.trim().trim_end_matches('/').to_string();
    };

    let mut key = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    if let Some(port) = parsed.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

/// Content store consulted before retrieval.
#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn get(&self, url: &str) -> Option<String>;
    async fn put(&self, url: &str, content: &str);
    async fn remove(&self, url: &str) -> bool;
}

#[derive(Debug)]
struct CacheEntry {
    stored_at: Instant,
    content: String,
}

/// In-process [`ContentCache`] with a fixed time-to-live.
#[derive(Debug)]
pub struct MemoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - entries.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn get(&self, url: &str) -> Option<String> {
        let key = normalize_url(url);
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            entries.remove(&key);
            return None;
        }
        Some(entry.content.clone())
    }

    async fn put(&self, url: &str, content: &str) {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        entries.insert(
            normalize_url(url),
            CacheEntry {
                stored_at: Instant::now(),
                content: content.to_string(),
            },
        );
    }

    async fn remove(&self, url: &str) -> bool {
        self.entries.lock().await.remove(&normalize_url(url)).is_some()
    }
}

/// A unit of work handed over by the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_tier: Option<EngineTier>,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            forced_tier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub url: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<EngineTier>,
    #[serde(default)]
    pub cached: bool,
}

impl JobResult {
    pub fn succeeded(url: String, data: String, tier: Option<EngineTier>, cached: bool) -> Self {
        Self {
            url,
            success: true,
            data: Some(data),
            error: None,
            tier,
            cached,
        }
    }

    pub fn failed(url: String, error: String) -> Self {
        Self {
            url,
            success: false,
            data: None,
            error: Some(error),
            tier: None,
            cached: false,
        }
    }
}

/// Source of jobs and sink for their results.
#[async_trait]
pub trait JobSupplier: Send + Sync {
    /// Next job, or `None` once the queue is drained.
    async fn next_job(&self) -> Option<Job>;

    async fn complete(&self, result: JobResult);
}

/// [`JobSupplier`] over a pair of tokio channels.
#[derive(Debug)]
pub struct ChannelSupplier {
    jobs: Mutex<mpsc::Receiver<Job>>,
    results: mpsc::Sender<JobResult>,
}

impl ChannelSupplier {
    /// Returns the supplier, the job sender and the result receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Job>, mpsc::Receiver<JobResult>) {
        let (job_tx, job_rx) = mpsc::channel(capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(capacity.max(1));
        let supplier = Self {
            jobs: Mutex::new(job_rx),
            results: result_tx,
        };
        (supplier, job_tx, result_rx)
    }
}

#[async_trait]
impl JobSupplier for ChannelSupplier {
    async fn next_job(&self) -> Option<Job> {
        self.jobs.lock().await.recv().await
    }

    async fn complete(&self, result: JobResult) {
        if self.results.send(result).await.is_err() {
            log::warn!("job result dropped: receiver closed");
        }
    }
}

/// Counters for one [`WorkerPool::drain`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
}

impl WorkerSummary {
    fn absorb(&mut self, joined: Result<JobResult, JoinError>) {
        self.processed += 1;
        match joined {
            Ok(result) => {
                if result.success {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
                if result.cached {
                    self.cache_hits += 1;
                }
            }
            Err(err) => {
                log::warn!("job task panicked: {err}");
                self.failed += 1;
            }
        }
    }
}

/// Drains a [`JobSupplier`] through a [`Retriever`] with bounded concurrency.
pub struct WorkerPool {
    retriever: Arc<dyn Retriever>,
    cache: Option<Arc<dyn ContentCache>>,
    concurrency: usize,
    job_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            cache: None,
            concurrency: DEFAULT_MAX_CONCURRENCY,
            job_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_settings(retriever: Arc<dyn Retriever>, settings: &Settings) -> Self {
        Self::new(retriever).with_concurrency(settings.max_concurrency)
    }

    pub fn with_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Deadline applied to each job's whole ladder.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops intake and cancels in-flight fetches.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process jobs until the supplier runs dry or the pool is cancelled.
    /// Every job taken from the supplier gets a result, including jobs cut
    /// short by cancellation.
    pub async fn drain(&self, supplier: Arc<dyn JobSupplier>) -> WorkerSummary {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = WorkerSummary::default();

        log::info!("worker pool draining with {} slots", self.concurrency);

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = supplier.next_job() => job,
            };
            let Some(job) = job else {
                break;
            };
            log::debug!("picked up job for {}", job.url);

            let retriever = Arc::clone(&self.retriever);
            let cache = self.cache.clone();
            let supplier = Arc::clone(&supplier);
            let options = self.job_options(&job);

            tasks.spawn(async move {
                let _permit = permit;
                let result = run_job(retriever.as_ref(), cache.as_deref(), job, options).await;
                supplier.complete(result.clone()).await;
                result
            });

            while let Some(joined) = tasks.try_join_next() {
                summary.absorb(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            summary.absorb(joined);
        }

        log::info!(
            "worker pool drained: {} processed, {} succeeded, {} failed, {} from cache",
            summary.processed,
            summary.succeeded,
            summary.failed,
            summary.cache_hits
        );
        summary
    }

    fn job_options(&self, job: &Job) -> FetchOptions {
        let mut options = FetchOptions::new().with_cancel(self.cancel.child_token());
        if let Some(timeout) = self.job_timeout {
            options = options.with_deadline(timeout);
        }
        if let Some(tier) = job.forced_tier {
            options = options.with_forced_tier(tier);
        }
        options
    }
}

async fn run_job(
    retriever: &dyn Retriever,
    cache: Option<&dyn ContentCache>,
    job: Job,
    options: FetchOptions,
) -> JobResult {
    if let Some(cache) = cache
        && let Some(content) = cache.get(&job.url).await
    {
        log::debug!("cache hit for {}", job.url);
        return JobResult::succeeded(job.url, content, None, true);
    }

    match retriever.retrieve(&job.url, options).await {
        Ok(response) => {
            if let Some(cache) = cache {
                cache.put(&job.url, &response.content).await;
            }
            JobResult::succeeded(job.url, response.content, Some(response.tier), false)
        }
        Err(err) => {
            log::warn!("job for {} failed: {err}", job.url);
            JobResult::failed(job.url, err.to_string())
        }
    }
}
