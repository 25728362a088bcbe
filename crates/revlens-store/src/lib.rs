//! Job/progress store, report cache, and shared HTTP/DB utilities for RevLens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use revlens_core::{
    normalize_query, Job, JobStatus, NormalizedReview, ProgressEvent, Report, StreamFrame,
};

pub const CRATE_NAME: &str = "revlens-store";

/// How long a completed report stays servable from the cache.
pub const REPORT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Buffered frames per job channel; late subscribers replay from history, so
/// the channel only needs to absorb short bursts.
const FRAME_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Job/progress store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown job {0}")]
    UnknownJob(Uuid),
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

struct JobEntry {
    job: Job,
    progress: Vec<ProgressEvent>,
    frames: Vec<StreamFrame>,
    report: Report,
    next_seq: u64,
    tx: broadcast::Sender<StreamFrame>,
}

/// Arena of job records indexed by id. Status and progress-sequence mutation
/// are single-writer (the orchestrator); frame delivery fans out to any
/// number of stream subscribers with full history replay.
#[derive(Default)]
pub struct JobStore {
    inner: RwLock<HashMap<Uuid, JobEntry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, query: &str) -> Job {
        let job = Job::new(query);
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let mut report = Report::default();
        report.product_name = query.to_string();
        let entry = JobEntry {
            job: job.clone(),
            progress: Vec::new(),
            frames: Vec::new(),
            report,
            next_seq: 0,
            tx,
        };
        self.inner.write().await.insert(job.id, entry);
        job
    }

    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        self.inner.read().await.get(&job_id).map(|e| e.job.clone())
    }

    pub async fn report(&self, job_id: Uuid) -> Option<Report> {
        self.inner
            .read()
            .await
            .get(&job_id)
            .map(|e| e.report.clone())
    }

    pub async fn progress_history(&self, job_id: Uuid) -> Vec<ProgressEvent> {
        self.inner
            .read()
            .await
            .get(&job_id)
            .map(|e| e.progress.clone())
            .unwrap_or_default()
    }

    /// Advance the job status, enforcing the monotonic transition rules.
    pub async fn transition(&self, job_id: Uuid, next: JobStatus) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        if !entry.job.status.can_transition(next) {
            return Err(StoreError::IllegalTransition {
                from: entry.job.status,
                to: next,
            });
        }
        entry.job.status = next;
        if next == JobStatus::Cancelled {
            entry.job.cancelled = true;
        }
        Ok(())
    }

    /// Advisory cancellation flag. Idempotent, succeeds for unknown jobs too;
    /// the orchestrator observes the flag at the next stage boundary.
    pub async fn request_cancel(&self, job_id: Uuid) {
        if let Some(entry) = self.inner.write().await.get_mut(&job_id) {
            entry.job.cancelled = true;
        }
    }

    pub async fn cancel_requested(&self, job_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .get(&job_id)
            .map(|e| e.job.cancelled)
            .unwrap_or(false)
    }

    /// Append a progress event (assigning the next seq) and broadcast the
    /// corresponding frame.
    pub async fn progress(
        &self,
        job_id: Uuid,
        stage: &str,
        message: &str,
        step: u32,
        total_steps: u32,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        entry.next_seq += 1;
        entry.progress.push(ProgressEvent {
            job_id,
            seq: entry.next_seq,
            stage: stage.to_string(),
            message: message.to_string(),
            payload: None,
        });
        let frame = StreamFrame::Progress {
            stage: stage.to_string(),
            message: message.to_string(),
            step,
            total_steps,
        };
        entry.frames.push(frame.clone());
        let _ = entry.tx.send(frame);
        Ok(())
    }

    /// Record and broadcast a non-progress frame (partial, complete,
    /// cancelled, error).
    pub async fn publish(&self, job_id: Uuid, frame: StreamFrame) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        entry.frames.push(frame.clone());
        let _ = entry.tx.send(frame);
        Ok(())
    }

    /// Apply a section write to the job's report and return the updated copy
    /// (for emitting a `partial` frame). Each engine writes its section
    /// exactly once.
    pub async fn update_report<F>(&self, job_id: Uuid, f: F) -> Result<Report, StoreError>
    where
        F: FnOnce(&mut Report),
    {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        f(&mut entry.report);
        Ok(entry.report.clone())
    }

    /// Subscribe to a job's stream: the buffered frame history in order plus
    /// a live receiver. The receiver is registered before the history is
    /// copied, so delivery is at-least-once with no gaps.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
    ) -> Option<(Vec<StreamFrame>, broadcast::Receiver<StreamFrame>)> {
        let guard = self.inner.read().await;
        let entry = guard.get(&job_id)?;
        let rx = entry.tx.subscribe();
        Some((entry.frames.clone(), rx))
    }
}

// ---------------------------------------------------------------------------
// Report cache
// ---------------------------------------------------------------------------

struct CachedReport {
    report: Report,
    cached_at: Instant,
}

/// TTL cache of completed reports keyed by the normalized query.
pub struct ReportCache {
    ttl: Duration,
    inner: RwLock<HashMap<String, CachedReport>>,
}

impl Default for ReportCache {
    fn default() -> Self {
        Self::new(REPORT_CACHE_TTL)
    }
}

impl ReportCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, query: &str) -> Option<Report> {
        let key = normalize_query(query);
        let mut guard = self.inner.write().await;
        match guard.get(&key) {
            Some(cached) if cached.cached_at.elapsed() < self.ttl => Some(cached.report.clone()),
            Some(_) => {
                guard.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, query: &str, report: Report) {
        let key = normalize_query(query);
        self.inner.write().await.insert(
            key,
            CachedReport {
                report,
                cached_at: Instant::now(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first attempt (so `1` means max 2 attempts total).
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Shared HTTP client with per-call timeout, bounded retry with exponential
/// backoff, and global + per-source concurrency limits.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: tokio::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: tokio::sync::Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source, url);
        self.request_with_retry(url).instrument(span).await
    }

    async fn request_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let bytes = self.fetch_bytes(source, url).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Postgres persistence
// ---------------------------------------------------------------------------

/// Best-effort persistence collaborator. All writes are non-fatal to the
/// pipeline; callers log and continue on error.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn connect_from_env() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        match Self::connect(&database_url).await {
            Ok(db) => Some(db),
            Err(err) => {
                warn!("postgres unavailable: {err:#}");
                None
            }
        }
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                normalized_name TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                product_id UUID NOT NULL REFERENCES products(id),
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                rating DOUBLE PRECISION,
                review_date TIMESTAMPTZ,
                verified BOOLEAN NOT NULL DEFAULT FALSE,
                helpful_votes INTEGER NOT NULL DEFAULT 0,
                reviewer_id TEXT,
                fake_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                embedding DOUBLE PRECISION[]
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                product_id UUID NOT NULL REFERENCES products(id),
                report_json JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS reviews_product_idx ON reviews (product_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_product(
        &self,
        normalized_name: &str,
        display_name: &str,
    ) -> anyhow::Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (normalized_name, display_name)
            VALUES ($1, $2)
            ON CONFLICT (normalized_name) DO UPDATE SET display_name = $2
            RETURNING id
            "#,
        )
        .bind(normalized_name)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await
        .context("upserting product")?;
        Ok(row.try_get("id")?)
    }

    /// Insert reviews with their embedding vectors, updating fake_score on
    /// conflict. Individual failures are logged and skipped.
    pub async fn store_reviews(
        &self,
        product_id: Uuid,
        reviews: &[NormalizedReview],
        embeddings: &HashMap<String, Vec<f32>>,
    ) {
        for review in reviews {
            let embedding = embeddings
                .get(&review.id)
                .map(|v| v.iter().map(|x| *x as f64).collect::<Vec<f64>>());
            let result = sqlx::query(
                r#"
                INSERT INTO reviews (
                    id, product_id, source, text, rating, review_date,
                    verified, helpful_votes, reviewer_id, fake_score, embedding
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE SET fake_score = $10, embedding = $11
                "#,
            )
            .bind(&review.id)
            .bind(product_id)
            .bind(&review.source)
            .bind(&review.text)
            .bind(review.rating)
            .bind(review.date)
            .bind(review.verified)
            .bind(review.helpful_votes as i32)
            .bind(&review.reviewer_id)
            .bind(review.fake_score)
            .bind(embedding)
            .execute(&self.pool)
            .await;
            if let Err(err) = result {
                warn!(review_id = %review.id, "storing review failed: {err}");
            }
        }
    }

    pub async fn store_report(&self, product_id: Uuid, report: &Report) -> anyhow::Result<()> {
        let json = serde_json::to_value(report).context("serializing report")?;
        sqlx::query("INSERT INTO reports (product_id, report_json) VALUES ($1, $2)")
            .bind(product_id)
            .bind(json)
            .execute(&self.pool)
            .await
            .context("inserting report")?;
        Ok(())
    }

    pub async fn load_report(&self, normalized_name: &str) -> anyhow::Result<Option<Report>> {
        let row = sqlx::query(
            r#"
            SELECT r.report_json
              FROM reports r
              JOIN products p ON r.product_id = p.id
             WHERE p.normalized_name = $1
             ORDER BY r.created_at DESC
             LIMIT 1
            "#,
        )
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await
        .context("loading report")?;
        match row {
            Some(row) => {
                let json: serde_json::Value = row.try_get("report_json")?;
                Ok(Some(serde_json::from_value(json).context("parsing stored report")?))
            }
            None => Ok(None),
        }
    }

    /// Rank a product's stored reviews by cosine similarity to `query_vec`.
    /// The embedding column has no vector index; candidates are fetched per
    /// product and ranked in-process.
    pub async fn find_similar_reviews(
        &self,
        product_id: Uuid,
        query_vec: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        let rows = sqlx::query(
            "SELECT id, embedding FROM reviews WHERE product_id = $1 AND embedding IS NOT NULL",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .context("fetching review embeddings")?;

        let query: Vec<f64> = query_vec.iter().map(|x| *x as f64).collect();
        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let embedding: Vec<f64> = row.try_get("embedding")?;
            scored.push((id, cosine_similarity(&query, &embedding)));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Canonical hash of review text for near-duplicate collapsing: lowercased
/// alphanumeric words, joined and sha256'd.
pub fn canonical_text_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let canonical = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
