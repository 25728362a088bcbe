//! Job orchestration: drives a submitted query through enrichment,
//! collection, the four analysis engines, and synthesis, publishing progress
//! and partial results along the way. One spawned task per job; all shared
//! state lives in the job store.

use std::sync::Arc;

use revlens_analysis::{absa, cluster, drift, fake, synthesis};
use revlens_connectors::{EnrichedQuery, SourceConnector};
use revlens_core::{
    normalize_query, Job, JobStatus, NormalizedReview, PipelineError, Report, StreamFrame,
};
use revlens_inference::{extract_json_array, prompts, Inference};
use revlens_store::{Db, HttpFetcher, JobStore, ReportCache};
use tracing::Instrument;
use uuid::Uuid;

use crate::coordinator;
use crate::normalizer;

const TOTAL_STEPS: u32 = 8;
const MAX_QUERY_VARIANTS: usize = 5;

/// Everything a job run needs that is not job-specific.
#[derive(Clone)]
pub struct PipelineConfig {
    pub store: Arc<JobStore>,
    pub cache: Arc<ReportCache>,
    pub db: Option<Arc<Db>>,
    pub http: Arc<HttpFetcher>,
    pub inference: Arc<dyn Inference>,
    pub connectors: Arc<Vec<Box<dyn SourceConnector>>>,
}

pub struct Orchestrator {
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.config.store
    }

    /// Register a job and start its pipeline task. Returns immediately; all
    /// further interaction happens through the store. With `use_cache` off
    /// the job recomputes even when a fresh report exists.
    pub async fn submit(self: &Arc<Self>, query: &str, use_cache: bool) -> Job {
        let job = self.config.store.create(query).await;
        let orchestrator = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move {
            orchestrator.run(spawned, use_cache).await;
        });
        job
    }

    /// Advisory cancel; the running task observes it at the next stage
    /// boundary. Safe for unknown and already-terminal jobs.
    pub async fn cancel(&self, job_id: Uuid) {
        self.config.store.request_cancel(job_id).await;
    }

    async fn run(&self, job: Job, use_cache: bool) {
        let span = tracing::info_span!("job", id = %job.id, query = %job.query);
        self.run_traced(job, use_cache).instrument(span).await;
    }

    async fn run_traced(&self, job: Job, use_cache: bool) {
        if let Err(err) = self.run_inner(&job, use_cache).await {
            let store = &self.config.store;
            match err {
                PipelineError::Cancelled => {
                    tracing::info!("job cancelled");
                    let _ = store.transition(job.id, JobStatus::Cancelled).await;
                    let _ = store.publish(job.id, StreamFrame::Cancelled {}).await;
                }
                other => {
                    tracing::error!(error = %other, "job failed");
                    let _ = store.transition(job.id, JobStatus::Failed).await;
                    let _ = store
                        .publish(
                            job.id,
                            StreamFrame::Error {
                                message: other.to_string(),
                                code: other.code().to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    async fn run_inner(&self, job: &Job, use_cache: bool) -> Result<(), PipelineError> {
        let store = &self.config.store;

        let cached = if use_cache {
            self.cached_report(&job.query).await
        } else {
            None
        };
        if let Some(report) = cached {
            store
                .update_report(job.id, |r| *r = report.clone())
                .await
                .map_err(internal)?;
            store
                .progress(job.id, "complete", "Loaded from cache", TOTAL_STEPS, TOTAL_STEPS)
                .await
                .map_err(internal)?;
            store
                .transition(job.id, JobStatus::Complete)
                .await
                .map_err(internal)?;
            store
                .publish(job.id, StreamFrame::Complete { data: report })
                .await
                .map_err(internal)?;
            return Ok(());
        }

        // Stage 1: query enrichment (failure falls back to the raw query).
        self.check_cancel(job.id).await?;
        store
            .transition(job.id, JobStatus::Enriching)
            .await
            .map_err(internal)?;
        store
            .progress(job.id, "enriching", "Expanding product query", 1, TOTAL_STEPS)
            .await
            .map_err(internal)?;
        let enriched = self.enrich(&job.query).await;

        // Stage 2: concurrent collection and normalization.
        self.check_cancel(job.id).await?;
        store
            .transition(job.id, JobStatus::Collecting)
            .await
            .map_err(internal)?;
        store
            .progress(job.id, "collecting", "Gathering reviews from sources", 2, TOTAL_STEPS)
            .await
            .map_err(internal)?;
        let collection = coordinator::collect(
            &self.config.connectors,
            &self.config.http,
            &enriched,
            store,
            job.id,
        )
        .await?;
        for warning in &collection.warnings {
            tracing::warn!(%warning, "collection warning");
        }

        let reviews = normalizer::normalize_all(&collection.batches);
        if reviews.is_empty() {
            return Err(PipelineError::InsufficientData);
        }
        store
            .progress(
                job.id,
                "collecting",
                &format!("Normalized {} reviews", reviews.len()),
                3,
                TOTAL_STEPS,
            )
            .await
            .map_err(internal)?;
        let partial = store
            .update_report(job.id, |r| {
                r.total_reviews_analyzed = reviews.len();
                r.sources_used = collection.sources_used.clone();
            })
            .await
            .map_err(internal)?;
        store
            .publish(job.id, StreamFrame::Partial { data: partial })
            .await
            .map_err(internal)?;

        // Stage 3: the four engines, concurrently. Each writes its report
        // section and emits a partial frame as soon as it lands.
        self.check_cancel(job.id).await?;
        store
            .transition(job.id, JobStatus::Analyzing)
            .await
            .map_err(internal)?;
        for (step, message) in [
            (4, "Scoring aspect sentiment"),
            (5, "Screening for fake reviews"),
            (6, "Tracking sentiment over time"),
            (7, "Clustering recurring themes"),
        ] {
            store
                .progress(job.id, "analyzing", message, step, TOTAL_STEPS)
                .await
                .map_err(internal)?;
        }

        let inference = self.config.inference.as_ref();
        let (aspects, detection, drift_report, clustering) = tokio::join!(
            async {
                let aspects = absa::analyze(inference, &reviews).await;
                self.publish_section(job.id, |r| r.aspect_scores = aspects.clone())
                    .await?;
                Ok::<_, PipelineError>(aspects)
            },
            async {
                let detection = fake::detect(&reviews);
                self.publish_section(job.id, |r| r.fake_report = Some(detection.report.clone()))
                    .await?;
                Ok::<_, PipelineError>(detection)
            },
            async {
                let report = drift::analyze(&reviews);
                self.publish_section(job.id, |r| r.drift_report = Some(report.clone()))
                    .await?;
                Ok::<_, PipelineError>(report)
            },
            async {
                let clustering = cluster::analyze(inference, &reviews).await;
                self.publish_section(job.id, |r| r.clusters = clustering.clusters.clone())
                    .await?;
                Ok::<_, PipelineError>(clustering)
            },
        );
        let aspects = aspects?;
        let detection = detection?;
        let drift_report = drift_report?;
        let clustering = clustering?;

        // Stage 4: deterministic synthesis plus the narrative call.
        self.check_cancel(job.id).await?;
        store
            .transition(job.id, JobStatus::Synthesizing)
            .await
            .map_err(internal)?;
        store
            .progress(job.id, "synthesizing", "Writing the report", 8, TOTAL_STEPS)
            .await
            .map_err(internal)?;

        let mut reviews = reviews;
        for review in &mut reviews {
            if let Some(score) = detection.scores.get(&review.id) {
                review.fake_score = *score;
            }
        }

        let score = synthesis::overall_score(
            &reviews,
            &aspects,
            Some(&detection.report),
            Some(&drift_report),
        );
        let breakdown = synthesis::sentiment_breakdown(&reviews);
        let featured = synthesis::featured_reviews(&reviews);
        let facts = synthesis::build_facts(
            &job.query,
            reviews.len(),
            score,
            &aspects,
            Some(&detection.report),
            Some(&drift_report),
            &clustering.clusters,
        );
        let narrative = synthesis::narrative(inference, &facts).await;

        let report = store
            .update_report(job.id, |r| {
                r.overall_score = score;
                r.sentiment_breakdown = breakdown.clone();
                r.featured_reviews = featured.clone();
                r.executive_summary = narrative.executive_summary.clone();
                r.who_should_buy = narrative.who_should_buy.clone();
                r.who_should_skip = narrative.who_should_skip.clone();
                r.verdict = narrative.verdict.clone();
            })
            .await
            .map_err(internal)?;

        self.check_cancel(job.id).await?;
        store
            .transition(job.id, JobStatus::Complete)
            .await
            .map_err(internal)?;
        self.config.cache.put(&job.query, report.clone()).await;
        self.persist(job, &reviews, &clustering.embeddings, &report).await;
        store
            .publish(job.id, StreamFrame::Complete { data: report })
            .await
            .map_err(internal)?;
        Ok(())
    }

    /// A completed report for this query, from the in-process cache or
    /// promoted from the database.
    async fn cached_report(&self, query: &str) -> Option<Report> {
        if let Some(report) = self.config.cache.get(query).await {
            return Some(report);
        }
        let db = self.config.db.as_ref()?;
        match db.load_report(&normalize_query(query)).await {
            Ok(Some(report)) => {
                self.config.cache.put(query, report.clone()).await;
                Some(report)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "report lookup failed");
                None
            }
        }
    }

    async fn enrich(&self, query: &str) -> EnrichedQuery {
        let prompt = prompts::enrich_query(query);
        match self.config.inference.generate(&prompt).await {
            Ok(output) => match extract_json_array(&output) {
                Ok(value) => {
                    let variants = value
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str())
                                .map(|s| s.trim().to_string())
                                .filter(|s| !s.is_empty())
                                .take(MAX_QUERY_VARIANTS)
                                .collect()
                        })
                        .unwrap_or_default();
                    EnrichedQuery {
                        original: query.to_string(),
                        variants,
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "enrichment output unusable, using raw query");
                    EnrichedQuery::raw(query)
                }
            },
            Err(err) => {
                tracing::warn!(%err, "enrichment call failed, using raw query");
                EnrichedQuery::raw(query)
            }
        }
    }

    async fn publish_section<F>(&self, job_id: Uuid, write: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut Report),
    {
        let report = self
            .config
            .store
            .update_report(job_id, write)
            .await
            .map_err(internal)?;
        self.config
            .store
            .publish(job_id, StreamFrame::Partial { data: report })
            .await
            .map_err(internal)
    }

    async fn check_cancel(&self, job_id: Uuid) -> Result<(), PipelineError> {
        if self.config.store.cancel_requested(job_id).await {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Best-effort persistence; the report is already servable from memory.
    async fn persist(
        &self,
        job: &Job,
        reviews: &[NormalizedReview],
        embeddings: &std::collections::HashMap<String, Vec<f32>>,
        report: &Report,
    ) {
        let Some(db) = &self.config.db else { return };
        match db.upsert_product(&normalize_query(&job.query), &job.query).await {
            Ok(product_id) => {
                db.store_reviews(product_id, reviews, embeddings).await;
                if let Err(err) = db.store_report(product_id, report).await {
                    tracing::warn!(error = %format!("{err:#}"), "failed to persist report");
                }
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to upsert product");
            }
        }
    }
}

fn internal(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Internal(err.to_string())
}
