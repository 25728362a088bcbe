//! Concurrent review collection across all registered sources. Each
//! connector is its own failure domain: one source timing out or refusing us
//! degrades the result instead of failing the job.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use revlens_connectors::{EnrichedQuery, ReviewBatch, SourceConnector};
use revlens_core::PipelineError;
use revlens_store::{HttpFetcher, JobStore};
use uuid::Uuid;

/// Hard ceiling per connector, independent of per-request HTTP timeouts.
pub const CONNECTOR_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Collection {
    pub batches: Vec<ReviewBatch>,
    /// Sources that contributed at least one record.
    pub sources_used: Vec<String>,
    /// Human-readable notes about sources that failed or came back empty.
    pub warnings: Vec<String>,
}

/// Fan out to every connector concurrently and gather whatever succeeds.
/// Cancellation is observed between connector completions; at least one
/// source must succeed or the whole collection fails.
pub async fn collect(
    connectors: &[Box<dyn SourceConnector>],
    http: &HttpFetcher,
    query: &EnrichedQuery,
    store: &JobStore,
    job_id: Uuid,
) -> Result<Collection, PipelineError> {
    let mut in_flight: FuturesUnordered<_> = connectors
        .iter()
        .map(|connector| async move {
            let source = connector.source_id();
            let result = tokio::time::timeout(CONNECTOR_TIMEOUT, connector.fetch(http, query)).await;
            match result {
                Ok(Ok(batch)) => (source, Ok(batch)),
                Ok(Err(err)) => (source, Err(err.to_string())),
                Err(_) => (source, Err("timed out".to_string())),
            }
        })
        .collect();

    let mut collection = Collection::default();
    let mut successes = 0usize;
    loop {
        if store.cancel_requested(job_id).await {
            return Err(PipelineError::Cancelled);
        }
        let Some((source, result)) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(batch) => {
                successes += 1;
                if batch.records.is_empty() {
                    collection
                        .warnings
                        .push(format!("{source} returned no reviews"));
                } else {
                    tracing::info!(source, count = batch.records.len(), "collected reviews");
                    collection.sources_used.push(source.to_string());
                    collection.batches.push(batch);
                }
            }
            Err(reason) => {
                tracing::warn!(source, %reason, "source failed, continuing without it");
                collection.warnings.push(format!("{source}: {reason}"));
            }
        }
    }

    if successes == 0 {
        return Err(PipelineError::InsufficientData);
    }
    collection.sources_used.sort();
    Ok(collection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use revlens_connectors::{ConnectorError, RawRecord};
    use revlens_store::HttpClientConfig;

    struct MockConnector {
        id: &'static str,
        records: usize,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl SourceConnector for MockConnector {
        fn source_id(&self) -> &'static str {
            self.id
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _query: &EnrichedQuery,
        ) -> Result<ReviewBatch, ConnectorError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ConnectorError::Blocked(self.id.to_string()));
            }
            Ok(ReviewBatch {
                source: self.id.to_string(),
                records: (0..self.records)
                    .map(|i| RawRecord {
                        native_id: format!("{}-{i}", self.id),
                        text: "A review body long enough to keep downstream happy.".into(),
                        raw_rating: Some(4.0),
                        rating_scale: 5.0,
                        posted_at: None,
                        verified: false,
                        helpful_votes: 0,
                        reviewer_id: None,
                    })
                    .collect(),
            })
        }
    }

    fn connector(id: &'static str, records: usize, fail: bool) -> Box<dyn SourceConnector> {
        Box::new(MockConnector {
            id,
            records,
            fail,
            delay: Duration::from_millis(5),
        })
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn one_failed_source_degrades_instead_of_failing() {
        let store = JobStore::new();
        let job = store.create("widget").await;
        let connectors = vec![
            connector("amazon", 3, false),
            connector("bestbuy", 2, false),
            connector("reddit", 0, true),
        ];
        let collection = collect(&connectors, &http(), &EnrichedQuery::raw("widget"), &store, job.id)
            .await
            .unwrap();
        assert_eq!(collection.sources_used, vec!["amazon", "bestbuy"]);
        assert_eq!(collection.batches.len(), 2);
        assert_eq!(collection.warnings.len(), 1);
        assert!(collection.warnings[0].starts_with("reddit:"));
    }

    #[tokio::test]
    async fn empty_batches_count_as_success_but_not_as_a_source() {
        let store = JobStore::new();
        let job = store.create("widget").await;
        let connectors = vec![connector("youtube", 0, false)];
        let collection = collect(&connectors, &http(), &EnrichedQuery::raw("widget"), &store, job.id)
            .await
            .unwrap();
        assert!(collection.sources_used.is_empty());
        assert_eq!(collection.warnings, vec!["youtube returned no reviews"]);
    }

    #[tokio::test]
    async fn all_sources_failing_is_insufficient_data() {
        let store = JobStore::new();
        let job = store.create("widget").await;
        let connectors = vec![connector("amazon", 0, true), connector("reddit", 0, true)];
        let err = collect(&connectors, &http(), &EnrichedQuery::raw("widget"), &store, job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_sources() {
        let store = JobStore::new();
        let job = store.create("widget").await;
        store.request_cancel(job.id).await;
        let connectors = vec![connector("amazon", 3, false)];
        let err = collect(&connectors, &http(), &EnrichedQuery::raw("widget"), &store, job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
