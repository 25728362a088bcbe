//! Source connector contracts + per-source connector implementations.
//!
//! Each connector is a black box that turns an enriched product query into a
//! batch of loosely-typed raw review records. Field canonicalization (dates,
//! rating scales, dedup) happens downstream in the normalizer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use revlens_store::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "revlens-connectors";

/// Default cap on records returned per connector, bounding downstream cost.
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// How many enriched query terms a connector issues requests for.
const MAX_TERMS_PER_CONNECTOR: usize = 3;

/// The original product query plus LLM-generated variants/aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedQuery {
    pub original: String,
    pub variants: Vec<String>,
}

impl EnrichedQuery {
    /// An enrichment-free query (used when the enrichment call fails).
    pub fn raw(query: impl Into<String>) -> Self {
        Self {
            original: query.into(),
            variants: Vec::new(),
        }
    }

    /// Deduplicated search terms: the original query first, then variants.
    pub fn terms(&self) -> Vec<&str> {
        let mut seen = vec![self.original.as_str()];
        for v in &self.variants {
            if !seen.iter().any(|s| s.eq_ignore_ascii_case(v)) {
                seen.push(v.as_str());
            }
        }
        seen
    }
}

/// A review record in its source's own vocabulary. `rating_scale` is the
/// maximum of the source's rating scale (5, 10, 100); `posted_at` is the raw
/// timestamp text exactly as the source delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub native_id: String,
    pub text: String,
    pub raw_rating: Option<f64>,
    pub rating_scale: f64,
    pub posted_at: Option<String>,
    pub verified: bool,
    pub helpful_votes: i64,
    pub reviewer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewBatch {
    pub source: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The source served an anti-bot challenge or otherwise refused us.
    #[error("source {0} blocked the request")]
    Blocked(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {source_name}: {reason}")]
    Payload { source_name: String, reason: String },
}

/// Uniform contract every data source adapter implements. A connector either
/// returns a raw batch or fails as a whole; partial-failure handling lives in
/// the collection coordinator.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError>;
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub fn connector_for_source(config: &SourceConfig) -> Option<Box<dyn SourceConnector>> {
    match config.source_id.as_str() {
        "amazon" => Some(Box::new(AmazonConnector {
            base_url: config.base_url.clone(),
            max_results: config.max_results,
        })),
        "bestbuy" => Some(Box::new(BestBuyConnector {
            base_url: config.base_url.clone(),
            max_results: config.max_results,
        })),
        "reddit" => Some(Box::new(RedditConnector {
            base_url: config.base_url.clone(),
            max_results: config.max_results,
        })),
        "youtube" => Some(Box::new(YoutubeConnector {
            base_url: config.base_url.clone(),
            max_results: config.max_results,
        })),
        "google" => Some(Box::new(GoogleConnector {
            base_url: config.base_url.clone(),
            max_results: config.max_results,
        })),
        "fixture" => Some(Box::new(FixtureConnector {
            dir: config.base_url.clone(),
            max_results: config.max_results,
        })),
        _ => None,
    }
}

/// Build connectors for every enabled source in the registry, skipping
/// unknown ids with a warning.
pub fn connectors_from_registry(registry: &SourceRegistry) -> Vec<Box<dyn SourceConnector>> {
    let mut out = Vec::new();
    for config in registry.enabled() {
        match connector_for_source(config) {
            Some(connector) => out.push(connector),
            None => tracing::warn!(source = %config.source_id, "no connector registered"),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn urlencode(term: &str) -> String {
    term.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_string()
            } else if c == ' ' {
                "+".to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(ToString::to_string)
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_i64()
}

fn dedupe_and_cap(mut records: Vec<RawRecord>, max_results: usize) -> Vec<RawRecord> {
    let mut seen = std::collections::HashSet::new();
    records.retain(|r| seen.insert(r.native_id.clone()));
    records.truncate(max_results);
    records
}

fn map_blocked(source: &str, err: FetchError) -> ConnectorError {
    match &err {
        FetchError::HttpStatus { status, .. } if *status == 403 || *status == 429 => {
            ConnectorError::Blocked(source.to_string())
        }
        _ => ConnectorError::Fetch(err),
    }
}

// ---------------------------------------------------------------------------
// Amazon
// ---------------------------------------------------------------------------

/// Retail review API shape: `{"reviews": [{"review_id", "body", "rating",
/// "date", "verified_purchase", "helpful_count", "author_id"}]}`.
#[derive(Debug, Clone)]
pub struct AmazonConnector {
    pub base_url: String,
    pub max_results: usize,
}

impl AmazonConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let reviews = payload
            .get("reviews")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "amazon".into(),
                reason: "missing reviews array".into(),
            })?;
        let mut out = Vec::with_capacity(reviews.len());
        for item in reviews {
            let Some(native_id) = json_str(item, &["review_id"]) else {
                continue;
            };
            let Some(text) = json_str(item, &["body"]) else {
                continue;
            };
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: json_f64(item, &["rating"]),
                rating_scale: 5.0,
                posted_at: json_str(item, &["date"]),
                verified: item
                    .get("verified_purchase")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                helpful_votes: json_i64(item, &["helpful_count"]).unwrap_or(0),
                reviewer_id: json_str(item, &["author_id"]),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for AmazonConnector {
    fn source_id(&self) -> &'static str {
        "amazon"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let mut records = Vec::new();
        for term in query.terms().into_iter().take(MAX_TERMS_PER_CONNECTOR) {
            let url = format!("{}/reviews?query={}", self.base_url, urlencode(term));
            let payload: JsonValue = http
                .fetch_json("amazon", &url)
                .await
                .map_err(|e| map_blocked("amazon", e))?;
            records.extend(self.parse_payload(&payload)?);
            if records.len() >= self.max_results {
                break;
            }
        }
        Ok(ReviewBatch {
            source: "amazon".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

// ---------------------------------------------------------------------------
// Best Buy
// ---------------------------------------------------------------------------

/// Best Buy review API shape: `{"reviews": [{"id", "comment", "rating",
/// "submissionTime", "verifiedPurchaser", "positiveFeedbackCount",
/// "reviewerNickname"}]}`.
#[derive(Debug, Clone)]
pub struct BestBuyConnector {
    pub base_url: String,
    pub max_results: usize,
}

impl BestBuyConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let reviews = payload
            .get("reviews")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "bestbuy".into(),
                reason: "missing reviews array".into(),
            })?;
        let mut out = Vec::with_capacity(reviews.len());
        for item in reviews {
            let native_id = match item.get("id") {
                Some(JsonValue::String(s)) => s.clone(),
                Some(JsonValue::Number(n)) => n.to_string(),
                _ => continue,
            };
            let Some(text) = json_str(item, &["comment"]) else {
                continue;
            };
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: json_f64(item, &["rating"]),
                rating_scale: 5.0,
                posted_at: json_str(item, &["submissionTime"]),
                verified: item
                    .get("verifiedPurchaser")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                helpful_votes: json_i64(item, &["positiveFeedbackCount"]).unwrap_or(0),
                reviewer_id: json_str(item, &["reviewerNickname"]),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for BestBuyConnector {
    fn source_id(&self) -> &'static str {
        "bestbuy"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let mut records = Vec::new();
        for term in query.terms().into_iter().take(MAX_TERMS_PER_CONNECTOR) {
            let url = format!(
                "{}/v1/products(search={})/reviews.json",
                self.base_url,
                urlencode(term)
            );
            let payload: JsonValue = http
                .fetch_json("bestbuy", &url)
                .await
                .map_err(|e| map_blocked("bestbuy", e))?;
            records.extend(self.parse_payload(&payload)?);
            if records.len() >= self.max_results {
                break;
            }
        }
        Ok(ReviewBatch {
            source: "bestbuy".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

// ---------------------------------------------------------------------------
// Reddit
// ---------------------------------------------------------------------------

/// Reddit listing shape: `{"data": {"children": [{"data": {"id", "selftext",
/// "author", "created_utc", "score"}}]}}`. Posts carry no star rating and
/// upvotes stand in for helpful votes.
#[derive(Debug, Clone)]
pub struct RedditConnector {
    pub base_url: String,
    pub max_results: usize,
}

impl RedditConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let children = payload
            .get("data")
            .and_then(|v| v.get("children"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "reddit".into(),
                reason: "missing data.children".into(),
            })?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let Some(data) = child.get("data") else {
                continue;
            };
            let Some(native_id) = json_str(data, &["id"]) else {
                continue;
            };
            let text = json_str(data, &["selftext"])
                .or_else(|| json_str(data, &["body"]))
                .unwrap_or_default();
            // Skip link posts and one-liners with no opinion content.
            if text.trim().len() < 50 {
                continue;
            }
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: None,
                rating_scale: 5.0,
                posted_at: json_f64(data, &["created_utc"]).map(|t| format!("{}", t as i64)),
                verified: false,
                helpful_votes: json_i64(data, &["score"]).unwrap_or(0).max(0),
                reviewer_id: json_str(data, &["author"]),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for RedditConnector {
    fn source_id(&self) -> &'static str {
        "reddit"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let mut records = Vec::new();
        for term in query.terms().into_iter().take(MAX_TERMS_PER_CONNECTOR) {
            let url = format!(
                "{}/search.json?q={}+review&limit=50",
                self.base_url,
                urlencode(term)
            );
            let payload: JsonValue = http
                .fetch_json("reddit", &url)
                .await
                .map_err(|e| map_blocked("reddit", e))?;
            records.extend(self.parse_payload(&payload)?);
            if records.len() >= self.max_results {
                break;
            }
        }
        Ok(ReviewBatch {
            source: "reddit".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

// ---------------------------------------------------------------------------
// YouTube
// ---------------------------------------------------------------------------

/// Comment-thread API shape: `{"items": [{"id", "snippet":
/// {"topLevelComment": {"snippet": {"textDisplay", "authorDisplayName",
/// "likeCount", "publishedAt"}}}}]}`.
#[derive(Debug, Clone)]
pub struct YoutubeConnector {
    pub base_url: String,
    pub max_results: usize,
}

impl YoutubeConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let items = payload
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "youtube".into(),
                reason: "missing items array".into(),
            })?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let Some(native_id) = json_str(item, &["id"]) else {
                continue;
            };
            let comment = &["snippet", "topLevelComment", "snippet"];
            let Some(text) = json_str(item, &[comment[0], comment[1], comment[2], "textDisplay"])
            else {
                continue;
            };
            if text.trim().len() < 50 {
                continue;
            }
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: None,
                rating_scale: 5.0,
                posted_at: json_str(item, &[comment[0], comment[1], comment[2], "publishedAt"]),
                verified: false,
                helpful_votes: json_i64(item, &[comment[0], comment[1], comment[2], "likeCount"])
                    .unwrap_or(0),
                reviewer_id: json_str(
                    item,
                    &[comment[0], comment[1], comment[2], "authorDisplayName"],
                ),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for YoutubeConnector {
    fn source_id(&self) -> &'static str {
        "youtube"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let mut records = Vec::new();
        for term in query.terms().into_iter().take(MAX_TERMS_PER_CONNECTOR) {
            let url = format!(
                "{}/commentThreads?searchTerms={}+review",
                self.base_url,
                urlencode(term)
            );
            let payload: JsonValue = http
                .fetch_json("youtube", &url)
                .await
                .map_err(|e| map_blocked("youtube", e))?;
            records.extend(self.parse_payload(&payload)?);
            if records.len() >= self.max_results {
                break;
            }
        }
        Ok(ReviewBatch {
            source: "youtube".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

// ---------------------------------------------------------------------------
// Google
// ---------------------------------------------------------------------------

/// Custom Search shape: `{"items": [{"snippet", "pagemap":
/// {"aggregaterating": [{"ratingvalue"}], "review": [{"ratingstars"}]}}]}`.
/// Search snippets stand in for review text; the API exposes no stable id,
/// so ids derive from the text hash.
#[derive(Debug, Clone)]
pub struct GoogleConnector {
    pub base_url: String,
    pub max_results: usize,
}

impl GoogleConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let items = payload
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "google".into(),
                reason: "missing items array".into(),
            })?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let Some(text) = json_str(item, &["snippet"]) else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            let mut native_id = revlens_store::canonical_text_hash(&text);
            native_id.truncate(32);
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: schema_rating(item),
                rating_scale: 5.0,
                posted_at: None,
                verified: false,
                helpful_votes: 0,
                reviewer_id: None,
            });
        }
        Ok(out)
    }
}

/// Star rating from pagemap schema markup, when the indexed page carried any.
fn schema_rating(item: &JsonValue) -> Option<f64> {
    let pagemap = item.get("pagemap")?;
    let first = |key: &str| {
        pagemap
            .get(key)
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
    };
    let value = first("aggregaterating")
        .and_then(|r| r.get("ratingvalue"))
        .or_else(|| first("review").and_then(|r| r.get("ratingstars")));
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl SourceConnector for GoogleConnector {
    fn source_id(&self) -> &'static str {
        "google"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let mut records = Vec::new();
        for term in query.terms().into_iter().take(MAX_TERMS_PER_CONNECTOR) {
            let url = format!(
                "{}/customsearch/v1?q={}+reviews",
                self.base_url,
                urlencode(term)
            );
            let payload: JsonValue = http
                .fetch_json("google", &url)
                .await
                .map_err(|e| map_blocked("google", e))?;
            records.extend(self.parse_payload(&payload)?);
            if records.len() >= self.max_results {
                break;
            }
        }
        Ok(ReviewBatch {
            source: "google".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Serves canned review batches from local JSON files instead of the
/// network, for demos and offline runs. The registry's `base_url` is a
/// directory holding one file per product:
/// `{"product_name": "...", "reviews": [{"id", "text", "rating", "date",
/// "verified_purchase", "helpful_votes", "reviewer_id"}]}`.
#[derive(Debug, Clone)]
pub struct FixtureConnector {
    pub dir: String,
    pub max_results: usize,
}

impl FixtureConnector {
    pub fn parse_payload(&self, payload: &JsonValue) -> Result<Vec<RawRecord>, ConnectorError> {
        let reviews = payload
            .get("reviews")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ConnectorError::Payload {
                source_name: "fixture".into(),
                reason: "missing reviews array".into(),
            })?;
        let mut out = Vec::with_capacity(reviews.len());
        for item in reviews {
            let Some(native_id) = json_str(item, &["id"]) else {
                continue;
            };
            let Some(text) = json_str(item, &["text"]) else {
                continue;
            };
            out.push(RawRecord {
                native_id,
                text,
                raw_rating: json_f64(item, &["rating"]),
                rating_scale: 5.0,
                posted_at: json_str(item, &["date"]),
                verified: item
                    .get("verified_purchase")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                helpful_votes: json_i64(item, &["helpful_votes"]).unwrap_or(0),
                reviewer_id: json_str(item, &["reviewer_id"]),
            });
        }
        Ok(out)
    }

    fn matches(product_name: &str, terms: &[&str]) -> bool {
        terms
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(product_name.trim()))
    }
}

#[async_trait]
impl SourceConnector for FixtureConnector {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        query: &EnrichedQuery,
    ) -> Result<ReviewBatch, ConnectorError> {
        let read_failed = |reason: String| ConnectorError::Payload {
            source_name: "fixture".into(),
            reason,
        };
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| read_failed(format!("reading {}: {e}", self.dir)))?;

        let terms = query.terms();
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| read_failed(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let payload: JsonValue = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "skipping unparseable fixture");
                        continue;
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable fixture");
                    continue;
                }
            };
            let Some(name) = json_str(&payload, &["product_name"]) else {
                continue;
            };
            if !Self::matches(&name, &terms) {
                continue;
            }
            records.extend(self.parse_payload(&payload)?);
        }
        Ok(ReviewBatch {
            source: "fixture".into(),
            records: dedupe_and_cap(records, self.max_results),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enriched_query_terms_dedupe_case_insensitively() {
        let q = EnrichedQuery {
            original: "Sony XM5".into(),
            variants: vec!["sony xm5".into(), "WH-1000XM5".into()],
        };
        assert_eq!(q.terms(), vec!["Sony XM5", "WH-1000XM5"]);
    }

    #[test]
    fn amazon_payload_maps_fields() {
        let connector = AmazonConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let payload = json!({
            "reviews": [
                {
                    "review_id": "R1",
                    "body": "Solid build, battery could be better.",
                    "rating": 4.0,
                    "date": "2024-03-05",
                    "verified_purchase": true,
                    "helpful_count": 12,
                    "author_id": "A9"
                },
                {"review_id": "R2"}
            ]
        });
        let records = connector.parse_payload(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].native_id, "R1");
        assert_eq!(records[0].raw_rating, Some(4.0));
        assert!(records[0].verified);
        assert_eq!(records[0].helpful_votes, 12);
    }

    #[test]
    fn bestbuy_payload_accepts_numeric_ids() {
        let connector = BestBuyConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let payload = json!({
            "reviews": [{
                "id": 4411,
                "comment": "Arrived fast, works as advertised.",
                "rating": 5,
                "submissionTime": "2024-02-01T08:30:00",
                "verifiedPurchaser": true,
                "positiveFeedbackCount": 3,
                "reviewerNickname": "techfan"
            }]
        });
        let records = connector.parse_payload(&payload).unwrap();
        assert_eq!(records[0].native_id, "4411");
        assert_eq!(records[0].raw_rating, Some(5.0));
    }

    #[test]
    fn reddit_payload_skips_short_posts_and_has_no_rating() {
        let connector = RedditConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let payload = json!({
            "data": {"children": [
                {"data": {"id": "abc", "selftext": "nice", "author": "u1", "created_utc": 1709600000.0, "score": 5}},
                {"data": {"id": "def", "selftext": "I've used this thing daily for six months and the hinge is already creaking badly.", "author": "u2", "created_utc": 1709600000.0, "score": -2}}
            ]}
        });
        let records = connector.parse_payload(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].native_id, "def");
        assert_eq!(records[0].raw_rating, None);
        // Downvoted posts clamp to zero helpful votes.
        assert_eq!(records[0].helpful_votes, 0);
    }

    #[test]
    fn youtube_payload_unwraps_nested_comment() {
        let connector = YoutubeConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let payload = json!({
            "items": [{
                "id": "yt1",
                "snippet": {"topLevelComment": {"snippet": {
                    "textDisplay": "Bought one after this video. The noise cancelling is genuinely impressive on flights.",
                    "authorDisplayName": "viewer42",
                    "likeCount": 88,
                    "publishedAt": "2024-05-10T12:00:00Z"
                }}}
            }]
        });
        let records = connector.parse_payload(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].helpful_votes, 88);
        assert_eq!(records[0].posted_at.as_deref(), Some("2024-05-10T12:00:00Z"));
    }

    #[test]
    fn google_payload_reads_schema_ratings_and_hashes_ids() {
        let connector = GoogleConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let payload = json!({
            "items": [
                {
                    "snippet": "Rated highly for comfort, though several owners mention the clamping force.",
                    "pagemap": {"aggregaterating": [{"ratingvalue": "4.5"}]}
                },
                {
                    "snippet": "Returned mine after a week, the left earcup developed a rattle.",
                    "pagemap": {"review": [{"ratingstars": 2}]}
                },
                {"pagemap": {}}
            ]
        });
        let records = connector.parse_payload(&payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw_rating, Some(4.5));
        assert_eq!(records[1].raw_rating, Some(2.0));
        assert_eq!(records[0].native_id.len(), 32);
        assert_ne!(records[0].native_id, records[1].native_id);
    }

    #[tokio::test]
    async fn fixture_connector_serves_matching_product_files() {
        let dir = std::env::temp_dir().join(format!("revlens-fixtures-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("headphones.json"),
            serde_json::to_vec(&json!({
                "product_name": "Acme QC45",
                "reviews": [
                    {
                        "id": "sim-1",
                        "text": "Battery life is the standout, a full week of commutes per charge.",
                        "rating": 5.0,
                        "date": "2024-03-01",
                        "verified_purchase": true,
                        "helpful_votes": 7,
                        "reviewer_id": "sim_user_1"
                    }
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let connector = FixtureConnector {
            dir: dir.to_string_lossy().into_owned(),
            max_results: 100,
        };
        let http = HttpFetcher::new(revlens_store::HttpClientConfig::default()).unwrap();

        let batch = connector
            .fetch(&http, &EnrichedQuery::raw("acme qc45"))
            .await
            .unwrap();
        assert_eq!(batch.source, "fixture");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].native_id, "sim-1");
        assert!(batch.records[0].verified);

        // An unknown product yields an empty batch, not an error.
        let empty = connector
            .fetch(&http, &EnrichedQuery::raw("different widget"))
            .await
            .unwrap();
        assert!(empty.records.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn uuid_like() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        format!("{}-{nanos}", std::process::id())
    }

    #[test]
    fn malformed_payload_is_a_payload_error() {
        let connector = AmazonConnector {
            base_url: "http://localhost".into(),
            max_results: 100,
        };
        let err = connector.parse_payload(&json!({"nope": true})).unwrap_err();
        assert!(matches!(err, ConnectorError::Payload { .. }));
    }

    #[test]
    fn registry_builds_only_enabled_known_connectors() {
        let yaml = r#"
sources:
  - source_id: amazon
    display_name: Amazon
    enabled: true
    base_url: http://localhost:9001
  - source_id: bestbuy
    display_name: Best Buy
    enabled: false
    base_url: http://localhost:9002
  - source_id: myspace
    display_name: Unknown
    enabled: true
    base_url: http://localhost:9003
"#;
        let registry = SourceRegistry::from_yaml(yaml).unwrap();
        let connectors = connectors_from_registry(&registry);
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0].source_id(), "amazon");
    }

    #[test]
    fn dedupe_and_cap_enforces_result_volume() {
        let records: Vec<RawRecord> = (0..250)
            .map(|i| RawRecord {
                native_id: format!("r{}", i % 200),
                text: "text".into(),
                raw_rating: None,
                rating_scale: 5.0,
                posted_at: None,
                verified: false,
                helpful_votes: 0,
                reviewer_id: None,
            })
            .collect();
        let capped = dedupe_and_cap(records, 100);
        assert_eq!(capped.len(), 100);
    }
}
