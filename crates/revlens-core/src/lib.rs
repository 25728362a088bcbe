//! Core domain model and job lifecycle types for RevLens.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revlens-core";

/// Fixed aspect vocabulary used by the aspect-sentiment engine. Mentions
/// outside this list are discarded during aggregation.
pub const ASPECTS: &[&str] = &[
    "build quality",
    "performance",
    "value for money",
    "ease of use",
    "battery life",
    "design",
    "customer support",
    "durability",
    "features",
    "comfort",
];

/// A review converted to the canonical schema. `id` is globally unique as
/// `source:native_id`; `rating` is always on the 1-5 scale or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReview {
    pub id: String,
    pub source: String,
    pub text: String,
    pub rating: Option<f64>,
    pub date: Option<DateTime<Utc>>,
    pub verified: bool,
    pub helpful_votes: u32,
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub fake_score: f64,
}

impl NormalizedReview {
    /// Rating mapped onto [0,1], if present (1 star -> 0.0, 5 stars -> 1.0).
    pub fn sentiment_from_rating(&self) -> Option<f64> {
        self.rating.map(|r| (r - 1.0) / 4.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectScore {
    pub aspect: String,
    pub sentiment: Sentiment,
    pub score: f64,
    pub representative_quote: String,
    pub mention_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeReport {
    pub total_reviews: usize,
    pub flagged_count: usize,
    pub fake_percentage: f64,
    pub flagged_ids: BTreeSet<String>,
    pub risk_level: RiskLevel,
    /// Set when detection was skipped (e.g. too few reviews to model).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl FakeReport {
    pub fn empty(total_reviews: usize) -> Self {
        Self {
            total_reviews,
            flagged_count: 0,
            fake_percentage: 0.0,
            flagged_ids: BTreeSet::new(),
            risk_level: RiskLevel::Low,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySentiment {
    /// Calendar month bucket, `YYYY-MM`.
    pub month: String,
    pub avg_sentiment: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub monthly_sentiment: Vec<MonthlySentiment>,
    pub change_points: Vec<String>,
    pub trend: Trend,
}

impl DriftReport {
    pub fn stable() -> Self {
        Self {
            monthly_sentiment: Vec::new(),
            change_points: Vec::new(),
            trend: Trend::Stable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSentiment {
    Positive,
    Negative,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeCluster {
    pub id: i32,
    pub theme_label: String,
    pub review_count: usize,
    pub sentiment: ClusterSentiment,
    pub top_quotes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SentimentBreakdown {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    pub total: usize,
}

/// Aggregate analysis result. Created empty when the job starts and filled
/// section by section as stages complete, so a reconnecting client always
/// sees the best-known partial state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    pub product_name: String,
    pub overall_score: f64,
    pub total_reviews_analyzed: usize,
    pub sources_used: Vec<String>,
    pub sentiment_breakdown: SentimentBreakdown,
    pub aspect_scores: Vec<AspectScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_report: Option<FakeReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_report: Option<DriftReport>,
    pub clusters: Vec<ThemeCluster>,
    pub featured_reviews: Vec<NormalizedReview>,
    pub executive_summary: String,
    pub who_should_buy: String,
    pub who_should_skip: String,
    pub verdict: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Enriching,
    Collecting,
    Analyzing,
    Synthesizing,
    Complete,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Enriching => 1,
            Self::Collecting => 2,
            Self::Analyzing => 3,
            Self::Synthesizing => 4,
            Self::Complete => 5,
            Self::Cancelled => 6,
            Self::Failed => 7,
        }
    }

    /// Whether moving to `next` is legal. Transitions are monotonic and
    /// one-directional; any non-terminal status may move to CANCELLED or
    /// FAILED; terminal statuses are immutable.
    pub fn can_transition(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Cancelled | Self::Failed) {
            return true;
        }
        next.rank() > self.rank() && !matches!(next, Self::Cancelled | Self::Failed)
    }

    /// Human-facing stage name used in progress events.
    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enriching => "enriching",
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub query: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl Job {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            cancelled: false,
        }
    }
}

/// One entry in a job's buffered progress history. `seq` is strictly
/// increasing per job; subscribers joining mid-stream replay the full history
/// in order before receiving live events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub seq: u64,
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

/// Typed frames delivered over the per-job stream. The stream closes after
/// `complete`, `cancelled`, or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    Progress {
        stage: String,
        message: String,
        step: u32,
        total_steps: u32,
    },
    Partial {
        data: Report,
    },
    Complete {
        data: Report,
    },
    Cancelled {},
    Error {
        message: String,
        code: String,
    },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Cancelled {} | Self::Error { .. }
        )
    }
}

/// Pipeline error taxonomy. Connector- and batch-level variants are absorbed
/// at their origin; the fatal variants abort remaining stages and surface a
/// single `error` frame carrying `code()`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("no review source produced any data")]
    InsufficientData,
    #[error("inference call timed out: {0}")]
    InferenceTimeout(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::InsufficientData => "insufficient_data",
            Self::InferenceTimeout(_) => "inference_timeout",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Canonical cache/persistence key for a product query: lowercased, special
/// characters stripped, whitespace collapsed to underscores.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition(Enriching));
        assert!(Enriching.can_transition(Collecting));
        assert!(Collecting.can_transition(Analyzing));
        assert!(Analyzing.can_transition(Synthesizing));
        assert!(Synthesizing.can_transition(Complete));

        // No going backwards.
        assert!(!Analyzing.can_transition(Collecting));
        assert!(!Complete.can_transition(Pending));
    }

    #[test]
    fn any_non_terminal_status_may_cancel_or_fail() {
        use JobStatus::*;
        for status in [Pending, Enriching, Collecting, Analyzing, Synthesizing] {
            assert!(status.can_transition(Cancelled));
            assert!(status.can_transition(Failed));
        }
    }

    #[test]
    fn terminal_statuses_are_immutable() {
        use JobStatus::*;
        for status in [Complete, Cancelled, Failed] {
            for next in [Pending, Analyzing, Complete, Cancelled, Failed] {
                assert!(!status.can_transition(next));
            }
        }
    }

    #[test]
    fn normalize_query_strips_and_collapses() {
        assert_eq!(normalize_query("Sony WH-1000XM5"), "sony_wh1000xm5");
        assert_eq!(normalize_query("  AirPods   Pro (2nd gen)! "), "airpods_pro_2nd_gen");
        assert_eq!(normalize_query(normalize_query("Sony WH-1000XM5").as_str()), "sony_wh1000xm5");
    }

    #[test]
    fn stream_frames_serialize_with_type_tag() {
        let frame = StreamFrame::Progress {
            stage: "collecting".into(),
            message: "Scraping reviews".into(),
            step: 2,
            total_steps: 8,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["step"], 2);

        let cancelled = serde_json::to_value(StreamFrame::Cancelled {}).unwrap();
        assert_eq!(cancelled["type"], "cancelled");
    }

    #[test]
    fn rating_sentiment_maps_onto_unit_interval() {
        let mut review = NormalizedReview {
            id: "amazon:r1".into(),
            source: "amazon".into(),
            text: "fine".into(),
            rating: Some(5.0),
            date: None,
            verified: false,
            helpful_votes: 0,
            reviewer_id: None,
            fake_score: 0.0,
        };
        assert_eq!(review.sentiment_from_rating(), Some(1.0));
        review.rating = Some(1.0);
        assert_eq!(review.sentiment_from_rating(), Some(0.0));
        review.rating = None;
        assert_eq!(review.sentiment_from_rating(), None);
    }
}
