//! Fake-review detection: an isolation forest over nine hand-built
//! per-review features. Runs entirely locally, seeded for reproducibility.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revlens_core::{FakeReport, NormalizedReview, RiskLevel};

pub const TREE_COUNT: usize = 100;
pub const SUBSAMPLE: usize = 256;
/// Anomaly score above which a review is flagged.
pub const SCORE_CUTOFF: f64 = 0.6;
/// Below this many reviews the forest is noise; detection is skipped.
pub const MIN_REVIEWS: usize = 10;

const RNG_SEED: u64 = 0x5eed_f0de_57;

const FEATURE_COUNT: usize = 9;

const BURST_WINDOW_DAYS: i64 = 3;
const DENSITY_WINDOW_DAYS: i64 = 7;

/// Stock phrases that dominate astroturfed reviews.
const GENERIC_PRAISE: &[&str] = &[
    "great product",
    "highly recommend",
    "best purchase ever",
    "five stars",
    "works great",
    "amazing quality",
    "love it",
    "exceeded my expectations",
];

const POSITIVE_WORDS: &[&str] = &[
    "great", "excellent", "amazing", "love", "perfect", "best", "awesome", "fantastic", "solid",
    "recommend",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "broke", "broken", "waste", "refund", "disappointed", "worst",
    "defective",
];

/// Detection output: the aggregate report plus each review's anomaly score,
/// keyed by review id.
#[derive(Debug, Clone)]
pub struct Detection {
    pub report: FakeReport,
    pub scores: HashMap<String, f64>,
}

pub fn detect(reviews: &[NormalizedReview]) -> Detection {
    if reviews.len() < MIN_REVIEWS {
        let mut report = FakeReport::empty(reviews.len());
        report.note = Some(format!(
            "skipped: {} reviews is below the {} needed to model",
            reviews.len(),
            MIN_REVIEWS
        ));
        return Detection {
            report,
            scores: HashMap::new(),
        };
    }

    let context = FeatureContext::build(reviews);
    let features: Vec<[f64; FEATURE_COUNT]> =
        reviews.iter().map(|r| context.featurize(r)).collect();
    let forest = IsolationForest::fit(&features, &mut StdRng::seed_from_u64(RNG_SEED));

    let mut scores = HashMap::with_capacity(reviews.len());
    let mut flagged = std::collections::BTreeSet::new();
    for (review, feature) in reviews.iter().zip(&features) {
        let score = forest.anomaly_score(feature);
        if score > SCORE_CUTOFF {
            flagged.insert(review.id.clone());
        }
        scores.insert(review.id.clone(), score);
    }

    let flagged_count = flagged.len();
    let fake_percentage =
        ((flagged_count as f64 / reviews.len() as f64) * 1000.0).round() / 10.0;
    let report = FakeReport {
        total_reviews: reviews.len(),
        flagged_count,
        fake_percentage,
        flagged_ids: flagged,
        risk_level: risk_level(fake_percentage),
        note: None,
    };
    Detection { report, scores }
}

/// Boundaries are inclusive: exactly 10% is still low risk, exactly 25% is
/// still medium.
pub fn risk_level(fake_percentage: f64) -> RiskLevel {
    if fake_percentage <= 10.0 {
        RiskLevel::Low
    } else if fake_percentage <= 25.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

/// Per-job aggregates the individual feature vectors are computed against.
struct FeatureContext {
    mean_rating: Option<f64>,
    dates: Vec<Option<DateTime<Utc>>>,
    reviewer_counts: HashMap<String, usize>,
    total: usize,
}

impl FeatureContext {
    fn build(reviews: &[NormalizedReview]) -> Self {
        let ratings: Vec<f64> = reviews.iter().filter_map(|r| r.rating).collect();
        let mean_rating = if ratings.is_empty() {
            None
        } else {
            Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
        };
        let mut reviewer_counts: HashMap<String, usize> = HashMap::new();
        for review in reviews {
            if let Some(reviewer) = &review.reviewer_id {
                *reviewer_counts.entry(reviewer.clone()).or_default() += 1;
            }
        }
        Self {
            mean_rating,
            dates: reviews.iter().map(|r| r.date).collect(),
            reviewer_counts,
            total: reviews.len(),
        }
    }

    fn posts_within(&self, date: Option<DateTime<Utc>>, window_days: i64) -> f64 {
        let Some(center) = date else { return 0.0 };
        let hits = self
            .dates
            .iter()
            .flatten()
            .filter(|d| (**d - center).num_days().abs() <= window_days)
            .count();
        hits as f64 / self.total as f64
    }

    fn featurize(&self, review: &NormalizedReview) -> [f64; FEATURE_COUNT] {
        let text = review.text.trim();
        let chars = text.chars().count().max(1) as f64;

        let rating_deviation = match (review.rating, self.mean_rating) {
            (Some(rating), Some(mean)) => (rating - mean).abs(),
            _ => 0.0,
        };

        let reviewer_count = review
            .reviewer_id
            .as_ref()
            .and_then(|r| self.reviewer_counts.get(r))
            .copied()
            .unwrap_or(1) as f64;

        let lowered = text.to_lowercase();
        let praise = GENERIC_PRAISE
            .iter()
            .map(|phrase| strsim::jaro_winkler(&lowered, phrase))
            .fold(0.0_f64, f64::max);

        let mismatch = match (lexicon_polarity(&lowered), review.sentiment_from_rating()) {
            (Some(text_polarity), Some(rating_polarity)) => (text_polarity - rating_polarity).abs(),
            _ => 0.0,
        };

        [
            chars.ln(),
            rating_deviation,
            self.posts_within(review.date, BURST_WINDOW_DAYS),
            if review.verified { 0.0 } else { 1.0 },
            (review.helpful_votes as f64 + 1.0).ln(),
            reviewer_count.min(10.0),
            praise,
            mismatch,
            self.posts_within(review.date, DENSITY_WINDOW_DAYS),
        ]
    }
}

/// Crude text polarity on [0,1] from word lists; `None` when the text carries
/// no polar vocabulary at all.
fn lexicon_polarity(lowered: &str) -> Option<f64> {
    let mut positive = 0usize;
    let mut negative = 0usize;
    for word in lowered.split(|c: char| !c.is_alphanumeric()) {
        if POSITIVE_WORDS.contains(&word) {
            positive += 1;
        } else if NEGATIVE_WORDS.contains(&word) {
            negative += 1;
        }
    }
    let total = positive + negative;
    if total == 0 {
        return None;
    }
    Some(positive as f64 / total as f64)
}

// ---------------------------------------------------------------------------
// Isolation forest
// ---------------------------------------------------------------------------

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

struct IsolationForest {
    trees: Vec<Node>,
    subsample: usize,
}

impl IsolationForest {
    fn fit(data: &[[f64; FEATURE_COUNT]], rng: &mut StdRng) -> Self {
        let subsample = data.len().min(SUBSAMPLE);
        let max_depth = (subsample as f64).log2().ceil() as usize;
        let trees = (0..TREE_COUNT)
            .map(|_| {
                let sample: Vec<[f64; FEATURE_COUNT]> = (0..subsample)
                    .map(|_| data[rng.gen_range(0..data.len())])
                    .collect();
                build_tree(&sample, 0, max_depth, rng)
            })
            .collect();
        Self { trees, subsample }
    }

    fn anomaly_score(&self, point: &[f64; FEATURE_COUNT]) -> f64 {
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / average_path_length(self.subsample))
    }
}

fn build_tree(data: &[[f64; FEATURE_COUNT]], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if depth >= max_depth || data.len() <= 1 {
        return Node::Leaf { size: data.len() };
    }
    let feature = rng.gen_range(0..FEATURE_COUNT);
    let (min, max) = data.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), row| {
        (lo.min(row[feature]), hi.max(row[feature]))
    });
    if max <= min {
        return Node::Leaf { size: data.len() };
    }
    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<_>, Vec<_>) = data.iter().partition(|row| row[feature] < threshold);
    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(&left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &[f64; FEATURE_COUNT], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if point[*feature] < *threshold {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
}
