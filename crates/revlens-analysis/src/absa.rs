//! Aspect-based sentiment: score a stratified sample of reviews against the
//! fixed aspect vocabulary via batched model calls, then aggregate per aspect.
//!
//! The model scores each mention on [-1, 1]; aggregate aspect scores are
//! mapped onto [0, 1] with 0.5 as the neutral baseline. A failed batch only
//! excludes its own reviews.

use std::collections::HashMap;

use revlens_core::{AspectScore, NormalizedReview, Sentiment, ASPECTS};
use revlens_inference::prompts::{self, AbsaReview};
use revlens_inference::{extract_json_array, Inference, InferenceError};

/// Upper bound on reviews sent to the model per job.
pub const SAMPLE_SIZE: usize = 50;
/// Reviews per model call.
pub const BATCH_SIZE: usize = 20;

const POSITIVE_CUTOFF: f64 = 0.2;
const NEGATIVE_CUTOFF: f64 = -0.2;
/// Share of opposing-polarity mentions above which an aspect reads as mixed.
const MIXED_SHARE: f64 = 0.3;

/// Per-review aspect scores as the model returned them, keyed by sample index.
#[derive(Debug, Clone, Default)]
struct BatchScores {
    by_review: HashMap<usize, HashMap<String, f64>>,
}

/// Pick up to `limit` reviews, stratified so low, mid, and high ratings (and
/// unrated posts) are all represented rather than whatever happens to sort
/// first. Within each stratum, the most helpful reviews win.
pub fn select_sample(reviews: &[NormalizedReview], limit: usize) -> Vec<&NormalizedReview> {
    if reviews.len() <= limit {
        return reviews.iter().collect();
    }
    let mut strata: [Vec<&NormalizedReview>; 4] = Default::default();
    for review in reviews {
        let bucket = match review.rating {
            Some(r) if r <= 2.0 => 0,
            Some(r) if r < 4.0 => 1,
            Some(_) => 2,
            None => 3,
        };
        strata[bucket].push(review);
    }
    for stratum in &mut strata {
        stratum.sort_by(|a, b| b.helpful_votes.cmp(&a.helpful_votes).then(a.id.cmp(&b.id)));
    }
    let mut out = Vec::with_capacity(limit);
    let mut cursor = [0usize; 4];
    // Round-robin across strata until the budget is spent.
    while out.len() < limit {
        let mut advanced = false;
        for (i, stratum) in strata.iter().enumerate() {
            if out.len() == limit {
                break;
            }
            if let Some(review) = stratum.get(cursor[i]) {
                out.push(*review);
                cursor[i] += 1;
                advanced = true;
            }
        }
        if !advanced {
            break;
        }
    }
    out
}

/// Run aspect scoring over a sample of `reviews` and aggregate the results.
/// Any batch failure (the client already retried a timeout once) excludes
/// that batch and nothing else; the result is simply sparser.
pub async fn analyze(inference: &dyn Inference, reviews: &[NormalizedReview]) -> Vec<AspectScore> {
    let sample = select_sample(reviews, SAMPLE_SIZE);
    if sample.is_empty() {
        return Vec::new();
    }

    let mut scores = BatchScores::default();
    for (batch_no, batch) in sample.chunks(BATCH_SIZE).enumerate() {
        let base = batch_no * BATCH_SIZE;
        let items: Vec<AbsaReview<'_>> = batch
            .iter()
            .enumerate()
            .map(|(i, review)| AbsaReview {
                index: base + i,
                text: &review.text,
            })
            .collect();
        let prompt = prompts::absa_batch(ASPECTS, &items);
        match inference.generate(&prompt).await {
            Ok(output) => match parse_batch(&output) {
                Ok(parsed) => scores.by_review.extend(parsed.by_review),
                Err(err) => {
                    tracing::warn!(batch = batch_no, %err, "discarding unparseable aspect batch")
                }
            },
            Err(err) => {
                tracing::warn!(batch = batch_no, %err, "aspect batch failed, skipping its reviews");
            }
        }
    }

    aggregate(&sample, &scores)
}

fn parse_batch(output: &str) -> Result<BatchScores, InferenceError> {
    let array = extract_json_array(output)?;
    let items = array
        .as_array()
        .ok_or_else(|| InferenceError::Malformed("expected array".into()))?;
    let mut scores = BatchScores::default();
    for item in items {
        let Some(index) = item.get("index").and_then(|v| v.as_u64()) else {
            continue;
        };
        let Some(aspects) = item.get("aspects").and_then(|v| v.as_object()) else {
            continue;
        };
        let mut per_review = HashMap::new();
        for (name, value) in aspects {
            let Some(score) = value.as_f64() else { continue };
            // Drop hallucinated aspects and out-of-range scores.
            if !ASPECTS.contains(&name.as_str()) || !(-1.0..=1.0).contains(&score) {
                continue;
            }
            per_review.insert(name.clone(), score);
        }
        if !per_review.is_empty() {
            scores.by_review.insert(index as usize, per_review);
        }
    }
    Ok(scores)
}

fn aggregate(sample: &[&NormalizedReview], scores: &BatchScores) -> Vec<AspectScore> {
    let mut out = Vec::new();
    for aspect in ASPECTS {
        let mut mentions: Vec<(usize, f64)> = scores
            .by_review
            .iter()
            .filter_map(|(idx, per)| per.get(*aspect).map(|s| (*idx, *s)))
            .collect();
        if mentions.is_empty() {
            continue;
        }
        mentions.sort_by(|a, b| a.0.cmp(&b.0));

        let n = mentions.len() as f64;
        let mean = mentions.iter().map(|(_, s)| s).sum::<f64>() / n;
        let positive = mentions.iter().filter(|(_, s)| *s > POSITIVE_CUTOFF).count() as f64;
        let negative = mentions.iter().filter(|(_, s)| *s < NEGATIVE_CUTOFF).count() as f64;

        let sentiment = if positive / n > MIXED_SHARE && negative / n > MIXED_SHARE {
            Sentiment::Mixed
        } else if mean >= POSITIVE_CUTOFF {
            Sentiment::Positive
        } else if mean <= NEGATIVE_CUTOFF {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };

        // The strongest-opinion mention supplies the quote.
        let (quote_idx, _) = mentions
            .iter()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).expect("finite scores"))
            .copied()
            .expect("non-empty mentions");
        let quote = sample
            .get(quote_idx)
            .map(|r| truncate_quote(&r.text))
            .unwrap_or_default();

        // Mean mention score mapped from [-1,1] onto [0,1].
        let unit_score = (mean + 1.0) / 2.0;
        out.push(AspectScore {
            aspect: (*aspect).to_string(),
            sentiment,
            score: (unit_score * 100.0).round() / 100.0,
            representative_quote: quote,
            mention_count: mentions.len() as u32,
        });
    }
    // Most-discussed aspects first.
    out.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then(a.aspect.cmp(&b.aspect)));
    out
}

fn truncate_quote(text: &str) -> String {
    const MAX: usize = 200;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX).collect();
    cut.push_str("...");
    cut
}
