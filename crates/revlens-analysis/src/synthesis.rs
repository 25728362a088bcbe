//! Deterministic report synthesis: the overall score, sentiment breakdown,
//! and featured-review selection are pure arithmetic; only the narrative
//! paragraphs come from a model call, with a templated fallback.

use revlens_core::{
    AspectScore, DriftReport, FakeReport, NormalizedReview, SentimentBreakdown, ThemeCluster,
    Trend,
};
use revlens_inference::prompts::{self, SynthesisFacts};
use revlens_inference::{extract_json_object, Inference, InferenceError};

pub const RATING_WEIGHT: f64 = 0.7;
pub const ASPECT_WEIGHT: f64 = 0.3;
/// Score bump or penalty applied for a clear sentiment trend.
pub const DRIFT_ADJUST: f64 = 0.3;
/// Midpoint score used when no component has data.
const NEUTRAL_BASE: f64 = 5.0;

const FEATURED_LIMIT: usize = 5;
const FEATURED_MIN_CHARS: usize = 100;
const FEATURED_MAX_CHARS: usize = 500;
/// Reviews at or above this anomaly score never get featured.
const FEATURED_FAKE_CUTOFF: f64 = 0.3;

/// Composite 0-10 score: a weighted blend of the average star rating and the
/// average aspect sentiment, penalized by the fake share and nudged by the
/// drift trend. Rounded to one decimal.
pub fn overall_score(
    reviews: &[NormalizedReview],
    aspects: &[AspectScore],
    fake: Option<&FakeReport>,
    drift: Option<&DriftReport>,
) -> f64 {
    let ratings: Vec<f64> = reviews.iter().filter_map(|r| r.rating).collect();
    let rating_component = if ratings.is_empty() {
        NEUTRAL_BASE
    } else {
        let avg = ratings.iter().sum::<f64>() / ratings.len() as f64;
        (avg - 1.0) / 4.0 * 10.0
    };

    let aspect_component = if aspects.is_empty() {
        rating_component
    } else {
        let total_mentions: u32 = aspects.iter().map(|a| a.mention_count).sum();
        let weighted: f64 = aspects
            .iter()
            .map(|a| a.score * a.mention_count as f64)
            .sum::<f64>()
            / total_mentions.max(1) as f64;
        // Aspect scores already live on [0, 1].
        weighted * 10.0
    };

    let fake_penalty = fake
        .map(|f| (f.fake_percentage * 0.01).min(1.0))
        .unwrap_or(0.0);
    let drift_adjust = match drift.map(|d| d.trend) {
        Some(Trend::Improving) => DRIFT_ADJUST,
        Some(Trend::Declining) => -DRIFT_ADJUST,
        _ => 0.0,
    };

    let score = RATING_WEIGHT * rating_component + ASPECT_WEIGHT * aspect_component
        - fake_penalty
        + drift_adjust;
    (score.clamp(0.0, 10.0) * 10.0).round() / 10.0
}

/// Star-rating split: 4 stars and up is positive, 2 and below negative.
/// Percentages are over rated reviews only, rounded to one decimal.
pub fn sentiment_breakdown(reviews: &[NormalizedReview]) -> SentimentBreakdown {
    let rated: Vec<f64> = reviews.iter().filter_map(|r| r.rating).collect();
    if rated.is_empty() {
        return SentimentBreakdown::default();
    }
    let total = rated.len();
    let positive = rated.iter().filter(|r| **r >= 4.0).count();
    let negative = rated.iter().filter(|r| **r <= 2.0).count();
    let neutral = total - positive - negative;
    let pct = |n: usize| ((n as f64 / total as f64) * 1000.0).round() / 10.0;
    SentimentBreakdown {
        positive: pct(positive),
        negative: pct(negative),
        neutral: pct(neutral),
        total,
    }
}

/// Pick up to five showcase reviews: verified purchases of readable length
/// that the fake detector did not find suspicious, most helpful first.
pub fn featured_reviews(reviews: &[NormalizedReview]) -> Vec<NormalizedReview> {
    let mut candidates: Vec<&NormalizedReview> = reviews
        .iter()
        .filter(|r| {
            let len = r.text.chars().count();
            r.verified
                && r.fake_score < FEATURED_FAKE_CUTOFF
                && (FEATURED_MIN_CHARS..=FEATURED_MAX_CHARS).contains(&len)
        })
        .collect();
    candidates.sort_by(|a, b| b.helpful_votes.cmp(&a.helpful_votes).then(a.id.cmp(&b.id)));
    candidates
        .into_iter()
        .take(FEATURED_LIMIT)
        .cloned()
        .collect()
}

/// Narrative paragraphs for the final report.
#[derive(Debug, Clone, PartialEq)]
pub struct Narrative {
    pub executive_summary: String,
    pub who_should_buy: String,
    pub who_should_skip: String,
    pub verdict: String,
}

/// Collect computed findings into the typed slots the narrative prompt needs.
pub fn build_facts(
    product_name: &str,
    total_reviews: usize,
    overall_score: f64,
    aspects: &[AspectScore],
    fake: Option<&FakeReport>,
    drift: Option<&DriftReport>,
    clusters: &[ThemeCluster],
) -> SynthesisFacts {
    let mut ranked: Vec<&AspectScore> = aspects.iter().collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("finite scores"));
    let top_positive = ranked
        .iter()
        .filter(|a| a.score > 0.5)
        .take(3)
        .map(|a| (a.aspect.clone(), a.score))
        .collect();
    let top_negative = ranked
        .iter()
        .rev()
        .filter(|a| a.score < 0.5)
        .take(3)
        .map(|a| (a.aspect.clone(), a.score))
        .collect();

    SynthesisFacts {
        product_name: product_name.to_string(),
        total_reviews,
        overall_score,
        top_positive_aspects: top_positive,
        top_negative_aspects: top_negative,
        fake_percentage: fake.map(|f| f.fake_percentage).unwrap_or(0.0),
        drift_summary: drift.map(drift_summary).unwrap_or_else(|| "unknown".into()),
        theme_labels: clusters.iter().map(|c| c.theme_label.clone()).collect(),
    }
}

fn drift_summary(drift: &DriftReport) -> String {
    let trend = match drift.trend {
        Trend::Improving => "improving",
        Trend::Declining => "declining",
        Trend::Stable => "stable",
    };
    match drift.change_points.first() {
        Some(month) => format!("{} with a shift around {}", trend, month),
        None => trend.to_string(),
    }
}

/// Generate the narrative with a single structured model call. Any failure
/// falls back to a template built from the same facts, so a report is never
/// blocked on prose.
pub async fn narrative(inference: &dyn Inference, facts: &SynthesisFacts) -> Narrative {
    let prompt = prompts::synthesis(facts);
    match inference.generate(&prompt).await {
        Ok(output) => match parse_narrative(&output) {
            Ok(narrative) => narrative,
            Err(err) => {
                tracing::warn!(%err, "narrative output unusable, using template");
                fallback_narrative(facts)
            }
        },
        Err(err) => {
            tracing::warn!(%err, "narrative call failed, using template");
            fallback_narrative(facts)
        }
    }
}

fn parse_narrative(output: &str) -> Result<Narrative, InferenceError> {
    let value = extract_json_object(output)?;
    let field = |name: &str| -> Result<String, InferenceError> {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| InferenceError::Malformed(format!("missing field {name}")))
    };
    Ok(Narrative {
        executive_summary: field("executive_summary")?,
        who_should_buy: field("who_should_buy")?,
        who_should_skip: field("who_should_skip")?,
        verdict: field("verdict")?,
    })
}

pub fn fallback_narrative(facts: &SynthesisFacts) -> Narrative {
    let strengths = facts
        .top_positive_aspects
        .first()
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "no standout strengths".into());
    let weaknesses = facts
        .top_negative_aspects
        .first()
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "no recurring complaints".into());
    Narrative {
        executive_summary: format!(
            "{} scored {:.1}/10 across {} analyzed reviews. Reviewers were most positive about \
             {} and most critical of {}. An estimated {:.1}% of reviews look inauthentic, and \
             sentiment over time is {}.",
            facts.product_name,
            facts.overall_score,
            facts.total_reviews,
            strengths,
            weaknesses,
            facts.fake_percentage,
            facts.drift_summary,
        ),
        who_should_buy: format!("Buyers who value {} will get the most out of it.", strengths),
        who_should_skip: format!("Skip it if {} is a dealbreaker for you.", weaknesses),
        verdict: format!(
            "{} earns a {:.1}/10 from real-world reviewers.",
            facts.product_name, facts.overall_score
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::review;
    use revlens_core::{RiskLevel, Sentiment};
    use std::collections::BTreeSet;

    fn aspect(name: &str, score: f64, mentions: u32) -> AspectScore {
        AspectScore {
            aspect: name.into(),
            sentiment: if score >= 0.5 {
                Sentiment::Positive
            } else {
                Sentiment::Negative
            },
            score,
            representative_quote: "quote".into(),
            mention_count: mentions,
        }
    }

    fn fake_report(fake_percentage: f64) -> FakeReport {
        FakeReport {
            total_reviews: 100,
            flagged_count: (fake_percentage as usize).min(100),
            fake_percentage,
            flagged_ids: BTreeSet::new(),
            risk_level: RiskLevel::Low,
            note: None,
        }
    }

    #[test]
    fn score_blends_ratings_and_aspects() {
        let reviews: Vec<_> = (0..10)
            .map(|i| review(&format!("r{i}"), "text", Some(5.0)))
            .collect();
        let aspects = vec![aspect("battery life", 1.0, 4)];
        // Both components at their maximum, no penalties.
        assert_eq!(overall_score(&reviews, &aspects, None, None), 10.0);

        let aspects = vec![aspect("battery life", 0.0, 4)];
        // 0.7 * 10 + 0.3 * 0 = 7.0.
        assert_eq!(overall_score(&reviews, &aspects, None, None), 7.0);
    }

    #[test]
    fn unrated_corpus_scores_from_neutral_base() {
        let reviews: Vec<_> = (0..10)
            .map(|i| review(&format!("r{i}"), "text", None))
            .collect();
        assert_eq!(overall_score(&reviews, &[], None, None), 5.0);
    }

    #[test]
    fn fake_share_and_decline_drag_the_score_down() {
        let reviews: Vec<_> = (0..10)
            .map(|i| review(&format!("r{i}"), "text", Some(5.0)))
            .collect();
        let base = overall_score(&reviews, &[], None, None);
        let fake = fake_report(50.0);
        let drift = DriftReport {
            monthly_sentiment: Vec::new(),
            change_points: Vec::new(),
            trend: Trend::Declining,
        };
        let adjusted = overall_score(&reviews, &[], Some(&fake), Some(&drift));
        assert_eq!(adjusted, base - 0.5 - 0.3);
    }

    #[test]
    fn score_is_clamped_and_rounded() {
        let reviews: Vec<_> = (0..10)
            .map(|i| review(&format!("r{i}"), "text", Some(1.0)))
            .collect();
        let fake = fake_report(100.0);
        let score = overall_score(&reviews, &[], Some(&fake), None);
        assert!(score >= 0.0);
        assert_eq!(score, (score * 10.0).round() / 10.0);
    }

    #[test]
    fn breakdown_splits_on_star_boundaries() {
        let mut reviews = vec![
            review("a", "t", Some(5.0)),
            review("b", "t", Some(4.0)),
            review("c", "t", Some(3.0)),
            review("d", "t", Some(2.0)),
        ];
        reviews.push(review("e", "t", None));
        let breakdown = sentiment_breakdown(&reviews);
        assert_eq!(breakdown.total, 4);
        assert_eq!(breakdown.positive, 50.0);
        assert_eq!(breakdown.negative, 25.0);
        assert_eq!(breakdown.neutral, 25.0);
    }

    #[test]
    fn featured_reviews_filter_on_quality_signals() {
        let readable = "a".repeat(150);
        let mut keep = review("keep", &readable, Some(4.0));
        keep.helpful_votes = 9;
        let mut unverified = review("unverified", &readable, Some(4.0));
        unverified.verified = false;
        let mut suspicious = review("suspicious", &readable, Some(5.0));
        suspicious.fake_score = 0.9;
        let short = review("short", "meh", Some(3.0));
        let long = review("long", &"b".repeat(900), Some(3.0));

        let featured = featured_reviews(&[keep.clone(), unverified, suspicious, short, long]);
        assert_eq!(featured, vec![keep]);
    }

    #[test]
    fn facts_rank_aspects_by_polarity() {
        let aspects = vec![
            aspect("battery life", 0.9, 10),
            aspect("price", 0.2, 8),
            aspect("design", 0.5, 2),
        ];
        let facts = build_facts("Widget", 120, 7.5, &aspects, None, None, &[]);
        assert_eq!(facts.top_positive_aspects[0].0, "battery life");
        assert_eq!(facts.top_positive_aspects.len(), 1);
        assert_eq!(facts.top_negative_aspects[0].0, "price");
        assert_eq!(facts.top_negative_aspects.len(), 1);
        assert_eq!(facts.drift_summary, "unknown");
    }

    #[test]
    fn narrative_parses_clean_model_output() {
        let output = r#"{"executive_summary": "Good.", "who_should_buy": "Everyone.",
            "who_should_skip": "No one.", "verdict": "Buy it."}"#;
        let narrative = parse_narrative(output).unwrap();
        assert_eq!(narrative.verdict, "Buy it.");
    }

    #[test]
    fn narrative_rejects_missing_fields() {
        let output = r#"{"executive_summary": "Good."}"#;
        assert!(parse_narrative(output).is_err());
    }

    #[test]
    fn fallback_narrative_uses_the_facts() {
        let facts = build_facts(
            "Widget",
            80,
            6.2,
            &[aspect("comfort", 0.75, 5), aspect("price", 0.3, 3)],
            Some(&fake_report(12.0)),
            None,
            &[],
        );
        let narrative = fallback_narrative(&facts);
        assert!(narrative.executive_summary.contains("Widget"));
        assert!(narrative.executive_summary.contains("6.2"));
        assert!(narrative.who_should_buy.contains("comfort"));
        assert!(narrative.who_should_skip.contains("price"));
    }
}
