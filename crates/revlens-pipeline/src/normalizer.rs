//! Pure conversion from per-source raw records to the canonical review
//! schema: id minting, rating rescale, timestamp parsing, and two rounds of
//! deduplication. Running it twice over the same input is a no-op.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use revlens_connectors::{RawRecord, ReviewBatch};
use revlens_core::NormalizedReview;
use revlens_store::canonical_text_hash;

/// Reviews shorter than this carry no analyzable opinion.
const MIN_TEXT_CHARS: usize = 10;

pub fn normalize_all(batches: &[ReviewBatch]) -> Vec<NormalizedReview> {
    let mut seen_ids = HashSet::new();
    let mut seen_text = HashSet::new();
    let mut out = Vec::new();
    for batch in batches {
        for record in &batch.records {
            let Some(review) = normalize_one(&batch.source, record) else {
                continue;
            };
            if !seen_ids.insert(review.id.clone()) {
                continue;
            }
            // Near-duplicate text within the same source is almost always a
            // repost; across sources it can be legitimate syndication.
            let text_key = (batch.source.clone(), canonical_text_hash(&review.text));
            if !seen_text.insert(text_key) {
                continue;
            }
            out.push(review);
        }
    }
    out
}

fn normalize_one(source: &str, record: &RawRecord) -> Option<NormalizedReview> {
    let text = record.text.trim();
    if text.chars().count() < MIN_TEXT_CHARS {
        tracing::debug!(source, native_id = %record.native_id, "dropping review with no usable text");
        return None;
    }
    let rating = match record.raw_rating {
        Some(raw) => {
            if record.rating_scale <= 0.0 || raw < 0.0 || raw > record.rating_scale {
                tracing::warn!(
                    source,
                    native_id = %record.native_id,
                    raw,
                    scale = record.rating_scale,
                    "dropping review with out-of-range rating"
                );
                return None;
            }
            Some(((raw / record.rating_scale) * 5.0).clamp(1.0, 5.0))
        }
        None => None,
    };
    let date = record.posted_at.as_deref().and_then(|raw| {
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            tracing::warn!(source, native_id = %record.native_id, raw, "unparseable timestamp");
        }
        parsed
    });

    Some(NormalizedReview {
        id: format!("{}:{}", source, record.native_id),
        source: source.to_string(),
        text: text.to_string(),
        rating,
        date,
        verified: record.verified,
        helpful_votes: record.helpful_votes.max(0) as u32,
        reviewer_id: record.reviewer_id.clone(),
        fake_score: 0.0,
    })
}

/// Accepts RFC 3339, a bare datetime, a bare date, or unix seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    None
}
