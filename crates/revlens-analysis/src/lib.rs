//! Analytic engines over normalized reviews: aspect sentiment, fake-review
//! detection, sentiment drift, theme clustering, and report synthesis.
//!
//! Every engine is deterministic for a fixed input (seeded RNG where
//! randomness is inherent) and degrades to a typed "skipped" result instead
//! of failing when the input is too small to model.

pub const CRATE_NAME: &str = "revlens-analysis";

pub mod absa;
pub mod cluster;
pub mod drift;
pub mod fake;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{TimeZone, Utc};
    use revlens_core::NormalizedReview;

    pub fn review(id: &str, text: &str, rating: Option<f64>) -> NormalizedReview {
        NormalizedReview {
            id: format!("amazon:{id}"),
            source: "amazon".into(),
            text: text.into(),
            rating,
            date: Some(Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()),
            verified: true,
            helpful_votes: 3,
            reviewer_id: Some(format!("user_{id}")),
            fake_score: 0.0,
        }
    }
}
