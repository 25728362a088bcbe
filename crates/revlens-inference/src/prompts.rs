//! Fixed prompt templates. Every model call in the system goes through one
//! of these builders so prompt text is versioned in one place and callers
//! only supply typed slots.

pub const PROMPT_VERSION: &str = "v2";

/// Query enrichment: ask for alternate names and model numbers for a product.
/// Expected output is a JSON array of strings.
pub fn enrich_query(query: &str) -> String {
    format!(
        "You are a product search assistant.\n\
         Product: \"{query}\"\n\
         List up to 5 alternate names, common abbreviations, or model numbers \
         shoppers use for this exact product.\n\
         Respond with only a JSON array of strings, no commentary."
    )
}

/// One review line inside an aspect-scoring batch.
#[derive(Debug, Clone)]
pub struct AbsaReview<'a> {
    pub index: usize,
    pub text: &'a str,
}

/// Aspect sentiment for a batch of reviews. Expected output is a JSON array
/// with one object per review:
/// `{"index": 0, "aspects": {"battery": 0.8, "comfort": -0.2}}`.
/// Only aspects actually mentioned appear; scores are in [-1, 1].
pub fn absa_batch(aspects: &[&str], reviews: &[AbsaReview<'_>]) -> String {
    let mut prompt = String::with_capacity(512 + reviews.len() * 200);
    prompt.push_str(
        "Score the sentiment each review expresses toward each product aspect it mentions.\n",
    );
    prompt.push_str("Aspects: ");
    prompt.push_str(&aspects.join(", "));
    prompt.push_str("\n\nReviews:\n");
    for review in reviews {
        // Truncate pathological reviews so the batch stays inside context.
        let text: String = review.text.chars().take(600).collect();
        prompt.push_str(&format!("[{}] {}\n", review.index, text.replace('\n', " ")));
    }
    prompt.push_str(
        "\nRespond with only a JSON array. One object per review: \
         {\"index\": <n>, \"aspects\": {\"<aspect>\": <score -1.0 to 1.0>}}. \
         Include only aspects the review actually discusses. \
         Skip reviews that mention no listed aspect.",
    );
    prompt
}

/// Name a theme cluster from a sample of its member reviews. Expected output
/// is a short plain-text label, 2 to 5 words.
pub fn cluster_label(samples: &[&str]) -> String {
    let mut prompt = String::with_capacity(256 + samples.len() * 200);
    prompt.push_str("These review excerpts were grouped together by topic:\n");
    for sample in samples {
        let text: String = sample.chars().take(300).collect();
        prompt.push_str(&format!("- {}\n", text.replace('\n', " ")));
    }
    prompt.push_str(
        "\nGive the shared topic a short label, 2 to 5 words, \
         like \"battery life complaints\". Respond with only the label.",
    );
    prompt
}

/// Typed slots for the report narrative prompt.
#[derive(Debug, Clone)]
pub struct SynthesisFacts {
    pub product_name: String,
    pub total_reviews: usize,
    pub overall_score: f64,
    pub top_positive_aspects: Vec<(String, f64)>,
    pub top_negative_aspects: Vec<(String, f64)>,
    pub fake_percentage: f64,
    pub drift_summary: String,
    pub theme_labels: Vec<String>,
}

/// Single structured narrative call. Expected output is one JSON object:
/// `{"executive_summary", "who_should_buy", "who_should_skip", "verdict"}`.
pub fn synthesis(facts: &SynthesisFacts) -> String {
    let positives = format_aspects(&facts.top_positive_aspects);
    let negatives = format_aspects(&facts.top_negative_aspects);
    let themes = if facts.theme_labels.is_empty() {
        "none identified".to_string()
    } else {
        facts.theme_labels.join(", ")
    };
    format!(
        "Write a buyer's report for \"{name}\" from these computed findings. \
         Do not invent facts beyond them.\n\
         Reviews analyzed: {total}\n\
         Overall score: {score:.1}/10\n\
         Strongest aspects: {positives}\n\
         Weakest aspects: {negatives}\n\
         Suspected fake reviews: {fake:.1}%\n\
         Sentiment over time: {drift}\n\
         Recurring themes: {themes}\n\n\
         Respond with only a JSON object with exactly these string fields: \
         \"executive_summary\" (3-4 sentences), \"who_should_buy\" (1-2 sentences), \
         \"who_should_skip\" (1-2 sentences), \"verdict\" (one sentence).",
        name = facts.product_name,
        total = facts.total_reviews,
        score = facts.overall_score,
        positives = positives,
        negatives = negatives,
        fake = facts.fake_percentage,
        drift = facts.drift_summary,
        themes = themes,
    )
}

fn format_aspects(aspects: &[(String, f64)]) -> String {
    if aspects.is_empty() {
        return "none".to_string();
    }
    aspects
        .iter()
        .map(|(name, score)| format!("{} ({:.2})", name, score))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absa_prompt_indexes_and_flattens_reviews() {
        let reviews = vec![
            AbsaReview {
                index: 0,
                text: "Battery lasts\nall week.",
            },
            AbsaReview {
                index: 1,
                text: "Too heavy for long sessions.",
            },
        ];
        let prompt = absa_batch(&["battery", "comfort"], &reviews);
        assert!(prompt.contains("[0] Battery lasts all week."));
        assert!(prompt.contains("[1] Too heavy"));
        assert!(prompt.contains("battery, comfort"));
    }

    #[test]
    fn absa_prompt_truncates_long_reviews() {
        let long = "x".repeat(5000);
        let reviews = vec![AbsaReview {
            index: 0,
            text: &long,
        }];
        let prompt = absa_batch(&["battery"], &reviews);
        assert!(prompt.len() < 2000);
    }

    #[test]
    fn synthesis_prompt_carries_all_facts() {
        let facts = SynthesisFacts {
            product_name: "Acme QC45".into(),
            total_reviews: 180,
            overall_score: 7.4,
            top_positive_aspects: vec![("sound_quality".into(), 0.72)],
            top_negative_aspects: vec![("price".into(), 0.21)],
            fake_percentage: 8.3,
            drift_summary: "improving since 2024-03".into(),
            theme_labels: vec!["firmware bugs".into()],
        };
        let prompt = synthesis(&facts);
        assert!(prompt.contains("Acme QC45"));
        assert!(prompt.contains("7.4/10"));
        assert!(prompt.contains("sound_quality (0.72)"));
        assert!(prompt.contains("8.3%"));
        assert!(prompt.contains("firmware bugs"));
    }
}
