//! Theme clustering: embed review texts, reduce to a low-dimensional space,
//! group by density, and have the model name each group. Every failure mode
//! degrades to an empty cluster list; this engine never fails a job.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revlens_core::{ClusterSentiment, NormalizedReview, ThemeCluster};
use revlens_inference::{prompts, Inference};

/// Below this many reviews clustering is skipped entirely.
pub const MIN_REVIEWS: usize = 10;
pub const REDUCED_DIMS: usize = 5;
pub const MAX_NEIGHBORS: usize = 15;
/// Refinement stops pulling points together once they are this close.
pub const MIN_DIST: f64 = 0.1;
/// Label used when the model cannot name a cluster.
pub const FALLBACK_LABEL: &str = "General Feedback";

const RNG_SEED: u64 = 0x7d1f_f00d;
const REFINE_ITERATIONS: usize = 30;
const EMBED_TEXT_CHARS: usize = 512;
const QUOTES_PER_CLUSTER: usize = 3;
const QUOTE_MIN_CHARS: usize = 50;
const QUOTE_MAX_CHARS: usize = 500;
const LABEL_SAMPLES: usize = 5;

/// Clustering output. `embeddings` carries the raw model vectors keyed by
/// review id so callers can persist them for similarity search.
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    pub clusters: Vec<ThemeCluster>,
    pub embeddings: HashMap<String, Vec<f32>>,
}

pub async fn analyze(inference: &dyn Inference, reviews: &[NormalizedReview]) -> Clustering {
    if reviews.len() < MIN_REVIEWS {
        return Clustering::default();
    }

    let texts: Vec<String> = reviews
        .iter()
        .map(|r| r.text.chars().take(EMBED_TEXT_CHARS).collect())
        .collect();
    let raw = match inference.embed(&texts).await {
        Ok(embeddings) => embeddings,
        Err(err) => {
            tracing::warn!(%err, "embedding failed, skipping theme clustering");
            return Clustering::default();
        }
    };

    let points = reduce(&raw);
    let min_cluster_size = (reviews.len() / 20).max(5);
    let density = cluster_assignments(&points, min_cluster_size);

    let mut grouped: HashMap<i32, Vec<Member<'_>>> = HashMap::new();
    for (i, review) in reviews.iter().enumerate() {
        if let Some(cluster) = density.assignments[i] {
            grouped.entry(cluster).or_default().push(Member {
                review,
                neighbor_count: density.neighbor_counts[i],
            });
        }
    }
    let mut groups: Vec<Vec<Member<'_>>> = grouped.into_values().collect();
    groups.sort_by(|a, b| b.len().cmp(&a.len()));

    let mut clusters = Vec::with_capacity(groups.len());
    for (id, members) in groups.into_iter().enumerate() {
        clusters.push(build_cluster(inference, id as i32, members).await);
    }

    let embeddings = reviews
        .iter()
        .zip(raw)
        .map(|(review, embedding)| (review.id.clone(), embedding))
        .collect();
    Clustering {
        clusters,
        embeddings,
    }
}

struct Member<'a> {
    review: &'a NormalizedReview,
    neighbor_count: usize,
}

async fn build_cluster(inference: &dyn Inference, id: i32, mut members: Vec<Member<'_>>) -> ThemeCluster {
    // Densest members speak for the cluster.
    members.sort_by(|a, b| {
        b.neighbor_count
            .cmp(&a.neighbor_count)
            .then(a.review.id.cmp(&b.review.id))
    });

    let samples: Vec<&str> = members
        .iter()
        .take(LABEL_SAMPLES)
        .map(|m| m.review.text.as_str())
        .collect();
    let theme_label = match inference.generate(&prompts::cluster_label(&samples)).await {
        Ok(output) => clean_label(&output),
        Err(err) => {
            tracing::warn!(cluster = id, %err, "label generation failed, using placeholder");
            FALLBACK_LABEL.to_string()
        }
    };

    let mut top_quotes: Vec<String> = members
        .iter()
        .filter(|m| {
            let len = m.review.text.chars().count();
            (QUOTE_MIN_CHARS..=QUOTE_MAX_CHARS).contains(&len)
        })
        .take(QUOTES_PER_CLUSTER)
        .map(|m| flatten(&m.review.text))
        .collect();
    if top_quotes.is_empty() {
        // Nothing in the readable band; quote the densest members anyway.
        top_quotes = members
            .iter()
            .take(QUOTES_PER_CLUSTER)
            .map(|m| flatten(&m.review.text))
            .collect();
    }

    ThemeCluster {
        id,
        theme_label,
        review_count: members.len(),
        sentiment: cluster_sentiment(&members),
        top_quotes,
    }
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_label(output: &str) -> String {
    let label = output
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if label.is_empty() || label.split_whitespace().count() > 8 {
        FALLBACK_LABEL.to_string()
    } else {
        label
    }
}

/// A cluster's polarity from its members' mean star rating. Unrated members
/// do not vote; a cluster with no rated members reads as mixed.
fn cluster_sentiment(members: &[Member<'_>]) -> ClusterSentiment {
    let ratings: Vec<f64> = members.iter().filter_map(|m| m.review.rating).collect();
    if ratings.is_empty() {
        return ClusterSentiment::Mixed;
    }
    let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
    if mean >= 3.7 {
        ClusterSentiment::Positive
    } else if mean <= 2.3 {
        ClusterSentiment::Negative
    } else {
        ClusterSentiment::Mixed
    }
}

// ---------------------------------------------------------------------------
// Dimensionality reduction
// ---------------------------------------------------------------------------

/// Seeded random projection to [`REDUCED_DIMS`] dimensions, followed by a few
/// rounds of neighborhood refinement that pull each point toward the centroid
/// of its nearest neighbors in the original space.
fn reduce(raw: &[Vec<f32>]) -> Vec<Vec<f64>> {
    let n = raw.len();
    let dims = raw.first().map(Vec::len).unwrap_or(0);
    if dims == 0 {
        return vec![vec![0.0; REDUCED_DIMS]; n];
    }
    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    let projection: Vec<Vec<f64>> = (0..REDUCED_DIMS)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let scale = (dims as f64).sqrt();

    let mut points: Vec<Vec<f64>> = raw
        .iter()
        .map(|row| {
            projection
                .iter()
                .map(|axis| {
                    row.iter()
                        .zip(axis)
                        .map(|(v, w)| *v as f64 * w)
                        .sum::<f64>()
                        / scale
                })
                .collect()
        })
        .collect();

    // Nearest neighbors by cosine similarity in the original space.
    let k = MAX_NEIGHBORS.min(n.saturating_sub(1));
    if k == 0 {
        return points;
    }
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            let mut scored: Vec<(usize, f64)> = (0..n)
                .filter(|j| *j != i)
                .map(|j| (j, cosine(&raw[i], &raw[j])))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite similarity"));
            scored.into_iter().take(k).map(|(j, _)| j).collect()
        })
        .collect();

    for _ in 0..REFINE_ITERATIONS {
        let snapshot = points.clone();
        for (i, neighbor_ids) in neighbors.iter().enumerate() {
            let mut centroid = vec![0.0; REDUCED_DIMS];
            for j in neighbor_ids {
                for (c, v) in centroid.iter_mut().zip(&snapshot[*j]) {
                    *c += v;
                }
            }
            for c in &mut centroid {
                *c /= neighbor_ids.len() as f64;
            }
            let gap = euclidean(&snapshot[i], &centroid);
            if gap <= MIN_DIST {
                continue;
            }
            for (p, c) in points[i].iter_mut().zip(&centroid) {
                *p += (c - *p) * 0.1;
            }
        }
    }
    points
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += *x as f64 * *y as f64;
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

// ---------------------------------------------------------------------------
// Density clustering
// ---------------------------------------------------------------------------

struct DensityClusters {
    /// `None` marks noise.
    assignments: Vec<Option<i32>>,
    /// In-radius neighbor count per point, reused for quote selection.
    neighbor_counts: Vec<usize>,
}

/// DBSCAN-style clustering. The radius is derived from the data: the median
/// distance to each point's `min_pts`-th neighbor.
fn cluster_assignments(points: &[Vec<f64>], min_pts: usize) -> DensityClusters {
    let n = points.len();
    let mut result = DensityClusters {
        assignments: vec![None; n],
        neighbor_counts: vec![0; n],
    };
    if n < min_pts {
        return result;
    }

    let mut kth_distances: Vec<f64> = (0..n)
        .map(|i| {
            let mut dists: Vec<f64> = (0..n)
                .filter(|j| *j != i)
                .map(|j| euclidean(&points[i], &points[j]))
                .collect();
            dists.sort_by(|a, b| a.partial_cmp(b).expect("finite distance"));
            dists[min_pts.min(dists.len()) - 1]
        })
        .collect();
    kth_distances.sort_by(|a, b| a.partial_cmp(b).expect("finite distance"));
    let eps = kth_distances[n / 2];
    if eps == 0.0 {
        // All points identical; one big cluster.
        result.assignments = vec![Some(0); n];
        result.neighbor_counts = vec![n - 1; n];
        return result;
    }

    let neighborhoods: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|j| *j != i && euclidean(&points[i], &points[*j]) <= eps)
                .collect()
        })
        .collect();
    for (i, neighborhood) in neighborhoods.iter().enumerate() {
        result.neighbor_counts[i] = neighborhood.len();
    }

    let mut visited = vec![false; n];
    let mut next_cluster = 0;
    for i in 0..n {
        if visited[i] || neighborhoods[i].len() + 1 < min_pts {
            continue;
        }
        // Grow a new cluster from this core point.
        let cluster = next_cluster;
        next_cluster += 1;
        let mut frontier = vec![i];
        while let Some(p) = frontier.pop() {
            if visited[p] {
                continue;
            }
            visited[p] = true;
            result.assignments[p] = Some(cluster);
            if neighborhoods[p].len() + 1 >= min_pts {
                frontier.extend(neighborhoods[p].iter().filter(|q| !visited[**q]));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::review;
    use async_trait::async_trait;
    use revlens_inference::InferenceError;

    /// Fails the test if the clusterer reaches for the model at all.
    struct UnreachableInference;

    #[async_trait]
    impl Inference for UnreachableInference {
        async fn generate(&self, _prompt: &str) -> Result<String, InferenceError> {
            panic!("no generate call expected below the minimum input");
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
            panic!("no embed call expected below the minimum input");
        }
    }

    #[tokio::test]
    async fn nine_reviews_skip_clustering_entirely() {
        let reviews: Vec<_> = (0..9)
            .map(|i| review(&format!("r{i}"), "long enough to cluster if we wanted to", Some(4.0)))
            .collect();
        let clustering = analyze(&UnreachableInference, &reviews).await;
        assert!(clustering.clusters.is_empty());
        assert!(clustering.embeddings.is_empty());
    }

    fn blob(center: f64, count: usize, offset: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| {
                let jitter = ((i + offset) % 7) as f64 * 0.01;
                vec![center + jitter, center - jitter, 0.0, 0.0, 0.0]
            })
            .collect()
    }

    #[test]
    fn two_blobs_form_two_clusters() {
        let mut points = blob(0.0, 12, 0);
        points.extend(blob(10.0, 12, 3));
        let density = cluster_assignments(&points, 5);
        let first = density.assignments[0].expect("first blob clustered");
        let second = density.assignments[12].expect("second blob clustered");
        assert_ne!(first, second);
        assert!(density.assignments[..12].iter().all(|a| *a == Some(first)));
        assert!(density.assignments[12..].iter().all(|a| *a == Some(second)));
    }

    #[test]
    fn lone_outlier_is_noise_with_no_neighbors() {
        let mut points = blob(0.0, 14, 0);
        points.push(vec![500.0, 500.0, 500.0, 500.0, 500.0]);
        let density = cluster_assignments(&points, 5);
        assert_eq!(density.assignments[14], None);
        assert_eq!(density.neighbor_counts[14], 0);
    }

    #[test]
    fn reduction_outputs_fixed_dims_and_is_deterministic() {
        let raw: Vec<Vec<f32>> = (0..20)
            .map(|i| (0..64).map(|d| ((i * d) % 13) as f32 / 13.0).collect())
            .collect();
        let a = reduce(&raw);
        let b = reduce(&raw);
        assert_eq!(a.len(), 20);
        assert!(a.iter().all(|p| p.len() == REDUCED_DIMS));
        assert_eq!(a, b);
    }

    #[test]
    fn cluster_sentiment_follows_mean_rating() {
        let good: Vec<_> = (0..5).map(|i| review(&format!("g{i}"), "text", Some(4.0))).collect();
        let bad: Vec<_> = (0..5).map(|i| review(&format!("b{i}"), "text", Some(2.0))).collect();
        let unrated: Vec<_> = (0..5).map(|i| review(&format!("u{i}"), "text", None)).collect();
        fn members(reviews: &[revlens_core::NormalizedReview]) -> Vec<Member<'_>> {
            reviews
                .iter()
                .map(|review| Member {
                    review,
                    neighbor_count: 0,
                })
                .collect()
        }
        assert_eq!(cluster_sentiment(&members(&good)), ClusterSentiment::Positive);
        assert_eq!(cluster_sentiment(&members(&bad)), ClusterSentiment::Negative);
        assert_eq!(cluster_sentiment(&members(&unrated)), ClusterSentiment::Mixed);
    }

    #[test]
    fn labels_fall_back_when_model_rambles() {
        assert_eq!(clean_label("  \"battery complaints\"\n"), "battery complaints");
        assert_eq!(
            clean_label("this cluster is mostly about how the battery drains quickly overnight"),
            FALLBACK_LABEL
        );
        assert_eq!(clean_label(""), FALLBACK_LABEL);
    }
}
