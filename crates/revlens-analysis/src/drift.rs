//! Sentiment drift over time: bucket reviews into calendar months, locate
//! change points in the monthly series, and classify the overall trend.

use std::collections::BTreeMap;

use revlens_core::{DriftReport, MonthlySentiment, NormalizedReview, Trend};

/// Fewer distinct months than this and the series is reported as stable.
pub const MIN_MONTHS: usize = 2;
/// Change-point search needs at least this many months to say anything.
pub const MIN_MONTHS_FOR_CHANGEPOINTS: usize = 4;
/// L2 segmentation penalty; higher values demand bigger shifts.
pub const PENALTY: f64 = 0.1;
/// Minimum first-third vs last-third gap to call a trend.
pub const TREND_DELTA: f64 = 0.05;

pub fn analyze(reviews: &[NormalizedReview]) -> DriftReport {
    let mut buckets: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for review in reviews {
        let (Some(date), Some(sentiment)) = (review.date, review.sentiment_from_rating()) else {
            continue;
        };
        buckets
            .entry(date.format("%Y-%m").to_string())
            .or_default()
            .push(sentiment);
    }

    if buckets.len() < MIN_MONTHS {
        return DriftReport::stable();
    }

    let monthly: Vec<MonthlySentiment> = buckets
        .into_iter()
        .map(|(month, values)| MonthlySentiment {
            avg_sentiment: ((values.iter().sum::<f64>() / values.len() as f64) * 1000.0).round()
                / 1000.0,
            month,
        })
        .collect();

    let series: Vec<f64> = monthly.iter().map(|m| m.avg_sentiment).collect();
    let change_points = if monthly.len() >= MIN_MONTHS_FOR_CHANGEPOINTS {
        segment(&series, PENALTY)
            .into_iter()
            .map(|idx| monthly[idx].month.clone())
            .collect()
    } else {
        Vec::new()
    };

    DriftReport {
        trend: trend(&series),
        monthly_sentiment: monthly,
        change_points,
    }
}

/// Exact L2 change-point segmentation by dynamic programming. Returns the
/// index of the first month of each new segment.
fn segment(series: &[f64], penalty: f64) -> Vec<usize> {
    let n = series.len();
    // Prefix sums for O(1) segment cost.
    let mut sum = vec![0.0; n + 1];
    let mut sq = vec![0.0; n + 1];
    for (i, v) in series.iter().enumerate() {
        sum[i + 1] = sum[i] + v;
        sq[i + 1] = sq[i] + v * v;
    }
    let cost = |a: usize, b: usize| -> f64 {
        let len = (b - a) as f64;
        let s = sum[b] - sum[a];
        (sq[b] - sq[a]) - s * s / len
    };

    let mut best = vec![f64::INFINITY; n + 1];
    let mut prev = vec![0usize; n + 1];
    best[0] = -penalty;
    for end in 1..=n {
        for start in 0..end {
            let candidate = best[start] + cost(start, end) + penalty;
            if candidate < best[end] {
                best[end] = candidate;
                prev[end] = start;
            }
        }
    }

    let mut boundaries = Vec::new();
    let mut at = n;
    while at > 0 {
        let start = prev[at];
        if start > 0 {
            boundaries.push(start);
        }
        at = start;
    }
    boundaries.reverse();
    boundaries
}

/// Compare the mean of the first and last thirds of the series.
fn trend(series: &[f64]) -> Trend {
    let third = (series.len() / 3).max(1);
    let head = series[..third].iter().sum::<f64>() / third as f64;
    let tail = series[series.len() - third..].iter().sum::<f64>() / third as f64;
    if tail - head > TREND_DELTA {
        Trend::Improving
    } else if head - tail > TREND_DELTA {
        Trend::Declining
    } else {
        Trend::Stable
    }
}
