//! Shared numeric guards for the detector and integrator.
//!
//! All correlation, slope, ratio, and entropy computations route through
//! here so division-by-zero and empty-sample edge cases are handled once.

/// Two-pass mean and population standard deviation. Returns `(mean, 0.0)`
/// for fewer than two samples — a single sample has no meaningful spread.
pub fn mean_stddev(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// How many standard deviations `x` sits from `mean`. Returns 0.0 when
/// `stddev` is zero (no spread means no deviation is meaningful).
pub fn z_score(x: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= f64::EPSILON {
        0.0
    } else {
        (x - mean).abs() / stddev
    }
}

/// Least-squares slope over `(x, y)` pairs.
/// `slope = (n*Σxy - Σx*Σy) / (n*Σx² - (Σx)²)`, guarded against a zero
/// denominator (collinear or single-point x values).
pub fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if points.len() < 2 {
        return 0.0;
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_x2: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() <= f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

/// Safe division: returns `default` instead of NaN/Inf when `denom` is
/// effectively zero.
pub fn safe_div(numer: f64, denom: f64, default: f64) -> f64 {
    if denom.abs() <= f64::EPSILON {
        default
    } else {
        numer / denom
    }
}

/// Co-occurrence correlation between two timestamp series: the fraction of
/// pairs `(a, b)` within `±max_lag_ms` of each other, normalized by the
/// smaller series length.
pub fn lagged_correlation(a: &[u64], b: &[u64], max_lag_ms: u64) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut matches = 0usize;
    for &ta in a {
        if b.iter().any(|&tb| ta.abs_diff(tb) <= max_lag_ms) {
            matches += 1;
        }
    }
    safe_div(matches as f64, a.len().min(b.len()) as f64, 0.0)
}

/// Estimated optimal lag between two timestamp series: the median of paired
/// differences between each `a` timestamp and its nearest `b` timestamp.
pub fn median_lag(a: &[u64], b: &[u64]) -> i64 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut diffs: Vec<i64> = a
        .iter()
        .filter_map(|&ta| {
            b.iter()
                .min_by_key(|&&tb| ta.abs_diff(tb))
                .map(|&tb| tb as i64 - ta as i64)
        })
        .collect();
    diffs.sort_unstable();
    diffs[diffs.len() / 2]
}

/// Normalized Shannon entropy (base 2, divided by log2(distinct_count)) of a
/// multiset of category counts. Returns 0.0 for fewer than two distinct
/// categories, where "variety" is undefined.
pub fn normalized_entropy(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || distinct < 2 {
        return 0.0;
    }
    let total = total as f64;
    let raw: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    safe_div(raw, (distinct as f64).log2(), 0.0)
}

/// Clamp a value into an inclusive range, for I5's intensity/valence bounds.
pub fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}
