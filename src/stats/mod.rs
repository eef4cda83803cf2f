//! Pure statistics functions shared by the Results Analyzer.
//!
//! No I/O, no `tracing`, no async — kept deliberately leaf-level so the
//! analyzer's "pure, deterministic" invariant (spec §4.2) is auditable by
//! inspection of this module's imports alone.

/// A ladder of percentile/summary statistics over a sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

/// Computes the summary ladder over `samples`. Returns `None` for an empty
/// sample set — callers (the analyzer) treat that as "insufficient data".
pub fn summarize(samples: &[f64]) -> Option<Summary> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let min = sorted[0];
    let max = sorted[count - 1];
    let mean = mean_of(&sorted);
    let std_dev = std_dev_of(&sorted, mean);

    Some(Summary {
        min,
        max,
        mean,
        std_dev,
        median: percentile(&sorted, 0.50),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        count,
    })
}

fn mean_of(sorted: &[f64]) -> f64 {
    sorted.iter().sum::<f64>() / sorted.len() as f64
}

fn std_dev_of(sorted: &[f64], mean: f64) -> f64 {
    if sorted.len() < 2 {
        return 0.0;
    }
    let variance =
        sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (sorted.len() - 1) as f64;
    variance.sqrt()
}

/// Nearest-rank percentile over an already-sorted slice. `p` is in `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Relative change of `current` vs `baseline`, e.g. `0.25` means a 25%
/// increase. Used by the regression detector (spec §4.2).
pub fn relative_change(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (current - baseline) / baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_empty_is_none() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn summarize_single_sample() {
        let s = summarize(&[42.0]).unwrap();
        assert_eq!(s.min, 42.0);
        assert_eq!(s.max, 42.0);
        assert_eq!(s.median, 42.0);
        assert_eq!(s.p99, 42.0);
        assert_eq!(s.std_dev, 0.0);
        assert_eq!(s.count, 1);
    }

    #[test]
    fn percentile_matches_known_ladder() {
        // 1..=100 ms: p50 should land near 50, p99 near 99.
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let summary = summarize(&samples).unwrap();
        assert!((summary.median - 50.0).abs() <= 1.0);
        assert!((summary.p95 - 95.0).abs() <= 1.0);
        assert!((summary.p99 - 99.0).abs() <= 1.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
    }

    #[test]
    fn relative_change_detects_increase_and_decrease() {
        assert!((relative_change(400.0, 600.0) - 0.5).abs() < 1e-9);
        assert!((relative_change(400.0, 200.0) - (-0.5)).abs() < 1e-9);
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert_eq!(relative_change(0.0, 5.0), f64::INFINITY);
    }

    #[test]
    fn mean_and_std_dev_basic() {
        let s = summarize(&[10.0, 20.0, 30.0]).unwrap();
        assert!((s.mean - 20.0).abs() < 1e-9);
        assert!(s.std_dev > 0.0);
    }
}
