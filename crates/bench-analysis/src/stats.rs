use serde::{Deserialize, Serialize};

/// Descriptive statistics over one sample. An empty sample is all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation; zero below two samples.
    pub stdev: f64,
    pub n: usize,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn sample_stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

pub fn compute_stats(values: &[f64]) -> Stats {
    let m = mean(values);
    Stats {
        mean: m,
        median: median(values),
        stdev: sample_stdev(values, m),
        n: values.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_all_zero() {
        assert_eq!(compute_stats(&[]), Stats::default());
    }

    #[test]
    fn single_sample_has_zero_spread_and_mean_equals_median() {
        let s = compute_stats(&[42.0]);
        assert_eq!(s.mean, 42.0);
        assert_eq!(s.median, 42.0);
        assert_eq!(s.stdev, 0.0);
        assert_eq!(s.n, 1);
    }

    #[test]
    fn sample_stdev_uses_n_minus_one() {
        let s = compute_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(s.mean, 5.0);
        assert_eq!(s.median, 4.5);
        assert!((s.stdev - 2.138_089_935).abs() < 1e-6, "stdev {}", s.stdev);
    }

    #[test]
    fn median_of_unsorted_odd_sample() {
        assert_eq!(compute_stats(&[9.0, 1.0, 5.0]).median, 5.0);
    }
}
