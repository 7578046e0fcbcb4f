use anyhow::Result;
use bench_core::{Metric, ResultStore, RunRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::stats::{compute_stats, mean, Stats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: Metric,
    #[serde(flatten)]
    pub stats: Stats,
}

/// Statistics for one (task, condition) group. Derived on every run of the
/// aggregator and never stored as a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub task_id: String,
    pub condition: String,
    pub n_runs: usize,
    pub metrics: Vec<MetricSummary>,
    /// Mean of input plus output tokens per run, cache tokens excluded.
    pub total_tokens_mean: f64,
}

impl AggregateEntry {
    pub fn stats(&self, metric: Metric) -> Option<&Stats> {
        self.metrics
            .iter()
            .find(|m| m.metric == metric)
            .map(|m| &m.stats)
    }

    pub fn mean(&self, metric: Metric) -> f64 {
        self.stats(metric).map(|s| s.mean).unwrap_or(0.0)
    }

    /// The mean, or `None` when the group has no samples for the metric
    /// (e.g. every judgement failed).
    pub fn sampled_mean(&self, metric: Metric) -> Option<f64> {
        self.stats(metric).filter(|s| s.n > 0).map(|s| s.mean)
    }
}

/// Every stored record that did not fail.
pub fn load_successful(store: &ResultStore) -> Result<Vec<RunRecord>> {
    Ok(store
        .load_all()?
        .into_iter()
        .filter(|r| !r.is_failure())
        .collect())
}

/// Groups by (task, condition), sorted by key. Failed cells are ignored here
/// as well, so callers may pass the raw store contents.
pub fn aggregate(records: &[RunRecord], metrics: &[Metric]) -> Vec<AggregateEntry> {
    let mut grouped: BTreeMap<(&str, &str), Vec<&RunRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.is_failure()) {
        let key = record.key();
        grouped
            .entry((key.task_id.as_str(), key.condition.as_str()))
            .or_default()
            .push(record);
    }

    grouped
        .into_iter()
        .map(|((task_id, condition), runs)| {
            let metrics = metrics
                .iter()
                .map(|&metric| {
                    let mut values: Vec<f64> =
                        runs.iter().filter_map(|r| metric.sample(r)).collect();
                    if metric == Metric::QualityScore {
                        values.retain(|v| *v >= 0.0);
                    }
                    MetricSummary {
                        metric,
                        stats: compute_stats(&values),
                    }
                })
                .collect();
            debug!(task_id, condition, runs = runs.len(), "aggregated group");
            let total_tokens: Vec<f64> = runs
                .iter()
                .filter_map(|r| r.metrics())
                .map(|m| m.usage.total_tokens() as f64)
                .collect();
            AggregateEntry {
                task_id: task_id.to_string(),
                condition: condition.to_string(),
                n_runs: runs.len(),
                metrics,
                total_tokens_mean: mean(&total_tokens),
            }
        })
        .collect()
}
