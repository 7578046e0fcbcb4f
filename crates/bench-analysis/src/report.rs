use anyhow::Result;
use bench_core::{atomic_write_bytes, atomic_write_json_pretty, Metric};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::aggregate::AggregateEntry;
use crate::stats::mean;

const TOTAL_TOKENS_LABEL: &str = "Total Tokens";

/// Percent change relative to `baseline`. Defined as zero when the baseline
/// is zero.
pub fn percent_change(baseline: f64, delta: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        delta / baseline * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    pub label: String,
    pub precision: usize,
    pub baseline: f64,
    pub candidate: f64,
    pub delta: f64,
    pub percent: f64,
}

impl ComparisonRow {
    fn new(label: &str, precision: usize, baseline: f64, candidate: f64) -> Self {
        let delta = candidate - baseline;
        Self {
            label: label.to_string(),
            precision,
            baseline,
            candidate,
            delta,
            percent: percent_change(baseline, delta),
        }
    }
}

/// Side-by-side comparison of two conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub baseline: String,
    pub candidate: String,
    /// Per task, one row per metric plus a total-tokens row. Tasks missing
    /// either condition are left out.
    pub tasks: Vec<(String, Vec<ComparisonRow>)>,
    /// Mean of the per-task condition means, one row per metric.
    pub averages: Vec<ComparisonRow>,
}

/// Configured conditions first, in configured order, then any others
/// alphabetically.
pub fn order_conditions(entries: &[AggregateEntry], configured: &[String]) -> Vec<String> {
    let present: BTreeSet<&str> = entries.iter().map(|e| e.condition.as_str()).collect();
    let mut ordered: Vec<String> = configured
        .iter()
        .filter(|c| present.contains(c.as_str()))
        .cloned()
        .collect();
    for c in present {
        if !ordered.iter().any(|o| o == c) {
            ordered.push(c.to_string());
        }
    }
    ordered
}

/// `None` when fewer than two conditions are present.
pub fn compare(
    entries: &[AggregateEntry],
    configured: &[String],
    metrics: &[Metric],
) -> Option<Comparison> {
    let conditions = order_conditions(entries, configured);
    let (c1, c2) = match conditions.as_slice() {
        [c1, c2, ..] => (c1.clone(), c2.clone()),
        _ => return None,
    };
    let find = |task: &str, cond: &str| {
        entries
            .iter()
            .find(|e| e.task_id == task && e.condition == cond)
    };

    let task_ids: BTreeSet<&str> = entries.iter().map(|e| e.task_id.as_str()).collect();
    let mut tasks = Vec::new();
    for task in task_ids {
        let (Some(r1), Some(r2)) = (find(task, &c1), find(task, &c2)) else {
            continue;
        };
        let mut rows: Vec<ComparisonRow> = metrics
            .iter()
            .filter_map(|&m| {
                let (v1, v2) = (r1.sampled_mean(m)?, r2.sampled_mean(m)?);
                Some(ComparisonRow::new(m.label(), m.precision(), v1, v2))
            })
            .collect();
        rows.push(ComparisonRow::new(
            TOTAL_TOKENS_LABEL,
            0,
            r1.total_tokens_mean,
            r2.total_tokens_mean,
        ));
        tasks.push((task.to_string(), rows));
    }

    let condition_means = |cond: &str, metric: Metric| -> Vec<f64> {
        entries
            .iter()
            .filter(|e| e.condition == cond)
            .filter_map(|e| e.sampled_mean(metric))
            .collect()
    };
    let averages = metrics
        .iter()
        .filter_map(|&m| {
            let v1 = condition_means(&c1, m);
            let v2 = condition_means(&c2, m);
            if v1.is_empty() || v2.is_empty() {
                return None;
            }
            Some(ComparisonRow::new(m.label(), m.precision(), mean(&v1), mean(&v2)))
        })
        .collect();

    Some(Comparison {
        baseline: c1,
        candidate: c2,
        tasks,
        averages,
    })
}

fn row_line(first_col: &str, row: &ComparisonRow) -> String {
    let p = row.precision;
    format!(
        "{:<25} | {:<16} | {:>14.p$} | {:>14.p$} | {:>12.p$} | {:>+7.1}%",
        first_col,
        row.label,
        row.baseline,
        row.candidate,
        row.delta,
        row.percent,
        p = p
    )
}

pub fn render_comparison(cmp: &Comparison) -> String {
    let header = format!(
        "{:<25} | {:<16} | {:>14} | {:>14} | {:>12} | {:>8}",
        "Task", "Metric", cmp.baseline, cmp.candidate, "Delta", "%"
    );
    let width = header.chars().count();
    let sep = "-".repeat(width);
    let rule = "=".repeat(width);

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "BENCHMARK COMPARISON REPORT");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "{}", header);
    let _ = writeln!(out, "{}", sep);
    for (task, rows) in &cmp.tasks {
        for (i, row) in rows.iter().enumerate() {
            let first = if i == 0 { task.as_str() } else { "" };
            let _ = writeln!(out, "{}", row_line(first, row));
        }
        let _ = writeln!(out, "{}", sep);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "AVERAGES ACROSS ALL TASKS:");
    let _ = writeln!(out, "{}", sep);
    for row in &cmp.averages {
        let _ = writeln!(out, "{}", row_line("AVERAGE", row));
    }
    let _ = writeln!(out, "{}", sep);
    out
}

/// Listing used when there is nothing to compare against.
pub fn render_single(entries: &[AggregateEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{:<25} | {:<14} | {:>6} | {:>10} | {:>10} | {:>8} | {:>8}",
        "Task", "Condition", "Turns", "Tokens", "Cost", "Time(s)", "Quality"
    );
    let _ = writeln!(out, "{}", "-".repeat(97));
    for e in entries {
        let quality = match e.stats(Metric::QualityScore) {
            Some(s) if s.n > 0 => format!("{:>8.1}", s.mean),
            _ => format!("{:>8}", "-"),
        };
        let _ = writeln!(
            out,
            "{:<25} | {:<14} | {:>6.1} | {:>10.0} | ${:>9.5} | {:>8.1} | {}",
            e.task_id,
            e.condition,
            e.mean(Metric::NumTurns),
            e.total_tokens_mean,
            e.mean(Metric::TotalCostUsd),
            e.mean(Metric::DurationMs) / 1000.0,
            quality
        );
    }
    out
}

pub fn render_report(
    entries: &[AggregateEntry],
    configured: &[String],
    metrics: &[Metric],
) -> String {
    match compare(entries, configured, metrics) {
        Some(cmp) => render_comparison(&cmp),
        None => format!(
            "Need at least 2 conditions for comparison.\n{}",
            render_single(entries)
        ),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Flat form: one row per group, one column per statistic.
pub fn render_csv(entries: &[AggregateEntry], metrics: &[Metric]) -> String {
    let mut header = vec![
        "task_id".to_string(),
        "condition".to_string(),
        "n_runs".to_string(),
    ];
    for m in metrics {
        for stat in ["mean", "median", "stdev"] {
            header.push(format!("{}_{}", m.key(), stat));
        }
    }
    header.push("total_tokens_mean".to_string());

    let mut out = header.join(",");
    out.push('\n');
    for e in entries {
        let mut row = vec![csv_field(&e.task_id), csv_field(&e.condition), e.n_runs.to_string()];
        for &m in metrics {
            let s = e.stats(m).copied().unwrap_or_default();
            row.push(s.mean.to_string());
            row.push(s.median.to_string());
            row.push(s.stdev.to_string());
        }
        row.push(e.total_tokens_mean.to_string());
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

pub fn write_csv(path: &Path, entries: &[AggregateEntry], metrics: &[Metric]) -> Result<()> {
    atomic_write_bytes(path, render_csv(entries, metrics).as_bytes())?;
    info!(path = %path.display(), rows = entries.len(), "wrote csv summary");
    Ok(())
}

pub fn write_json(path: &Path, entries: &[AggregateEntry]) -> Result<()> {
    atomic_write_json_pretty(path, entries)?;
    info!(path = %path.display(), "wrote json report");
    Ok(())
}
