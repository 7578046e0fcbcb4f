//! Statistics and comparison reports over persisted run records.

pub mod aggregate;
pub mod report;
pub mod stats;

pub use aggregate::{aggregate, load_successful, AggregateEntry, MetricSummary};
pub use report::{
    compare, order_conditions, percent_change, render_comparison, render_csv, render_report,
    render_single, write_csv, write_json, Comparison, ComparisonRow,
};
pub use stats::{compute_stats, mean, Stats};
