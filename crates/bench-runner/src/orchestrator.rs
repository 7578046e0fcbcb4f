use anyhow::Result;
use bench_core::{
    truncate_chars, BenchConfig, Condition, FailureKind, ResultStore, RunKey, RunOutcome,
    RunRecord, Task, TaskCatalog,
};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{failure_detail, AgentEnvelope, AgentInvoker, AgentRequest, InvokeError};
use crate::pacing::Pacer;
use crate::progress::Progress;

const STDERR_DETAIL_CHARS: usize = 500;
const STDOUT_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub runs: u32,
    pub model: String,
    /// Replaces every task's own turn budget when set.
    pub max_turns_override: Option<u32>,
    pub default_max_turns: u32,
    pub append_system_prompt: String,
    pub timeout: Duration,
    pub pause_secs: f64,
    pub dry_run: bool,
    pub progress: Progress,
}

impl RunOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            runs: 3,
            model: config.agent.model.clone(),
            max_turns_override: None,
            default_max_turns: config.run.default_max_turns,
            append_system_prompt: config.run.append_system_prompt.clone(),
            timeout: config.run.timeout(),
            pause_secs: config.run.pause_secs,
            dry_run: false,
            progress: Progress::Stdout,
        }
    }
}

/// One (task, condition, repetition) unit of work.
#[derive(Debug, Clone)]
pub struct Cell<'a> {
    pub key: RunKey,
    pub task: &'a Task,
    pub condition: &'a Condition,
}

/// Repetition outermost, then task, then condition, so an interrupted batch
/// leaves completed repetitions contiguous.
pub fn plan_cells<'a>(tasks: &'a [Task], conditions: &'a [Condition], runs: u32) -> Vec<Cell<'a>> {
    let mut cells = Vec::with_capacity(tasks.len() * conditions.len() * runs as usize);
    for run_id in 1..=runs {
        for task in tasks {
            for condition in conditions {
                cells.push(Cell {
                    key: RunKey::new(&task.id, &condition.name, run_id),
                    task,
                    condition,
                });
            }
        }
    }
    cells
}

pub fn build_request(cell: &Cell<'_>, options: &RunOptions) -> AgentRequest {
    AgentRequest {
        prompt: cell.task.prompt.clone(),
        model: options.model.clone(),
        max_turns: options
            .max_turns_override
            .or(cell.task.max_turns)
            .unwrap_or(options.default_max_turns),
        tool_config: cell.condition.config_ref.clone(),
        append_system_prompt: Some(options.append_system_prompt.clone()),
        skip_permissions: true,
        timeout: options.timeout,
    }
}

/// Runs one cell to a record. Never fails: every problem becomes a
/// `Failure` outcome.
pub fn execute_cell(agent: &dyn AgentInvoker, cell: &Cell<'_>, options: &RunOptions) -> RunRecord {
    let request = build_request(cell, options);
    let key = cell.key.clone();
    let output = match agent.invoke(&request) {
        Ok(output) => output,
        Err(InvokeError::Timeout(limit)) => {
            return RunRecord::failure(
                key,
                FailureKind::Timeout,
                format!("timeout after {}s", limit.as_secs()),
            );
        }
        Err(err) => return RunRecord::failure(key, FailureKind::ProcessError, err.to_string()),
    };

    if output.is_hard_failure() {
        return RunRecord::failure(
            key,
            FailureKind::ProcessError,
            failure_detail(&output, STDERR_DETAIL_CHARS),
        );
    }

    match AgentEnvelope::parse(&output.stdout) {
        Ok(envelope) => {
            RunRecord::success(key, envelope.into_metrics(&options.model, output.elapsed))
        }
        Err(_) => RunRecord::failure(
            key,
            FailureKind::ParseError,
            format!(
                "JSON parse error: {}",
                truncate_chars(&output.stdout, STDOUT_DETAIL_CHARS)
            ),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub planned: usize,
    pub records: Vec<RunRecord>,
    pub combined_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| !r.is_failure()).count()
    }

    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| r.is_failure()).count()
    }
}

/// Drives the whole matrix, persisting each cell before starting the next.
/// Only store write errors abort the batch.
pub fn run_batch(
    agent: &dyn AgentInvoker,
    store: &ResultStore,
    catalog: &TaskCatalog,
    tasks: &[Task],
    conditions: &[Condition],
    options: &RunOptions,
) -> Result<BatchSummary> {
    let started_at = Utc::now();
    let batch_id = store.unused_batch_id(&format!(
        "batch_{}",
        started_at.format("%Y%m%d_%H%M%S_%6f")
    ));
    let cells = plan_cells(tasks, conditions, options.runs);
    let total = cells.len();
    let condition_names: Vec<&str> = conditions.iter().map(|c| c.name.as_str()).collect();

    let out = options.progress;
    out.line(format_args!(
        "\nBenchmark: {} tasks x {} conditions x {} runs = {} runs",
        tasks.len(),
        conditions.len(),
        options.runs,
        total
    ));
    out.line(format_args!("Model: {}", options.model));
    out.line(format_args!("Conditions: {}\n", condition_names.join(", ")));
    info!(%batch_id, cells = total, dry_run = options.dry_run, "starting batch");

    let mut pacer = Pacer::from_secs_f64(options.pause_secs);
    let mut records = Vec::new();

    for (idx, cell) in cells.iter().enumerate() {
        out.line(format_args!(
            "[{}/{}] Run {} | {} | {}",
            idx + 1,
            total,
            cell.key.run_id,
            cell.key.task_id,
            cell.key.condition
        ));

        if options.dry_run {
            let request = build_request(cell, options);
            out.line(format_args!("  [DRY RUN] {}", agent.describe(&request)));
            continue;
        }

        pacer.wait();
        let record = execute_cell(agent, cell, options);
        pacer.mark();

        store.save(&record)?;
        report_cell(out, &record);
        records.push(record);
    }

    let mut summary = BatchSummary {
        batch_id: batch_id.clone(),
        planned: total,
        records,
        combined_path: None,
        manifest_path: None,
    };
    if options.dry_run {
        return Ok(summary);
    }
    if !summary.records.is_empty() {
        let path = store.write_combined(&summary.records)?;
        out.line(format_args!("\nAll results saved to {}", path.display()));
        summary.combined_path = Some(path);
    }

    let manifest = json!({
        "schema_version": "batch_manifest_v1",
        "batch_id": batch_id,
        "model": options.model,
        "conditions": condition_names,
        "runs": options.runs,
        "task_ids": tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        "catalog_path": catalog.path.display().to_string(),
        "catalog_digest": catalog.digest,
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
        "cells": total,
        "succeeded": summary.succeeded(),
        "failed": summary.failed(),
    });
    summary.manifest_path = Some(store.write_batch_manifest(&summary.batch_id, &manifest)?);
    info!(
        batch_id = %summary.batch_id,
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        "batch finished"
    );
    Ok(summary)
}

fn report_cell(out: Progress, record: &RunRecord) {
    match record.outcome() {
        RunOutcome::Failure { kind, detail } => {
            out.line(format_args!("  -> ERROR: {}", truncate_chars(detail, 80)));
            warn!(
                cell = %record.key(),
                kind = kind.as_str(),
                "cell failed: {}",
                truncate_chars(detail, 200)
            );
        }
        RunOutcome::Success(m) => {
            out.line(format_args!(
                "  -> turns={} tokens={} cost=${:.4} time={}s",
                m.num_turns,
                m.usage.total_tokens(),
                m.total_cost_usd,
                m.wall_time_s
            ));
        }
    }
}
