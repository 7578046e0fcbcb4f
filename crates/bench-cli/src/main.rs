use anyhow::{anyhow, Result};
use bench_analysis::{aggregate, load_successful, render_report, write_csv, write_json};
use bench_core::{BenchConfig, TaskCatalog, DEFAULT_CONFIG_PATH};
use bench_runner::{judge_results, run_batch, JudgeOptions, ProcessAgent, Progress, RunOptions};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bench",
    version,
    about = "Agent benchmark harness: run, judge and aggregate"
)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// -v for info, -vv for debug. RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the task x condition x repetition matrix.
    Run {
        #[arg(long, num_args = 1..)]
        tasks: Vec<String>,
        #[arg(long, default_value_t = 3)]
        runs: u32,
        #[arg(long, num_args = 1..)]
        conditions: Vec<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        pause: Option<f64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Score stored answers with the blind grader.
    Judge {
        #[arg(long, num_args = 1..)]
        tasks: Vec<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        pause: Option<f64>,
        #[arg(long)]
        keywords_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Compute statistics and the comparison report.
    Aggregate {
        #[arg(long)]
        no_csv: bool,
        #[arg(long)]
        no_json: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration.
    Describe {
        #[arg(long, default_value_t = 3)]
        runs: u32,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli.config, cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(config_path: &Path, command: Commands) -> Result<Option<Value>> {
    let config = BenchConfig::load_or_default(config_path)?;
    info!(
        config = %config_path.display(),
        base_dir = %config.base_dir().display(),
        "loaded config"
    );

    match command {
        Commands::Run {
            tasks,
            runs,
            conditions,
            model,
            max_turns,
            pause,
            dry_run,
            json,
        } => {
            let catalog = TaskCatalog::load(&config.tasks_file)?;
            let selected = catalog.select(Some(tasks.as_slice()));
            if selected.is_empty() {
                return Err(anyhow!("No tasks found."));
            }
            let conditions = config.select_conditions(Some(conditions.as_slice()))?;

            let mut options = RunOptions::from_config(&config);
            options.runs = runs;
            options.max_turns_override = max_turns;
            options.dry_run = dry_run;
            options.progress = Progress::for_json(json);
            if let Some(model) = model {
                options.model = model;
            }
            if let Some(pause) = pause {
                options.pause_secs = pause;
            }

            let agent = ProcessAgent::from_config(&config)?;
            let summary = run_batch(
                &agent,
                &config.store(),
                &catalog,
                &selected,
                &conditions,
                &options,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "batch_id": summary.batch_id,
                    "dry_run": dry_run,
                    "planned": summary.planned,
                    "succeeded": summary.succeeded(),
                    "failed": summary.failed(),
                    "combined_path": summary.combined_path.map(|p| p.display().to_string()),
                    "manifest_path": summary.manifest_path.map(|p| p.display().to_string()),
                })));
            }
            if !dry_run {
                println!(
                    "Done: {} succeeded, {} failed",
                    summary.succeeded(),
                    summary.failed()
                );
            }
        }
        Commands::Judge {
            tasks,
            model,
            force,
            pause,
            keywords_only,
            json,
        } => {
            let catalog = TaskCatalog::load(&config.tasks_file)?;
            let mut options = JudgeOptions::from_config(&config)?;
            options.force = force;
            options.keywords_only = keywords_only;
            options.progress = Progress::for_json(json);
            if !tasks.is_empty() {
                options.task_filter = Some(tasks);
            }
            if let Some(model) = model {
                options.model = model;
            }
            if let Some(pause) = pause {
                options.pause_secs = pause;
            }

            let agent = ProcessAgent::from_config(&config)?;
            let summary = judge_results(&agent, &config.store(), &catalog, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "judge",
                    "considered": summary.considered,
                    "judged": summary.judged,
                    "judge_failures": summary.judge_failures,
                    "already_scored": summary.already_scored,
                    "keywords_only": summary.keywords_only,
                    "skipped": summary.skipped,
                    "total_judge_cost_usd": summary.total_judge_cost_usd,
                })));
            }
        }
        Commands::Aggregate {
            no_csv,
            no_json,
            json,
        } => {
            let store = config.store();
            let records = load_successful(&store)?;
            if records.is_empty() {
                return Err(anyhow!(
                    "No results found in {}",
                    store.raw_dir().display()
                ));
            }
            let metrics = &config.analysis.metrics;
            let entries = aggregate(&records, metrics);

            let reports = store.reports_dir();
            let csv_path = (!no_csv).then(|| reports.join("summary.csv"));
            let json_path = (!no_json).then(|| reports.join("full_report.json"));
            if let Some(path) = &csv_path {
                write_csv(path, &entries, metrics)?;
            }
            if let Some(path) = &json_path {
                write_json(path, &entries)?;
            }

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "records": records.len(),
                    "groups": serde_json::to_value(&entries)?,
                    "csv_path": csv_path.map(|p| p.display().to_string()),
                    "json_path": json_path.map(|p| p.display().to_string()),
                })));
            }
            println!("Loaded {} successful runs", records.len());
            print!(
                "{}",
                render_report(&entries, &config.condition_names(), metrics)
            );
            if let Some(path) = &csv_path {
                println!("\nCSV saved to {}", path.display());
            }
            if let Some(path) = &json_path {
                println!("JSON saved to {}", path.display());
            }
        }
        Commands::Describe { runs, json } => {
            let catalog = TaskCatalog::load(&config.tasks_file)?;
            let cells = catalog.tasks().len() * config.conditions.len() * runs as usize;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "tasks_file": config.tasks_file.display().to_string(),
                    "catalog_digest": catalog.digest,
                    "task_ids": catalog
                        .tasks()
                        .iter()
                        .map(|t| t.id.as_str())
                        .collect::<Vec<_>>(),
                    "conditions": config.conditions.iter().map(|c| json!({
                        "name": c.name,
                        "config_ref": c.config_ref.display().to_string(),
                    })).collect::<Vec<_>>(),
                    "model": config.agent.model,
                    "judge_model": config.judge_model(),
                    "run_timeout_secs": config.run.timeout_secs,
                    "judge_timeout_secs": config.judge.timeout_secs,
                    "run_pause_secs": config.run.pause_secs,
                    "judge_pause_secs": config.judge.pause_secs,
                    "results_dir": config.results_dir.display().to_string(),
                    "runs": runs,
                    "cells": cells,
                })));
            }
            println!("tasks_file: {}", config.tasks_file.display());
            println!("catalog_digest: {}", catalog.digest);
            println!("tasks: {}", catalog.tasks().len());
            println!("conditions:");
            for c in &config.conditions {
                println!("  {} -> {}", c.name, c.config_ref.display());
            }
            println!("model: {}", config.agent.model);
            println!("judge_model: {}", config.judge_model());
            println!(
                "timeouts: run={}s judge={}s",
                config.run.timeout_secs, config.judge.timeout_secs
            );
            println!(
                "pacing: run={}s judge={}s",
                config.run.pause_secs, config.judge.pause_secs
            );
            println!("results_dir: {}", config.results_dir.display());
            println!("cells: {} ({} runs)", cells, runs);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{}",
            concat!(
                r#"{"ok":false,"error":{"code":"serialization_error","#,
                r#""message":"failed to serialize JSON payload","details":{}}}"#
            )
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Judge { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}
