//! Run, judge and aggregate together against the scripted agent.

use bench_analysis::{aggregate, load_successful};
use bench_core::{
    BenchConfig, Condition, FailureKind, Metric, QualityScore, ResultStore, RunKey, Task,
    TaskCatalog,
};
use bench_runner::fakes::{Scripted, ScriptedAgent};
use bench_runner::{judge_results, run_batch, JudgeOptions, Progress, RunOptions};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "bench_pipeline_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

fn catalog() -> TaskCatalog {
    TaskCatalog::from_tasks(
        Path::new("tasks.json"),
        vec![Task {
            id: "T1".to_string(),
            prompt: "Where is the retry policy configured?".to_string(),
            rubric: "Names the config module and the backoff constant.".to_string(),
            expected_keywords: vec!["backoff".to_string(), "config".to_string()],
            max_turns: Some(8),
        }],
    )
    .expect("catalog")
}

fn conditions() -> Vec<Condition> {
    vec![
        Condition::new("baseline", "config/mcp-baseline.json"),
        Condition::new("with-tool", "config/mcp-with-tool.json"),
    ]
}

fn run_options(runs: u32) -> RunOptions {
    let mut options = RunOptions::from_config(&BenchConfig::default());
    options.runs = runs;
    options.pause_secs = 0.0;
    options.progress = Progress::Quiet;
    options
}

fn judge_options() -> JudgeOptions {
    JudgeOptions {
        model: "sonnet".to_string(),
        tool_config: PathBuf::from("config/mcp-baseline.json"),
        timeout: Duration::from_secs(120),
        pause_secs: 0.0,
        force: false,
        keywords_only: false,
        task_filter: None,
        progress: Progress::Quiet,
    }
}

fn answer(turns: u64, cost: f64) -> Scripted {
    Scripted::envelope(
        json!({
            "result": "Retries use the backoff constant from the config module.",
            "num_turns": turns,
            "duration_ms": 4200,
            "duration_api_ms": 3900,
            "total_cost_usd": cost,
            "session_id": "s-1",
            "is_error": false,
            "usage": {
                "input_tokens": 100,
                "output_tokens": 40,
                "cache_read_input_tokens": 900,
                "cache_creation_input_tokens": 10
            }
        })
        .to_string(),
    )
}

fn verdict(score: u32) -> Scripted {
    let text = format!("{{\"score\": {}, \"reasoning\": \"accurate\"}}", score);
    Scripted::envelope(json!({"result": text, "total_cost_usd": 0.002}).to_string())
}

/// Populates a store with one timed-out cell and three answered ones.
fn seeded_store(tag: &str) -> ResultStore {
    let store = ResultStore::new(&temp_root(tag));
    let agent = ScriptedAgent::new([
        Scripted::Timeout,
        answer(3, 0.02),
        answer(5, 0.03),
        answer(4, 0.025),
    ]);
    let summary = run_batch(
        &agent,
        &store,
        &catalog(),
        catalog().tasks(),
        &conditions(),
        &run_options(2),
    )
    .expect("batch");
    assert_eq!(summary.planned, 4);
    assert_eq!(summary.failed(), 1);
    store
}

#[test]
fn timeout_cell_is_excluded_and_quality_is_averaged_per_condition() {
    let store = seeded_store("e2e");

    let failed = store
        .load(&RunKey::new("T1", "baseline", 1))
        .expect("load")
        .expect("record");
    assert_eq!(failed.failure_kind(), Some(FailureKind::Timeout));

    let grader = ScriptedAgent::new([verdict(8), verdict(9), verdict(9)]);
    let summary = judge_results(&grader, &store, &catalog(), &judge_options()).expect("judge");
    assert_eq!(summary.judged, 3);
    assert_eq!(summary.judge_failures, 0);
    assert_eq!(grader.call_count(), 3);
    // Grader calls are single-turn and run without skipping permissions.
    assert!(grader
        .requests()
        .iter()
        .all(|r| r.max_turns == 1 && !r.skip_permissions));

    let records = load_successful(&store).expect("records");
    assert_eq!(records.len(), 3);
    let report = aggregate(&records, &Metric::ALL);
    assert_eq!(report.len(), 2);

    let baseline = &report[0];
    assert_eq!(baseline.condition, "baseline");
    assert_eq!(baseline.n_runs, 1);
    let q = baseline.stats(Metric::QualityScore).expect("quality");
    assert_eq!(q.mean, 8.0);
    assert_eq!(q.n, 1);

    let with_tool = &report[1];
    assert_eq!(with_tool.condition, "with-tool");
    assert_eq!(with_tool.n_runs, 2);
    let q = with_tool.stats(Metric::QualityScore).expect("quality");
    assert_eq!(q.mean, 9.0);
    assert_eq!(q.n, 2);
    assert_eq!(with_tool.mean(Metric::KeywordHits), 2.0);
    assert_eq!(with_tool.mean(Metric::TotalInputTokens), 1010.0);
    assert_eq!(with_tool.total_tokens_mean, 140.0);

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn judge_visits_records_in_store_order() {
    let store = seeded_store("order");
    let grader = ScriptedAgent::new([verdict(6), verdict(7), verdict(8)]);
    judge_results(&grader, &store, &catalog(), &judge_options()).expect("judge");

    let expect = [
        ("baseline", 2, 6.0),
        ("with-tool", 1, 7.0),
        ("with-tool", 2, 8.0),
    ];
    for (cond, run, score) in expect {
        let record = store
            .load(&RunKey::new("T1", cond, run))
            .expect("load")
            .expect("record");
        assert_eq!(record.quality_score(), Some(QualityScore::Scored(score)));
    }

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn rejudging_without_force_makes_no_calls() {
    let store = seeded_store("idempotent");
    let first = ScriptedAgent::new([verdict(8), verdict(9), verdict(9)]);
    judge_results(&first, &store, &catalog(), &judge_options()).expect("judge");
    let snapshot = |store: &ResultStore| -> Vec<Vec<u8>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(store.raw_dir())
            .expect("raw dir")
            .map(|e| e.expect("entry").path())
            .collect();
        paths.sort();
        paths.iter().map(|p| std::fs::read(p).expect("read")).collect()
    };
    let before = snapshot(&store);

    let second = ScriptedAgent::new(Vec::<Scripted>::new());
    let summary = judge_results(&second, &store, &catalog(), &judge_options()).expect("rejudge");
    assert_eq!(second.call_count(), 0);
    assert_eq!(summary.already_scored, 3);
    assert_eq!(summary.judged, 0);
    // Scored records are left byte-for-byte untouched, judged_at included.
    assert_eq!(snapshot(&store), before);

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn failed_judgement_is_retried_and_force_overwrites_valid_scores() {
    let store = seeded_store("force");
    let garbled = Scripted::envelope(
        json!({"result": "I would rate this highly.", "total_cost_usd": 0.001}).to_string(),
    );
    let first = ScriptedAgent::new([garbled, verdict(9), verdict(9)]);
    let summary = judge_results(&first, &store, &catalog(), &judge_options()).expect("judge");
    assert_eq!(summary.judge_failures, 1);

    let key = RunKey::new("T1", "baseline", 2);
    let record = store.load(&key).expect("load").expect("record");
    assert_eq!(record.quality_score(), Some(QualityScore::JudgeFailed));
    assert!(record
        .quality()
        .expect("verdict")
        .reasoning
        .starts_with("Failed to parse:"));

    // Only the failed judgement is re-attempted without force.
    let retry = ScriptedAgent::new([verdict(5)]);
    let summary = judge_results(&retry, &store, &catalog(), &judge_options()).expect("retry");
    assert_eq!(retry.call_count(), 1);
    assert_eq!(summary.already_scored, 2);
    let record = store.load(&key).expect("load").expect("record");
    assert_eq!(record.quality_score(), Some(QualityScore::Scored(5.0)));

    let mut forced = judge_options();
    forced.force = true;
    let again = ScriptedAgent::new([verdict(2), verdict(3), verdict(4)]);
    judge_results(&again, &store, &catalog(), &forced).expect("force");
    assert_eq!(again.call_count(), 3);
    let record = store.load(&key).expect("load").expect("record");
    assert_eq!(record.quality_score(), Some(QualityScore::Scored(2.0)));

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn keywords_only_never_calls_the_grader() {
    let store = seeded_store("keywords");
    let mut options = judge_options();
    options.keywords_only = true;
    let grader = ScriptedAgent::new(Vec::<Scripted>::new());
    let summary = judge_results(&grader, &store, &catalog(), &options).expect("keywords");
    assert_eq!(grader.call_count(), 0);
    assert_eq!(summary.keywords_only, 3);

    let record = store
        .load(&RunKey::new("T1", "with-tool", 1))
        .expect("load")
        .expect("record");
    let coverage = record.keywords().expect("coverage");
    assert_eq!((coverage.hits, coverage.total), (2, 2));
    assert!(record.quality().is_none());

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn judging_an_empty_store_is_an_error() {
    let store = ResultStore::new(&temp_root("empty"));
    let grader = ScriptedAgent::new(Vec::<Scripted>::new());
    let err = judge_results(&grader, &store, &catalog(), &judge_options())
        .expect_err("nothing to judge");
    assert!(err.to_string().contains("No results found to judge"));
}
