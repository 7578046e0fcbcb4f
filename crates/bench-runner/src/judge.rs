use anyhow::{anyhow, Result};
use bench_core::{
    truncate_chars, BenchConfig, KeywordCoverage, QualityScore, QualityVerdict, ResultStore,
    RunRecord, Task, TaskCatalog,
};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{
    failure_detail, AgentEnvelope, AgentInvoker, AgentRequest, InvokeError, ProcessOutput,
};
use crate::pacing::Pacer;
use crate::progress::Progress;

const REASONING_CHARS: usize = 200;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```json\s*|\s*```").expect("valid fence pattern"));
static SCORE_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""score"\s*:\s*(\d+)"#).expect("valid score pattern"));

#[derive(Debug, Clone)]
pub struct JudgeOptions {
    pub model: String,
    pub tool_config: PathBuf,
    pub timeout: Duration,
    pub pause_secs: f64,
    pub force: bool,
    pub keywords_only: bool,
    pub task_filter: Option<Vec<String>>,
    pub progress: Progress,
}

impl JudgeOptions {
    pub fn from_config(config: &BenchConfig) -> Result<Self> {
        Ok(Self {
            model: config.judge_model().to_string(),
            tool_config: config.judge_condition()?.config_ref.clone(),
            timeout: config.judge.timeout(),
            pause_secs: config.judge.pause_secs,
            force: false,
            keywords_only: false,
            task_filter: None,
            progress: Progress::Stdout,
        })
    }
}

/// The grading prompt. It never mentions which condition produced the answer.
pub fn build_judge_prompt(task: &Task, answer: &str) -> String {
    let keywords = serde_json::to_string_pretty(&task.expected_keywords)
        .unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are evaluating the quality of an answer to a code understanding question.

QUESTION:
{prompt}

EXPECTED ANSWER SHOULD CONTAIN THESE CONCEPTS:
{keywords}

SCORING RUBRIC:
{rubric}

ANSWER TO EVALUATE:
{answer}

Score this answer from 0 to 10 based on the rubric. Return ONLY valid JSON (no markdown fences):
{{\"score\": <0-10>, \"reasoning\": \"<brief explanation of score>\"}}",
        prompt = task.prompt,
        keywords = keywords,
        rubric = task.rubric,
        answer = answer,
    )
}

/// A score recovered from the grader's text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub score: f64,
    pub reasoning: String,
}

type ScoreParser = fn(&str) -> Option<ParsedScore>;

/// Tried in order, first hit wins. Later stages are more permissive.
const SCORE_PARSERS: &[ScoreParser] = &[parse_score_object, scan_score_field];

/// Strips markdown fences and reads a `{score, reasoning}` object.
pub fn parse_score_object(text: &str) -> Option<ParsedScore> {
    let clean = CODE_FENCE.replace_all(text, "");
    let value: Value = serde_json::from_str(clean.trim()).ok()?;
    let score = value.get("score")?.as_f64()?;
    QualityScore::scored(score)?;
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(ParsedScore { score, reasoning })
}

/// Finds `"score": <int>` anywhere in the raw text.
pub fn scan_score_field(text: &str) -> Option<ParsedScore> {
    let caps = SCORE_FIELD.captures(text)?;
    let score = caps.get(1)?.as_str().parse::<u32>().ok()? as f64;
    QualityScore::scored(score)?;
    Some(ParsedScore {
        score,
        reasoning: truncate_chars(text, REASONING_CHARS),
    })
}

pub fn parse_score(text: &str) -> Option<ParsedScore> {
    SCORE_PARSERS.iter().find_map(|parser| parser(text))
}

fn failed(reasoning: String, judge_cost_usd: f64) -> QualityVerdict {
    QualityVerdict {
        score: QualityScore::JudgeFailed,
        reasoning,
        judge_cost_usd,
        judged_at: Utc::now(),
    }
}

/// Turns one grader call into a verdict. Never fails: anything that cannot
/// be resolved to a score becomes `JudgeFailed` with a diagnostic.
pub fn verdict_from_invocation(
    result: Result<ProcessOutput, InvokeError>,
) -> QualityVerdict {
    let output = match result {
        Ok(output) => output,
        Err(InvokeError::Timeout(_)) => return failed("Judge timed out".to_string(), 0.0),
        Err(err) => return failed(format!("Judge error: {}", err), 0.0),
    };
    if output.is_hard_failure() {
        return failed(
            format!("Judge error: {}", failure_detail(&output, REASONING_CHARS)),
            0.0,
        );
    }
    let envelope = match AgentEnvelope::parse(&output.stdout) {
        Ok(envelope) => envelope,
        Err(_) => return failed("Judge JSON parse error".to_string(), 0.0),
    };
    let text = envelope.result_text();
    let cost = envelope.cost_usd();
    match parse_score(text) {
        Some(parsed) => QualityVerdict {
            score: QualityScore::Scored(parsed.score),
            reasoning: parsed.reasoning,
            judge_cost_usd: cost,
            judged_at: Utc::now(),
        },
        None => failed(
            format!("Failed to parse: {}", truncate_chars(text, REASONING_CHARS)),
            cost,
        ),
    }
}

pub fn grade(
    agent: &dyn AgentInvoker,
    task: &Task,
    answer: &str,
    options: &JudgeOptions,
) -> QualityVerdict {
    let request = AgentRequest {
        prompt: build_judge_prompt(task, answer),
        model: options.model.clone(),
        max_turns: 1,
        tool_config: options.tool_config.clone(),
        append_system_prompt: None,
        skip_permissions: false,
        timeout: options.timeout,
    };
    verdict_from_invocation(agent.invoke(&request))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JudgeSummary {
    pub considered: usize,
    pub judged: usize,
    pub judge_failures: usize,
    pub already_scored: usize,
    pub keywords_only: usize,
    pub skipped: usize,
    pub total_judge_cost_usd: f64,
}

/// Scores every stored, non-failed record (optionally filtered by task id)
/// and writes the result back under the record's own key.
pub fn judge_results(
    agent: &dyn AgentInvoker,
    store: &ResultStore,
    catalog: &TaskCatalog,
    options: &JudgeOptions,
) -> Result<JudgeSummary> {
    let records: Vec<RunRecord> = store
        .load_all()?
        .into_iter()
        .filter(|r| !r.is_failure())
        .filter(|r| match options.task_filter.as_deref() {
            Some(ids) if !ids.is_empty() => ids.iter().any(|id| id == &r.key().task_id),
            _ => true,
        })
        .collect();
    if records.is_empty() {
        return Err(anyhow!("No results found to judge."));
    }

    let out = options.progress;
    out.line(format_args!("Judging {} results", records.len()));
    info!(
        records = records.len(),
        force = options.force,
        keywords_only = options.keywords_only,
        "starting judge pass"
    );

    let total = records.len();
    let mut summary = JudgeSummary {
        considered: total,
        ..JudgeSummary::default()
    };
    let mut pacer = Pacer::from_secs_f64(options.pause_secs);

    for (i, mut record) in records.into_iter().enumerate() {
        let tag = format!("[{}/{}]", i + 1, total);
        let name = record.key().file_name();
        let Some(task) = catalog.get(&record.key().task_id) else {
            out.line(format_args!(
                "  SKIP {}: task {} not found",
                name,
                record.key().task_id
            ));
            summary.skipped += 1;
            continue;
        };
        let answer = record.result_text().to_string();
        if answer.is_empty() {
            out.line(format_args!("  SKIP {}: no result text", name));
            summary.skipped += 1;
            continue;
        }

        let coverage = KeywordCoverage::measure(&answer, &task.expected_keywords);
        let (hits, kw_total) = (coverage.hits, coverage.total);

        if options.keywords_only {
            record.set_keywords(coverage);
            store.save(&record)?;
            out.line(format_args!("  {} {}: keywords={}/{}", tag, name, hits, kw_total));
            summary.keywords_only += 1;
            continue;
        }

        if !options.force && record.has_valid_score() {
            if let Some(score) = record.quality_score() {
                out.line(format_args!(
                    "  {} {}: already scored ({}), skipping",
                    tag, name, score
                ));
            }
            summary.already_scored += 1;
            continue;
        }

        out.print(format_args!("  {} {}: judging...", tag, name));

        pacer.wait();
        let verdict = grade(agent, task, &answer, options);
        pacer.mark();

        summary.judged += 1;
        summary.total_judge_cost_usd += verdict.judge_cost_usd;
        if !verdict.score.is_valid() {
            summary.judge_failures += 1;
            warn!(cell = %record.key(), "judging failed: {}", verdict.reasoning);
        }
        out.line(format_args!(" score={} keywords={}/{}", verdict.score, hits, kw_total));

        record.set_keywords(coverage);
        record.set_quality(verdict);
        store.save(&record)?;
    }

    if summary.total_judge_cost_usd > 0.0 {
        out.line(format_args!(
            "\nTotal judge cost: ${:.4}",
            summary.total_judge_cost_usd
        ));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(result: &str, cost: f64) -> ProcessOutput {
        let stdout = serde_json::json!({"result": result, "total_cost_usd": cost}).to_string();
        ProcessOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn plain_json_object_is_parsed() {
        let parsed = parse_score(r#"{"score": 8, "reasoning": "covers retries"}"#).expect("score");
        assert_eq!(parsed.score, 8.0);
        assert_eq!(parsed.reasoning, "covers retries");
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let text = "```json\n{\"score\": 6.5, \"reasoning\": \"partial\"}\n```";
        let parsed = parse_score(text).expect("score");
        assert_eq!(parsed.score, 6.5);
        assert_eq!(parsed.reasoning, "partial");

        let bare = "```\n{\"score\": 4, \"reasoning\": \"thin\"}\n```";
        assert_eq!(parse_score(bare).expect("score").score, 4.0);
    }

    #[test]
    fn embedded_score_falls_back_to_pattern_scan() {
        let text = r#"Here is my verdict: {"score": 7, "reasoning": "good but "unquoted" bits}"#;
        assert!(parse_score_object(text).is_none());
        let parsed = parse_score(text).expect("score");
        assert_eq!(parsed.score, 7.0);
        assert_eq!(parsed.reasoning, text);
    }

    #[test]
    fn pattern_scan_reasoning_is_truncated() {
        let text = format!("\"score\": 9 {}", "x".repeat(500));
        let parsed = scan_score_field(&text).expect("score");
        assert_eq!(parsed.reasoning.chars().count(), 200);
    }

    #[test]
    fn out_of_range_and_missing_scores_do_not_resolve() {
        assert!(parse_score(r#"{"score": 42, "reasoning": "?"}"#).is_none());
        assert!(parse_score(r#"{"reasoning": "no score"}"#).is_none());
        assert!(parse_score("I would rate this highly.").is_none());
    }

    #[test]
    fn verdict_keeps_cost_even_when_text_is_unparseable() {
        let verdict = verdict_from_invocation(Ok(envelope("no idea", 0.02)));
        assert_eq!(verdict.score, QualityScore::JudgeFailed);
        assert_eq!(verdict.reasoning, "Failed to parse: no idea");
        assert_eq!(verdict.judge_cost_usd, 0.02);
    }

    #[test]
    fn verdict_failure_modes_map_to_judge_failed() {
        let timeout = verdict_from_invocation(Err(InvokeError::Timeout(Duration::from_secs(120))));
        assert_eq!(timeout.score, QualityScore::JudgeFailed);
        assert_eq!(timeout.reasoning, "Judge timed out");

        let hard = verdict_from_invocation(Ok(ProcessOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "auth expired".to_string(),
            elapsed: Duration::ZERO,
        }));
        assert_eq!(hard.score, QualityScore::JudgeFailed);
        assert_eq!(hard.reasoning, "Judge error: auth expired");

        let garbage = verdict_from_invocation(Ok(ProcessOutput {
            exit_code: Some(0),
            stdout: "<html>".to_string(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }));
        assert_eq!(garbage.reasoning, "Judge JSON parse error");
    }

    #[test]
    fn verdict_scores_fenced_envelope_result() {
        let verdict = verdict_from_invocation(Ok(envelope(
            "```json\n{\"score\": 0, \"reasoning\": \"wrong component\"}\n```",
            0.01,
        )));
        assert_eq!(verdict.score, QualityScore::Scored(0.0));
        assert_eq!(verdict.judge_cost_usd, 0.01);
    }

    #[test]
    fn judge_prompt_embeds_task_material_verbatim() {
        let task = Task {
            id: "T1".to_string(),
            prompt: "How are jobs retried?".to_string(),
            rubric: "10: names the queue".to_string(),
            expected_keywords: vec!["Queue".to_string(), "Retry".to_string()],
            max_turns: None,
        };
        let prompt = build_judge_prompt(&task, "via a retry queue");
        assert!(prompt.contains("QUESTION:\nHow are jobs retried?"));
        assert!(prompt.contains("[\n  \"Queue\",\n  \"Retry\"\n]"));
        assert!(prompt.contains("SCORING RUBRIC:\n10: names the queue"));
        assert!(prompt.contains("ANSWER TO EVALUATE:\nvia a retry queue"));
        assert!(prompt
            .ends_with(r#"{"score": <0-10>, "reasoning": "<brief explanation of score>"}"#));
    }
}
