use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sha256_bytes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub rubric: String,
    #[serde(rename = "expected_answer_keywords", alias = "expected_keywords", default)]
    pub expected_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tasks: Vec<Task>,
}

/// The task definitions a batch draws from, in file order.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    pub path: PathBuf,
    pub digest: String,
    tasks: Vec<Task>,
}

impl TaskCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read task catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid task catalog {}", path.display()))?;
        let catalog = Self::from_tasks(path, file.tasks)?;
        Ok(Self {
            digest: sha256_bytes(&bytes),
            ..catalog
        })
    }

    pub fn from_tasks(path: &Path, tasks: Vec<Task>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for task in &tasks {
            validate_key_component("task id", &task.id)?;
            if !seen.insert(task.id.as_str()) {
                return Err(anyhow!("duplicate task id in catalog: {}", task.id));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            digest: String::new(),
            tasks,
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Catalog order is preserved; an empty or absent filter keeps everything.
    pub fn select(&self, ids: Option<&[String]>) -> Vec<Task> {
        match ids {
            Some(ids) if !ids.is_empty() => self
                .tasks
                .iter()
                .filter(|t| ids.iter().any(|id| id == &t.id))
                .cloned()
                .collect(),
            _ => self.tasks.clone(),
        }
    }
}

/// Task ids and condition names become parts of a record's file name. They
/// are limited to ASCII letters, digits, `-` and `.` (no leading `.`, no
/// `..`), so `{task}_{condition}_run{n}` stays unambiguous and flat.
pub fn validate_key_component(kind: &str, value: &str) -> Result<()> {
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if value.is_empty() || !allowed || value.starts_with('.') || value.contains("..") {
        return Err(anyhow!(
            "invalid {} '{}': only ASCII letters, digits, '-' and '.' are allowed",
            kind,
            value
        ));
    }
    Ok(())
}

/// Identity of one cell. The triple is the storage key and never changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub task_id: String,
    pub condition: String,
    pub run_id: u32,
}

impl RunKey {
    pub fn new(task_id: impl Into<String>, condition: impl Into<String>, run_id: u32) -> Self {
        Self {
            task_id: task_id.into(),
            condition: condition.into(),
            run_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_key_component("task id", &self.task_id)?;
        validate_key_component("condition", &self.condition)
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}_run{}.json", self.task_id, self.condition, self.run_id)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | run {}", self.task_id, self.condition, self.run_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ProcessError,
    ParseError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ProcessError => "process_error",
            FailureKind::ParseError => "parse_error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Non-cached plus both cache components. Always derived, never stored.
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }

    /// Non-cached input plus output, without cache tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub result_text: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub wall_time_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(RunMetrics),
    Failure { kind: FailureKind, detail: String },
}

/// Grader verdict. `JudgeFailed` is kept apart from any numeric score so a
/// failed grading attempt can never be averaged in as a low score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum QualityScore {
    Scored(f64),
    JudgeFailed,
}

impl QualityScore {
    pub const MAX: f64 = 10.0;

    /// Accepts only finite scores inside `[0, 10]`.
    pub fn scored(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=Self::MAX).contains(&value) {
            Some(QualityScore::Scored(value))
        } else {
            None
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            QualityScore::Scored(v) => Some(v),
            QualityScore::JudgeFailed => None,
        }
    }

    pub fn is_valid(self) -> bool {
        self.value().is_some()
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityScore::Scored(v) => write!(f, "{}/10", v),
            QualityScore::JudgeFailed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub score: QualityScore,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub judge_cost_usd: f64,
    pub judged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordCoverage {
    pub hits: usize,
    pub total: usize,
    /// Matched keywords in task order.
    pub matched: Vec<String>,
}

impl KeywordCoverage {
    /// Case-insensitive substring containment of each keyword in `text`.
    pub fn measure(text: &str, keywords: &[String]) -> Self {
        let haystack = text.to_lowercase();
        let matched: Vec<String> = keywords
            .iter()
            .filter(|kw| haystack.contains(&kw.to_lowercase()))
            .cloned()
            .collect();
        Self {
            hits: matched.len(),
            total: keywords.len(),
            matched,
        }
    }
}

/// One persisted cell. Identity and outcome are fixed at creation; only the
/// judging fields are updated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(flatten)]
    key: RunKey,
    recorded_at: DateTime<Utc>,
    outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keywords: Option<KeywordCoverage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quality: Option<QualityVerdict>,
}

impl RunRecord {
    pub fn new(key: RunKey, outcome: RunOutcome) -> Self {
        Self {
            key,
            recorded_at: Utc::now(),
            outcome,
            keywords: None,
            quality: None,
        }
    }

    pub fn success(key: RunKey, metrics: RunMetrics) -> Self {
        Self::new(key, RunOutcome::Success(metrics))
    }

    pub fn failure(key: RunKey, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::new(
            key,
            RunOutcome::Failure {
                kind,
                detail: detail.into(),
            },
        )
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    pub fn metrics(&self) -> Option<&RunMetrics> {
        match &self.outcome {
            RunOutcome::Success(m) => Some(m),
            RunOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            RunOutcome::Failure { kind, .. } => Some(*kind),
            RunOutcome::Success(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_kind().is_some()
    }

    pub fn result_text(&self) -> &str {
        self.metrics().map(|m| m.result_text.as_str()).unwrap_or("")
    }

    pub fn keywords(&self) -> Option<&KeywordCoverage> {
        self.keywords.as_ref()
    }

    pub fn quality(&self) -> Option<&QualityVerdict> {
        self.quality.as_ref()
    }

    pub fn quality_score(&self) -> Option<QualityScore> {
        self.quality.as_ref().map(|q| q.score)
    }

    pub fn has_valid_score(&self) -> bool {
        self.quality_score().map(QualityScore::is_valid).unwrap_or(false)
    }

    pub fn set_keywords(&mut self, coverage: KeywordCoverage) {
        self.keywords = Some(coverage);
    }

    pub fn set_quality(&mut self, verdict: QualityVerdict) {
        self.quality = Some(verdict);
    }
}

/// Per-run quantities the aggregator summarizes, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalInputTokens,
    InputTokens,
    CacheReadInputTokens,
    CacheCreationInputTokens,
    OutputTokens,
    TotalCostUsd,
    NumTurns,
    DurationMs,
    QualityScore,
    KeywordHits,
}

impl Metric {
    pub const ALL: [Metric; 10] = [
        Metric::TotalInputTokens,
        Metric::InputTokens,
        Metric::CacheReadInputTokens,
        Metric::CacheCreationInputTokens,
        Metric::OutputTokens,
        Metric::TotalCostUsd,
        Metric::NumTurns,
        Metric::DurationMs,
        Metric::QualityScore,
        Metric::KeywordHits,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Metric::TotalInputTokens => "total_input_tokens",
            Metric::InputTokens => "input_tokens",
            Metric::CacheReadInputTokens => "cache_read_input_tokens",
            Metric::CacheCreationInputTokens => "cache_creation_input_tokens",
            Metric::OutputTokens => "output_tokens",
            Metric::TotalCostUsd => "total_cost_usd",
            Metric::NumTurns => "num_turns",
            Metric::DurationMs => "duration_ms",
            Metric::QualityScore => "quality_score",
            Metric::KeywordHits => "keyword_hits",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::TotalInputTokens => "Total In Tokens",
            Metric::InputTokens => "  Non-cached",
            Metric::CacheReadInputTokens => "  Cache Read",
            Metric::CacheCreationInputTokens => "  Cache Create",
            Metric::OutputTokens => "Output Tokens",
            Metric::TotalCostUsd => "Cost (USD)",
            Metric::NumTurns => "Turns",
            Metric::DurationMs => "Duration (ms)",
            Metric::QualityScore => "Quality (0-10)",
            Metric::KeywordHits => "Keyword Hits",
        }
    }

    /// Decimal places used when rendering this metric.
    pub fn precision(self) -> usize {
        match self {
            Metric::TotalCostUsd => 5,
            Metric::NumTurns | Metric::QualityScore | Metric::KeywordHits => 1,
            _ => 0,
        }
    }

    /// The sample this record contributes, if any. Failed cells, unjudged
    /// records and failed judgements contribute nothing.
    pub fn sample(self, record: &RunRecord) -> Option<f64> {
        let metrics = record.metrics()?;
        let usage = &metrics.usage;
        let value = match self {
            Metric::TotalInputTokens => usage.total_input_tokens() as f64,
            Metric::InputTokens => usage.input_tokens as f64,
            Metric::CacheReadInputTokens => usage.cache_read_input_tokens as f64,
            Metric::CacheCreationInputTokens => usage.cache_creation_input_tokens as f64,
            Metric::OutputTokens => usage.output_tokens as f64,
            Metric::TotalCostUsd => metrics.total_cost_usd,
            Metric::NumTurns => metrics.num_turns as f64,
            Metric::DurationMs => metrics.duration_ms as f64,
            Metric::QualityScore => record.quality_score()?.value()?,
            Metric::KeywordHits => record.keywords()?.hits as f64,
        };
        Some(value)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
