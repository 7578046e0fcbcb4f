use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{validate_key_component, Metric};
use crate::store::ResultStore;

pub const DEFAULT_CONFIG_PATH: &str = "bench/bench.yaml";

/// Appended to the agent's system prompt so answers are comparable across
/// trials.
pub const DEFAULT_APPEND_PROMPT: &str = "Answer the question directly and concisely. \
Do not ask follow-up questions. \
Do not offer to do additional work.";

/// A named tool-access configuration the agent is invoked under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub config_ref: PathBuf,
}

impl Condition {
    pub fn new(name: impl Into<String>, config_ref: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            config_ref: config_ref.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Program and leading arguments; invocation flags are appended.
    pub command: Vec<String>,
    pub model: String,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC".to_string(),
            "1".to_string(),
        );
        Self {
            command: vec!["claude".to_string()],
            model: "sonnet".to_string(),
            env,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub timeout_secs: u64,
    pub pause_secs: f64,
    pub default_max_turns: u32,
    pub append_system_prompt: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            pause_secs: 3.0,
            default_max_turns: 15,
            append_system_prompt: DEFAULT_APPEND_PROMPT.to_string(),
        }
    }
}

impl RunSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSettings {
    pub timeout_secs: u64,
    pub pause_secs: f64,
    /// Condition whose tool configuration the grader runs under. Defaults to
    /// the first configured condition.
    pub condition: Option<String>,
    pub model: Option<String>,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            pause_secs: 2.0,
            condition: None,
            model: None,
        }
    }
}

impl JudgeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub metrics: Vec<Metric>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            metrics: Metric::ALL.to_vec(),
        }
    }
}

/// Process-wide settings, built once at startup and handed to each phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub tasks_file: PathBuf,
    pub results_dir: PathBuf,
    pub working_dir: PathBuf,
    pub agent: AgentSettings,
    pub conditions: Vec<Condition>,
    pub run: RunSettings,
    pub judge: JudgeSettings,
    pub analysis: AnalysisSettings,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            tasks_file: PathBuf::from("tasks/tasks.json"),
            results_dir: PathBuf::from("results"),
            working_dir: PathBuf::from("."),
            agent: AgentSettings::default(),
            conditions: vec![
                Condition::new("baseline", "config/mcp-baseline.json"),
                Condition::new("with-tool", "config/mcp-with-tool.json"),
            ],
            run: RunSettings::default(),
            judge: JudgeSettings::default(),
            analysis: AnalysisSettings::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: BenchConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.rebase(&base);
        config.validate()?;
        Ok(config)
    }

    /// Falls back to built-in defaults rooted at the current directory when
    /// `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.rebase(Path::new("."));
            Ok(config)
        }
    }

    fn rebase(&mut self, base: &Path) {
        self.base_dir = base.to_path_buf();
        self.tasks_file = resolve(base, &self.tasks_file);
        self.results_dir = resolve(base, &self.results_dir);
        self.working_dir = resolve(base, &self.working_dir);
        for condition in self.conditions.iter_mut() {
            condition.config_ref = resolve(base, &condition.config_ref);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.conditions.is_empty() {
            return Err(anyhow!("config must define at least one condition"));
        }
        for (i, c) in self.conditions.iter().enumerate() {
            validate_key_component("condition", &c.name)?;
            if self.conditions[..i].iter().any(|o| o.name == c.name) {
                return Err(anyhow!("duplicate condition name: {}", c.name));
            }
        }
        if self.agent.command.is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if let Some(name) = self.judge.condition.as_deref() {
            if self.condition(name).is_none() {
                return Err(anyhow!("judge.condition references unknown condition: {}", name));
            }
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn condition_names(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolves a condition filter, keeping the requested order. An empty or
    /// absent filter selects every configured condition.
    pub fn select_conditions(&self, names: Option<&[String]>) -> Result<Vec<Condition>> {
        match names {
            Some(names) if !names.is_empty() => names
                .iter()
                .map(|n| {
                    self.condition(n).cloned().ok_or_else(|| {
                        anyhow!(
                            "unknown condition '{}' (choose from: {})",
                            n,
                            self.condition_names().join(", ")
                        )
                    })
                })
                .collect(),
            _ => Ok(self.conditions.clone()),
        }
    }

    pub fn judge_condition(&self) -> Result<&Condition> {
        match self.judge.condition.as_deref() {
            Some(name) => self
                .condition(name)
                .ok_or_else(|| anyhow!("unknown judge condition: {}", name)),
            None => self
                .conditions
                .first()
                .ok_or_else(|| anyhow!("no conditions configured")),
        }
    }

    pub fn judge_model(&self) -> &str {
        self.judge.model.as_deref().unwrap_or(&self.agent.model)
    }

    pub fn store(&self) -> ResultStore {
        ResultStore::new(&self.results_dir)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
