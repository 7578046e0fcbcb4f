//! The external agent boundary.
//!
//! Both phases talk to the agent only through [`AgentInvoker`], so batches can
//! be driven by a real subprocess ([`ProcessAgent`]) or by scripted replies in
//! tests (see [`crate::fakes`]).

use anyhow::{anyhow, Result};
use bench_core::{truncate_chars, BenchConfig, RunMetrics, TokenUsage};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything one agent call needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub tool_config: PathBuf,
    pub append_system_prompt: Option<String>,
    /// Let the agent use its tools without interactive approval.
    pub skip_permissions: bool,
    pub timeout: Duration,
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn exited_ok(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Non-zero exit with nothing on stdout. Non-zero exit *with* output is
    /// still parsed as a possible partial success.
    pub fn is_hard_failure(&self) -> bool {
        !self.exited_ok() && self.stdout.trim().is_empty()
    }

    pub fn exit_label(&self) -> String {
        self.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One blocking call to the external agent, bounded by `request.timeout`.
pub trait AgentInvoker {
    fn invoke(&self, request: &AgentRequest) -> Result<ProcessOutput, InvokeError>;

    /// Human-readable form of the call, used for dry runs.
    fn describe(&self, request: &AgentRequest) -> String {
        format!(
            "agent --model {} --max-turns {} --mcp-config {}",
            request.model,
            request.max_turns,
            config_file_name(request)
        )
    }
}

fn config_file_name(request: &AgentRequest) -> String {
    request
        .tool_config
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| request.tool_config.display().to_string())
}

/// Spawns the agent CLI once per call.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: PathBuf,
}

impl ProcessAgent {
    pub fn new(command: Vec<String>, working_dir: PathBuf) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self {
            command,
            env: BTreeMap::new(),
            working_dir,
        })
    }

    pub fn from_config(config: &BenchConfig) -> Result<Self> {
        let mut agent = Self::new(config.agent.command.clone(), config.working_dir.clone())?;
        agent.env = config.agent.env.clone();
        Ok(agent)
    }

    /// Flags appended after the configured command.
    pub fn args(request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
            "--strict-mcp-config".to_string(),
            "--mcp-config".to_string(),
            request.tool_config.to_string_lossy().to_string(),
            "--no-session-persistence".to_string(),
        ];
        if request.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.extend([
            "--max-turns".to_string(),
            request.max_turns.to_string(),
            "--model".to_string(),
            request.model.clone(),
        ]);
        if let Some(append) = &request.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(append.clone());
        }
        args
    }

    fn spawn(&self, request: &AgentRequest) -> Result<Child, InvokeError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.args(Self::args(request));
        cmd.current_dir(&self.working_dir);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        debug!(program = %self.command[0], model = %request.model, "spawning agent");
        cmd.spawn().map_err(InvokeError::Spawn)
    }
}

impl AgentInvoker for ProcessAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<ProcessOutput, InvokeError> {
        let start = Instant::now();
        let deadline = start + request.timeout;
        let mut child = self.spawn(request)?;
        let (tx, rx) = mpsc::channel();
        let mut pending = drain(child.stdout.take(), Stream::Stdout, &tx)
            + drain(child.stderr.take(), Stream::Stderr, &tx);
        drop(tx);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                terminate(&mut child);
                return Err(InvokeError::Timeout(request.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // A descendant that inherited the pipes keeps them open after the
        // direct child exits; the deadline bounds that wait too.
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((Stream::Stdout, bytes)) => stdout = bytes,
                Ok((Stream::Stderr, bytes)) => stderr = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    terminate(&mut child);
                    return Err(InvokeError::Timeout(request.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            pending -= 1;
        }

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            elapsed: start.elapsed(),
        })
    }

    fn describe(&self, request: &AgentRequest) -> String {
        let mut parts = self.command.clone();
        parts.extend(["-p".to_string(), "<prompt>".to_string()]);
        parts.extend(Self::args(request).into_iter().skip(2).map(|a| {
            if a == request.tool_config.to_string_lossy() {
                config_file_name(request)
            } else if Some(&a) == request.append_system_prompt.as_ref() {
                "<append-prompt>".to_string()
            } else {
                a
            }
        }));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Reads `pipe` to EOF on its own thread and sends the bytes over `tx`.
/// Returns how many readers were started.
fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    stream: Stream,
    tx: &Sender<(Stream, Vec<u8>)>,
) -> usize {
    let Some(mut reader) = pipe else {
        return 0;
    };
    let tx = tx.clone();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
    1
}

/// Kills the child's whole process group, then the child itself.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // The child leads its own group; ESRCH means everything is gone.
        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            if err != nix::errno::Errno::ESRCH {
                debug!(pid = child.id(), "failed to signal process group: {}", err);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// The single JSON document the agent prints in structured output mode.
/// Absent and `null` fields read as zero or empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentEnvelope {
    result: Option<String>,
    usage: Option<EnvelopeUsage>,
    num_turns: Option<u64>,
    duration_ms: Option<u64>,
    duration_api_ms: Option<u64>,
    total_cost_usd: Option<f64>,
    session_id: Option<String>,
    is_error: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EnvelopeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

impl AgentEnvelope {
    pub fn parse(stdout: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(stdout.trim())?;
        if !value.is_object() {
            return Err(anyhow!("agent output is not a JSON object"));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn result_text(&self) -> &str {
        self.result.as_deref().unwrap_or("")
    }

    pub fn cost_usd(&self) -> f64 {
        self.total_cost_usd.unwrap_or(0.0)
    }

    pub fn usage(&self) -> TokenUsage {
        let usage = self.usage.clone().unwrap_or_default();
        TokenUsage {
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
            cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        }
    }

    pub fn into_metrics(self, model: &str, wall_time: Duration) -> RunMetrics {
        let usage = self.usage();
        RunMetrics {
            model: model.to_string(),
            num_turns: self.num_turns.unwrap_or(0),
            duration_ms: self.duration_ms.unwrap_or(0),
            duration_api_ms: self.duration_api_ms.unwrap_or(0),
            total_cost_usd: self.cost_usd(),
            usage,
            result_text: self.result.unwrap_or_default(),
            session_id: self.session_id.unwrap_or_default(),
            is_error: self.is_error.unwrap_or(false),
            wall_time_s: (wall_time.as_secs_f64() * 100.0).round() / 100.0,
        }
    }
}

/// Short diagnostic for a hard process failure.
pub fn failure_detail(output: &ProcessOutput, max_chars: usize) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("agent exited with status {} and no output", output.exit_label())
    } else {
        truncate_chars(stderr, max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout: Duration) -> AgentRequest {
        AgentRequest {
            prompt: "Explain the retry queue".to_string(),
            model: "sonnet".to_string(),
            max_turns: 15,
            tool_config: PathBuf::from("/bench/config/mcp-baseline.json"),
            append_system_prompt: Some("Answer directly.".to_string()),
            skip_permissions: true,
            timeout,
        }
    }

    #[test]
    fn args_carry_model_turns_config_and_prompt_suffix() {
        let args = ProcessAgent::args(&request(Duration::from_secs(600)));
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "Explain the retry queue");
        let pos = |flag: &str| args.iter().position(|a| a == flag).expect(flag);
        assert_eq!(args[pos("--output-format") + 1], "json");
        assert_eq!(args[pos("--mcp-config") + 1], "/bench/config/mcp-baseline.json");
        assert_eq!(args[pos("--max-turns") + 1], "15");
        assert_eq!(args[pos("--model") + 1], "sonnet");
        assert_eq!(args[pos("--append-system-prompt") + 1], "Answer directly.");
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"--no-session-persistence".to_string()));
    }

    #[test]
    fn grader_style_request_omits_optional_flags() {
        let mut req = request(Duration::from_secs(120));
        req.append_system_prompt = None;
        req.skip_permissions = false;
        req.max_turns = 1;
        let args = ProcessAgent::args(&req);
        assert!(!args.contains(&"--append-system-prompt".to_string()));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn describe_elides_prompt_and_shortens_config() {
        let agent =
            ProcessAgent::new(vec!["claude".to_string()], PathBuf::from(".")).expect("agent");
        let line = agent.describe(&request(Duration::from_secs(600)));
        assert!(line.starts_with("claude -p <prompt> --output-format json"));
        assert!(line.contains("--mcp-config mcp-baseline.json"));
        assert!(!line.contains("retry queue"));
        assert!(line.contains("<append-prompt>"));
    }

    #[test]
    fn envelope_defaults_missing_and_null_fields_to_zero() {
        let env = AgentEnvelope::parse(
            r#"{"result": "done", "num_turns": null, "usage": {"input_tokens": 12}}"#,
        )
        .expect("parse");
        let metrics = env.into_metrics("sonnet", Duration::from_millis(1234));
        assert_eq!(metrics.result_text, "done");
        assert_eq!(metrics.num_turns, 0);
        assert_eq!(metrics.usage.input_tokens, 12);
        assert_eq!(metrics.usage.output_tokens, 0);
        assert_eq!(metrics.total_cost_usd, 0.0);
        assert_eq!(metrics.session_id, "");
        assert!(!metrics.is_error);
        assert_eq!(metrics.wall_time_s, 1.23);
    }

    #[test]
    fn envelope_rejects_non_objects_and_garbage() {
        assert!(AgentEnvelope::parse("[1, 2]").is_err());
        assert!(AgentEnvelope::parse("Error: rate limited").is_err());
        assert!(AgentEnvelope::parse("").is_err());
    }

    #[test]
    fn hard_failure_requires_nonzero_exit_and_empty_stdout() {
        let mut out = ProcessOutput {
            exit_code: Some(1),
            stdout: "  \n".to_string(),
            stderr: "boom".to_string(),
            elapsed: Duration::ZERO,
        };
        assert!(out.is_hard_failure());
        assert_eq!(failure_detail(&out, 200), "boom");
        out.stdout = "{}".to_string();
        assert!(!out.is_hard_failure());
        out.exit_code = Some(0);
        out.stdout.clear();
        assert!(!out.is_hard_failure());
    }

    #[cfg(unix)]
    fn write_script(tag: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!(
            "bench_agent_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn process_agent_captures_stdout_and_exit_code() {
        let script = write_script(
            "ok",
            r#"echo '{"result":"hi","num_turns":2,"total_cost_usd":0.01}'
echo 'note' >&2
exit 3"#,
        );
        let agent = ProcessAgent::new(
            vec![script.to_string_lossy().to_string()],
            std::env::temp_dir(),
        )
        .expect("agent");
        let out = agent
            .invoke(&request(Duration::from_secs(10)))
            .expect("invoke");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.is_hard_failure());
        assert_eq!(out.stderr.trim(), "note");
        let env = AgentEnvelope::parse(&out.stdout).expect("envelope");
        assert_eq!(env.result_text(), "hi");
        let _ = std::fs::remove_dir_all(script.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn process_agent_kills_at_deadline() {
        let script = write_script("slow", "exec sleep 5");
        let agent = ProcessAgent::new(
            vec![script.to_string_lossy().to_string()],
            std::env::temp_dir(),
        )
        .expect("agent");
        let start = Instant::now();
        let err = agent
            .invoke(&request(Duration::from_millis(200)))
            .expect_err("must time out");
        assert!(matches!(err, InvokeError::Timeout(_)), "unexpected: {}", err);
        assert!(start.elapsed() < Duration::from_secs(4));
        let _ = std::fs::remove_dir_all(script.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn background_descendant_cannot_outlive_the_deadline() {
        let script = write_script(
            "orphan",
            "sleep 6 &\necho '{\"result\":\"x\"}'\nexit 0",
        );
        let agent = ProcessAgent::new(
            vec![script.to_string_lossy().to_string()],
            std::env::temp_dir(),
        )
        .expect("agent");
        let start = Instant::now();
        let err = agent
            .invoke(&request(Duration::from_secs(1)))
            .expect_err("pipes held open past the deadline");
        assert!(matches!(err, InvokeError::Timeout(_)), "unexpected: {}", err);
        assert!(start.elapsed() < Duration::from_secs(4));
        let _ = std::fs::remove_dir_all(script.parent().expect("parent"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let agent = ProcessAgent::new(
            vec!["/definitely/not/an/agent".to_string()],
            std::env::temp_dir(),
        )
        .expect("agent");
        let err = agent
            .invoke(&request(Duration::from_secs(1)))
            .expect_err("spawn must fail");
        assert!(matches!(err, InvokeError::Spawn(_)));
    }
}
