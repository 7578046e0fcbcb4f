//! Scripted stand-in for the external agent (testing only).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::agent::{AgentInvoker, AgentRequest, InvokeError, ProcessOutput};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(ProcessOutput),
    Timeout,
    SpawnFailure(String),
}

impl Scripted {
    /// Exit 0 with `stdout` as the structured envelope.
    pub fn envelope(stdout: impl Into<String>) -> Self {
        Scripted::Output(ProcessOutput {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            elapsed: Duration::from_millis(5),
        })
    }

    pub fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Scripted::Output(ProcessOutput {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed: Duration::from_millis(5),
        })
    }
}

/// Replays scripted replies in order and records every request it receives.
/// Once the script runs dry every further call times out.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(replies: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl AgentInvoker for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<ProcessOutput, InvokeError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::SpawnFailure(msg)) => Err(InvokeError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                msg,
            ))),
            Some(Scripted::Timeout) | None => Err(InvokeError::Timeout(request.timeout)),
        }
    }
}
