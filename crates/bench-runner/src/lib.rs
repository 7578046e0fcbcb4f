//! Run orchestration and quality judging against an external coding agent.

pub mod agent;
pub mod fakes;
pub mod judge;
pub mod orchestrator;
pub mod pacing;
pub mod progress;

pub use agent::{
    AgentEnvelope, AgentInvoker, AgentRequest, InvokeError, ProcessAgent, ProcessOutput,
};
pub use judge::{
    build_judge_prompt, grade, judge_results, parse_score, JudgeOptions, JudgeSummary, ParsedScore,
};
pub use orchestrator::{
    build_request, execute_cell, plan_cells, run_batch, BatchSummary, Cell, RunOptions,
};
pub use pacing::Pacer;
pub use progress::Progress;
