use serde::{Deserialize, Serialize};

/// The five iteration strategies a stage can run under. Each one trades off
/// tool availability against whether the stage is expected to produce a
/// freeform analysis or just collect data for a later stage to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationStrategy {
    /// Native function-calling, one tool call or final answer per turn.
    Regular,
    /// Free-text Thought/Action/Action Input/Final Answer loop with tools.
    React,
    /// Like React, but terminates on a literal `DONE` line instead of an
    /// analysis — used for stages that only gather data for a later stage.
    ReactTools,
    /// Like React, but the final analysis is scoped to this stage's own
    /// findings rather than the whole chain so far.
    ReactToolsPartial,
    /// No tools offered at all — the model must synthesize directly from
    /// whatever has already been collected by earlier stages.
    ReactFinalAnalysis,
}

impl IterationStrategy {
    pub fn allows_tools(self) -> bool {
        !matches!(self, IterationStrategy::ReactFinalAnalysis)
    }

    /// True for the strategy that should pass native tool schemas to the LLM
    /// request rather than relying on free-text Action parsing.
    pub fn uses_native_tool_calls(self) -> bool {
        matches!(self, IterationStrategy::Regular)
    }

    pub fn produces_analysis(self) -> bool {
        !matches!(self, IterationStrategy::ReactTools)
    }
}

impl std::fmt::Display for IterationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IterationStrategy::Regular => "REGULAR",
            IterationStrategy::React => "REACT",
            IterationStrategy::ReactTools => "REACT_TOOLS",
            IterationStrategy::ReactToolsPartial => "REACT_TOOLS_PARTIAL",
            IterationStrategy::ReactFinalAnalysis => "REACT_FINAL_ANALYSIS",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    #[serde(rename = "partial")]
    PartiallyFailed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::PartiallyFailed => "partial",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageExecStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self { prompt_tokens: prompt, completion_tokens: completion }
    }
}
