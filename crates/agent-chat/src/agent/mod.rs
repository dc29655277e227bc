// agent-chat/crates/agent-chat/src/agent/mod.rs
//! The single-tool-per-turn agent loop and its supporting pieces.

pub mod agent_loop;
pub mod history;
pub mod textual;

pub use agent_loop::{AgentLoop, AgentRequest};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MULTIPLE_TOOLS_MAX_RETRIES: &str = "MULTIPLE_TOOLS_MAX_RETRIES";
pub const TEXTUAL_TOOL_CALL_MAX_RETRIES: &str = "TEXTUAL_TOOL_CALL_MAX_RETRIES";
pub const EMPTY_RESPONSE_MAX_RETRIES: &str = "EMPTY_RESPONSE_MAX_RETRIES";
pub const UNEXPECTED_FINISH_REASON: &str = "UNEXPECTED_FINISH_REASON";
pub const MAX_ITERATIONS_REACHED: &str = "MAX_ITERATIONS_REACHED";
pub const UNKNOWN_TOOL: &str = "UNKNOWN_TOOL";
pub const UNKNOWN_TOOL_MAX_RETRIES: &str = "UNKNOWN_TOOL_MAX_RETRIES";
pub const MODEL_UNAVAILABLE: &str = "MODEL_UNAVAILABLE";
pub const MODEL_ERROR: &str = "MODEL_ERROR";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// What to do when one model turn requests several tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiToolPolicy {
    /// Run the first call; the others are reported and dropped.
    #[default]
    First,
    /// Run none of them and ask the model to try again.
    Reject,
}

#[derive(Debug, Error)]
#[error("unknown multi-tool policy `{0}`, expected `first` or `reject`")]
pub struct ParsePolicyError(String);

impl FromStr for MultiToolPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(MultiToolPolicy::First),
            "reject" => Ok(MultiToolPolicy::Reject),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

impl fmt::Display for MultiToolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultiToolPolicy::First => write!(f, "first"),
            MultiToolPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Where the loop currently is. `Error` absorbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Processing,
    Thinking,
    ToolCalling,
    ToolExecuting,
    Generating,
    AwaitingMoreActions,
    Completed,
    Error,
}
