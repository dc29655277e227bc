// agent-chat/crates/agent-chat/src/tools/mod.rs
//! Tools the model may call, and the registry that runs them.
//!
//! [`ToolRegistry::execute`] never fails: unknown tools, tool errors, panics
//! and timeouts all come back as a [`ToolOutcome`] with `success == false`
//! so the agent loop can hand the failure to the model as a tool result.

pub mod current_time;
pub mod reasoning;
pub mod web_search;

pub use current_time::CurrentTimeTool;
pub use reasoning::ReasoningTool;
pub use web_search::{SearchClient, SearchError, WebSearchTool};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::ChatMessage;
use crate::metrics;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Metrics label for calls to unregistered tools.
const UNKNOWN_TOOL_LABEL: &str = "unknown";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool timed out after {0} seconds")]
    Timeout(u64),
    #[error("Tool panicked: {0}")]
    Panicked(String),
}

/// What a tool sees of the conversation it runs in.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: i64,
    pub history: Arc<Vec<ChatMessage>>,
}

impl ToolContext {
    pub fn new(session_id: i64, history: Vec<ChatMessage>) -> Self {
        Self {
            session_id,
            history: Arc::new(history),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: Value,
    pub success: bool,
}

impl ToolOutcome {
    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            output: json!({ "success": false, "error": error.to_string() }),
            success: false,
        }
    }

    /// A JSON object with a boolean `success` key decides the flag.
    pub fn from_output(output: Value) -> Self {
        let success = output.get("success").and_then(Value::as_bool).unwrap_or(true);
        Self { output, success }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    fn definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

/// Strips the `functions.` prefix some models put in front of tool names.
pub fn normalize_tool_name(name: &str) -> &str {
    let name = name.trim();
    name.strip_prefix("functions.").unwrap_or(name)
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registers a tool, replacing any tool already registered under its name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => self.tools[slot] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(normalize_tool_name(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// OpenAI `tools` array in registration order.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let name = normalize_tool_name(name);
        let Some(tool) = self.index.get(name).map(|&slot| Arc::clone(&self.tools[slot])) else {
            warn!(tool = name, "Model requested an unknown tool");
            metrics::inc_tool_execution(UNKNOWN_TOOL_LABEL, false);
            return ToolOutcome::failure(ToolError::UnknownTool(name.to_string()));
        };

        let started = Instant::now();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { tool.execute(input, &task_ctx).await });

        let outcome = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(output))) => ToolOutcome::from_output(output),
            Ok(Ok(Err(err))) => ToolOutcome::failure(err),
            Ok(Err(join_err)) => ToolOutcome::failure(ToolError::Panicked(join_err.to_string())),
            Err(_) => ToolOutcome::failure(ToolError::Timeout(self.timeout.as_secs())),
        };

        debug!(
            tool = name,
            success = outcome.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool execution finished"
        );
        metrics::inc_tool_execution(name, outcome.success);
        outcome
    }
}
