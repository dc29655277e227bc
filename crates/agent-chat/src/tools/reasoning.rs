//! The `reasoning` tool: a structured recap of the conversation so far.
//!
//! No model is called. The summary is assembled from the history snapshot
//! in [`ToolContext`], and the agent loop reads `ready_to_reply` from the
//! input to decide whether further content is final or progress.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError};
use crate::llm::ChatMessage;

pub const FOCUS_AREAS: [&str; 5] = [
    "task_planning",
    "progress_review",
    "problem_analysis",
    "task_decomposition",
    "strategy_adjustment",
];

const OUTPUT_PREVIEW_CHARS: usize = 100;

struct ToolAction {
    name: String,
    arguments: String,
    output: String,
    success: bool,
}

pub struct ReasoningTool;

impl ReasoningTool {
    fn guidance(focus: &str) -> &'static str {
        match focus {
            "progress_review" => "## Progress review\n1. What has been completed and how well did it work?\n2. How far are you from the user's goal?\n3. Have you drifted from the original request?\n4. What is the most important next action?",
            "problem_analysis" => "## Problem analysis\n1. What exactly went wrong?\n2. What is the root cause?\n3. Which approaches failed and why?\n4. Which alternative is most likely to succeed?",
            "task_decomposition" => "## Task decomposition\n1. Which independent subtasks make up this request?\n2. What does each subtask produce?\n3. In what order must they run?\n4. How will you verify each one?",
            "strategy_adjustment" => "## Strategy adjustment\n1. What strategy are you using now?\n2. Is it working, and why or why not?\n3. What should change?\n4. What is the revised plan?",
            _ => "## Planning\n1. What is the user's core objective?\n2. Which steps reach it, and in what order?\n3. What should you do first?\n4. What could go wrong and how will you handle it?",
        }
    }

    fn collect_actions(history: &[ChatMessage]) -> Vec<ToolAction> {
        let mut actions = Vec::new();
        for message in history {
            let ChatMessage::Assistant { tool_calls, .. } = message else {
                continue;
            };
            for call in tool_calls {
                let output = history.iter().find_map(|m| match m {
                    ChatMessage::Tool { tool_call_id, content } if *tool_call_id == call.id => {
                        Some(content.clone())
                    }
                    _ => None,
                });
                let success = output
                    .as_deref()
                    .and_then(|o| serde_json::from_str::<Value>(o).ok())
                    .and_then(|v| v.get("success").and_then(Value::as_bool))
                    .unwrap_or(true);
                actions.push(ToolAction {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                    output: output.unwrap_or_default(),
                    success,
                });
            }
        }
        actions
    }

    fn format_actions(actions: &[ToolAction]) -> String {
        let mut lines = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            let marker = if action.success { "[ok]" } else { "[failed]" };
            lines.push(format!("{}. {} {}", i + 1, marker, action.name));

            let params = match serde_json::from_str::<Value>(&action.arguments) {
                Ok(Value::Object(map)) => map
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => action.arguments.clone(),
            };
            lines.push(format!("   Params: {}", params));

            let mut preview: String = action.output.chars().take(OUTPUT_PREVIEW_CHARS).collect();
            if action.output.chars().count() > OUTPUT_PREVIEW_CHARS {
                preview.push_str("...");
            }
            lines.push(format!("   Result: {}", preview));
        }
        lines.join("\n")
    }

    pub(crate) fn summarize(focus: &str, question: &str, history: &[ChatMessage]) -> Value {
        let user_texts: Vec<String> = history
            .iter()
            .filter_map(|m| match m {
                ChatMessage::User { content } => Some(content.text()),
                _ => None,
            })
            .collect();
        let assistant_replies = history
            .iter()
            .filter(|m| {
                matches!(m, ChatMessage::Assistant { content: Some(text), .. } if text.trim().chars().count() > 10)
            })
            .count();
        let actions = Self::collect_actions(history);
        let successful = actions.iter().filter(|a| a.success).count();
        let failed = actions.len() - successful;

        let mut sections = Vec::new();
        let goal = user_texts
            .first()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "(Not specified clearly)".to_string());
        sections.push(format!("## Initial user goal\n{}", goal));

        if user_texts.len() > 1 {
            let start = user_texts.len().saturating_sub(2).max(1);
            let recent: Vec<String> = user_texts[start..]
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| format!("- {}", t))
                .collect();
            if !recent.is_empty() {
                sections.push(format!("## Recent clarifications\n{}", recent.join("\n")));
            }
        }

        if actions.is_empty() {
            sections.push("## Actions taken\n(No tool calls have been executed yet)".to_string());
        } else {
            sections.push(format!(
                "## Actions taken ({} total)\n{}",
                actions.len(),
                Self::format_actions(&actions)
            ));
        }

        sections.push(format!(
            "## Current status\n- Conversation turns: {}\n- Successful actions: {}\n- Failed actions: {}\n- Assistant replies: {}",
            user_texts.len(),
            successful,
            failed,
            assistant_replies
        ));
        sections.push(format!("## Question to consider\n{}\n\n{}", question, Self::guidance(focus)));

        json!({
            "success": true,
            "thinking_focus": focus,
            "specific_question": question,
            "reasoning_summary": format!("# Reasoning checkpoint\n\n{}\n", sections.join("\n\n")),
            "stats": {
                "total_tool_calls": actions.len(),
                "successful_calls": successful,
                "failed_calls": failed,
                "user_interactions": user_texts.len(),
            },
        })
    }
}

#[async_trait]
impl Tool for ReasoningTool {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn description(&self) -> &str {
        "Pause and review the conversation, completed work and current status, then plan the next step. \
Use it for complex tasks, when unsure what to do next, or when execution is stuck. \
Set ready_to_reply to true only when you have everything needed for the final answer."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thinking_focus": {
                    "type": "string",
                    "enum": FOCUS_AREAS,
                    "description": "What to think about: planning, progress review, problem analysis, decomposition or strategy adjustment."
                },
                "specific_question": {
                    "type": "string",
                    "description": "The concrete question to answer, e.g. \"Why did the previous step fail?\""
                },
                "ready_to_reply": {
                    "type": "boolean",
                    "description": "True when the next message will be the final answer."
                }
            },
            "required": ["thinking_focus", "specific_question"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let focus = input
            .get("thinking_focus")
            .and_then(Value::as_str)
            .filter(|f| FOCUS_AREAS.contains(f))
            .unwrap_or("task_planning");
        let question = input
            .get("specific_question")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut output = Self::summarize(focus, question, &ctx.history);
        if let (Some(ready), Value::Object(map)) = (input.get("ready_to_reply").and_then(Value::as_bool), &mut output) {
            map.insert("ready_to_reply".to_string(), Value::Bool(ready));
        }
        Ok(output)
    }
}
