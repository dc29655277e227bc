//! Detection of tool calls the model wrote as plain text instead of using
//! the structured tool-call channel.
//!
//! Streamed text is split into lines. A line that parses as a JSON tool
//! call is withheld from the client; everything else passes through.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::llm::ToolCall;

lazy_static! {
    static ref JSON_LEAD: Regex = Regex::new(r#"^\s*["'(]?\s*[\[{]"#).unwrap();
}

const NAME_KEYS: [&str; 3] = ["name", "tool_name", "function"];
const ARGUMENT_KEYS: [&str; 5] = ["arguments", "args", "input", "parameters", "payload"];

/// Argument key sets that identify a tool when no name is given.
const ARGUMENT_HINTS: [(&str, &[&str]); 3] = [
    ("reasoning", &["thinking_focus", "specific_question"]),
    ("search_web", &["query"]),
    ("get_current_time", &["timezone"]),
];

/// Buffers streamed text and separates visible segments from textual
/// tool calls.
#[derive(Debug, Default)]
pub struct TextualToolFilter {
    pending: String,
    detected: Vec<ToolCall>,
    /// Text already released on the current line. Only whole lines can be
    /// tool calls, so the rest of such a line passes through untouched.
    mid_line: bool,
}

impl TextualToolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one delta and returns the segments that are safe to show.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);
        self.drain(false)
    }

    /// Releases whatever is still buffered at the end of a turn.
    pub fn finish(&mut self) -> Vec<String> {
        self.drain(true)
    }

    pub fn detected(&self) -> &[ToolCall] {
        &self.detected
    }

    pub fn take_detected(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.detected)
    }

    fn drain(&mut self, final_flush: bool) -> Vec<String> {
        let mut segments = Vec::new();
        while !self.pending.is_empty() {
            let at_line_start = !self.mid_line;
            let segment = if let Some(pos) = self.pending.find('\n') {
                self.pending.drain(..=pos).collect::<String>()
            } else if final_flush || self.mid_line || !JSON_LEAD.is_match(&self.pending) {
                std::mem::take(&mut self.pending)
            } else {
                // Possible JSON line still arriving.
                break;
            };
            self.mid_line = !segment.ends_with('\n');

            let calls = if at_line_start {
                parse_textual_tool_calls(&segment)
            } else {
                Vec::new()
            };
            if calls.is_empty() {
                segments.push(segment);
            } else {
                self.detected.extend(calls);
            }
        }
        segments
    }
}

/// Parses `text` as one or more JSON tool-call objects. Returns an empty
/// list when the text is not a tool call.
pub fn parse_textual_tool_calls(text: &str) -> Vec<ToolCall> {
    let trimmed = text.trim();
    if trimmed.is_empty() || !JSON_LEAD.is_match(trimmed) {
        return Vec::new();
    }

    let objects: Vec<Value> = match try_parse(trimmed) {
        Some(Value::Array(items)) => items,
        Some(value) => vec![value],
        None => trimmed
            .lines()
            .filter_map(|line| try_parse(line.trim().trim_end_matches(',')))
            .collect(),
    };

    objects
        .into_iter()
        .filter_map(|value| match value {
            Value::Object(map) => normalize(map),
            _ => None,
        })
        .collect()
}

fn try_parse(segment: &str) -> Option<Value> {
    let mut candidate = segment.trim().trim_end_matches(',').trim();
    if candidate.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    for (open, close) in [("\"", "\""), ("'", "'"), ("(", ")")] {
        if candidate.len() >= 2 && candidate.starts_with(open) && candidate.ends_with(close) {
            candidate = candidate[open.len()..candidate.len() - close.len()].trim();
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
    }
    None
}

fn normalize(map: Map<String, Value>) -> Option<ToolCall> {
    let mut name = NAME_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    let arguments = ARGUMENT_KEYS
        .iter()
        .find_map(|key| map.get(*key).cloned())
        .unwrap_or_else(|| {
            let rest: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "id" | "type" | "name" | "tool_name" | "function"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(rest)
        });

    if name.is_none() {
        if let Value::Object(args) = &arguments {
            name = ARGUMENT_HINTS
                .iter()
                .find(|(_, keys)| !keys.is_empty() && keys.iter().all(|k| args.contains_key(*k)))
                .map(|(tool, _)| tool.to_string());
        }
    }
    let name = name?;

    let arguments = match arguments {
        Value::String(raw) => raw,
        other => other.to_string(),
    };
    let id = map.get("id").and_then(Value::as_str).unwrap_or_default();
    Some(ToolCall::function(id, name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Parser Tests =====

    #[test]
    fn test_named_call_is_detected() {
        let calls = parse_textual_tool_calls(r#"{"name": "search_web", "arguments": {"query": "rust"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search_web");
        assert_eq!(calls[0].function.arguments, r#"{"query":"rust"}"#);
    }

    #[test]
    fn test_bare_arguments_infer_tool() {
        let calls = parse_textual_tool_calls(r#"{"thinking_focus": "task_planning", "specific_question": "next?"}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "reasoning");
    }

    #[test]
    fn test_plain_text_and_unrelated_json_pass() {
        assert!(parse_textual_tool_calls("The answer is 42.").is_empty());
        assert!(parse_textual_tool_calls(r#"{"temperature": 21}"#).is_empty());
        assert!(parse_textual_tool_calls("[1, 2, 3]").is_empty());
    }

    // ===== Filter Tests =====

    #[test]
    fn test_filter_withholds_tool_lines() {
        let mut filter = TextualToolFilter::new();
        let mut shown = Vec::new();
        for delta in ["Let me check.\n{\"name\": \"get_cur", "rent_time\", \"arguments\": {}}\n", "Done"] {
            shown.extend(filter.push(delta));
        }
        shown.extend(filter.finish());

        assert_eq!(shown.concat(), "Let me check.\nDone");
        assert_eq!(filter.detected().len(), 1);
        assert_eq!(filter.detected()[0].function.name, "get_current_time");
    }

    #[test]
    fn test_filter_streams_plain_text_without_newlines() {
        let mut filter = TextualToolFilter::new();
        assert_eq!(filter.push("Hel"), vec!["Hel".to_string()]);
        assert_eq!(filter.push("lo"), vec!["lo".to_string()]);
        assert!(filter.finish().is_empty());
    }

    #[test]
    fn test_incomplete_json_released_at_finish() {
        let mut filter = TextualToolFilter::new();
        assert!(filter.push("{not really json").is_empty());
        assert_eq!(filter.finish(), vec!["{not really json".to_string()]);
        assert!(filter.take_detected().is_empty());
    }

    #[test]
    fn test_json_after_mid_line_text_is_shown() {
        let mut filter = TextualToolFilter::new();
        assert_eq!(filter.push("Config: "), vec!["Config: ".to_string()]);
        assert_eq!(
            filter.push(r#"{"query": "rust"}"#),
            vec![r#"{"query": "rust"}"#.to_string()]
        );
        assert_eq!(filter.push(" done\n"), vec![" done\n".to_string()]);
        assert!(filter.finish().is_empty());
        assert!(filter.detected().is_empty());
    }

    #[test]
    fn test_json_on_fresh_line_still_withheld() {
        let mut filter = TextualToolFilter::new();
        let mut shown = filter.push("Checking now.\n");
        shown.extend(filter.push(r#"{"query": "rust"}"#));
        shown.extend(filter.finish());

        assert_eq!(shown.concat(), "Checking now.\n");
        assert_eq!(filter.detected()[0].function.name, "search_web");
    }
}
