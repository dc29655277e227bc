// agent-chat/crates/agent-chat/src/events/mod.rs
//! Wire format of the chat event stream.
//!
//! Every event is one JSON object with a `type` discriminator and a Unix
//! millisecond `timestamp`. A stream ends with exactly one `done` or `error`.

pub mod emitter;

pub use emitter::EventEmitter;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Processing,
    Thinking,
    ToolCalling,
    Generating,
    Completed,
    AwaitingMoreActions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Status {
        status: StatusKind,
        message: String,
        timestamp: i64,
    },
    Thinking {
        message: String,
        timestamp: i64,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        tool_input: Value,
        timestamp: i64,
    },
    ToolExecuting {
        tool_call_id: String,
        tool_name: String,
        message: String,
        timestamp: i64,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        tool_output: Value,
        success: bool,
        timestamp: i64,
    },
    ContentStart {
        message: String,
        #[serde(default)]
        guarded: bool,
        timestamp: i64,
    },
    ContentDelta {
        delta: String,
        #[serde(default)]
        guarded: bool,
        timestamp: i64,
    },
    ContentDone {
        full_content: String,
        #[serde(default)]
        guarded: bool,
        timestamp: i64,
    },
    IterationInfo {
        current_iteration: u32,
        max_iterations: u32,
        message: String,
        timestamp: i64,
    },
    Retry {
        reason: String,
        retry_count: u32,
        max_retries: u32,
        message: String,
        timestamp: i64,
    },
    Error {
        error_code: String,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: i64,
    },
    Done {
        message_id: i64,
        session_id: i64,
        total_iterations: u32,
        total_time_ms: u64,
        timestamp: i64,
    },
}

const EVENT_TYPES: [&str; 12] = [
    "status",
    "thinking",
    "tool_call",
    "tool_executing",
    "tool_result",
    "content_start",
    "content_delta",
    "content_done",
    "iteration_info",
    "retry",
    "error",
    "done",
];

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event payload is not a JSON object: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("event has no string `type` field")]
    MissingType,
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` event: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::Status { .. } => "status",
            ChatEvent::Thinking { .. } => "thinking",
            ChatEvent::ToolCall { .. } => "tool_call",
            ChatEvent::ToolExecuting { .. } => "tool_executing",
            ChatEvent::ToolResult { .. } => "tool_result",
            ChatEvent::ContentStart { .. } => "content_start",
            ChatEvent::ContentDelta { .. } => "content_delta",
            ChatEvent::ContentDone { .. } => "content_done",
            ChatEvent::IterationInfo { .. } => "iteration_info",
            ChatEvent::Retry { .. } => "retry",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Done { .. } => "done",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            ChatEvent::Status { timestamp, .. }
            | ChatEvent::Thinking { timestamp, .. }
            | ChatEvent::ToolCall { timestamp, .. }
            | ChatEvent::ToolExecuting { timestamp, .. }
            | ChatEvent::ToolResult { timestamp, .. }
            | ChatEvent::ContentStart { timestamp, .. }
            | ChatEvent::ContentDelta { timestamp, .. }
            | ChatEvent::ContentDone { timestamp, .. }
            | ChatEvent::IterationInfo { timestamp, .. }
            | ChatEvent::Retry { timestamp, .. }
            | ChatEvent::Error { timestamp, .. }
            | ChatEvent::Done { timestamp, .. } => *timestamp,
        }
    }

    pub(crate) fn set_timestamp(&mut self, value: i64) {
        match self {
            ChatEvent::Status { timestamp, .. }
            | ChatEvent::Thinking { timestamp, .. }
            | ChatEvent::ToolCall { timestamp, .. }
            | ChatEvent::ToolExecuting { timestamp, .. }
            | ChatEvent::ToolResult { timestamp, .. }
            | ChatEvent::ContentStart { timestamp, .. }
            | ChatEvent::ContentDelta { timestamp, .. }
            | ChatEvent::ContentDone { timestamp, .. }
            | ChatEvent::IterationInfo { timestamp, .. }
            | ChatEvent::Retry { timestamp, .. }
            | ChatEvent::Error { timestamp, .. }
            | ChatEvent::Done { timestamp, .. } => *timestamp = value,
        }
    }

    /// `done` and `error` close the stream, except an `error` whose details
    /// carry `"recoverable": true` (an unknown tool the model may retry).
    pub fn is_terminal(&self) -> bool {
        match self {
            ChatEvent::Done { .. } => true,
            ChatEvent::Error { details, .. } => !details
                .as_ref()
                .and_then(|d| d.get("recoverable"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"type\":\"error\",\"error_code\":\"INTERNAL_ERROR\",\"error_message\":\"event serialization failed: {}\",\"timestamp\":{}}}",
                e,
                self.timestamp()
            )
        })
    }

    /// Parses one `data:` payload, matching the discriminator explicitly so
    /// that unknown types surface as [`EventDecodeError::UnknownType`].
    pub fn decode(json: &str) -> Result<Self, EventDecodeError> {
        let value: Value = serde_json::from_str(json).map_err(EventDecodeError::NotJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingType)?
            .to_string();

        if !EVENT_TYPES.contains(&kind.as_str()) {
            return Err(EventDecodeError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|source| EventDecodeError::Malformed { kind, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_of_tool_result() {
        let event = ChatEvent::ToolResult {
            tool_call_id: "call_1".into(),
            tool_name: "search_web".into(),
            tool_output: json!({"success": false, "error": "timeout"}),
            success: false,
            timestamp: 1700000000000,
        };
        let value: Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool_result",
                "tool_call_id": "call_1",
                "tool_name": "search_web",
                "tool_output": {"success": false, "error": "timeout"},
                "success": false,
                "timestamp": 1700000000000i64
            })
        );
    }

    #[test]
    fn test_status_kind_serialization() {
        let event = ChatEvent::Status {
            status: StatusKind::AwaitingMoreActions,
            message: "more".into(),
            timestamp: 1,
        };
        let value: Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(value["status"], "awaiting_more_actions");
    }

    #[test]
    fn test_error_details_are_optional() {
        let event = ChatEvent::Error {
            error_code: "MAX_ITERATIONS_REACHED".into(),
            error_message: "stop".into(),
            details: None,
            timestamp: 5,
        };
        let value: Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert!(value.get("details").is_none());
        assert!(event.is_terminal());
    }

    // ===== Decode Tests =====

    #[test]
    fn test_decode_every_type() {
        let samples = vec![
            json!({"type": "status", "status": "processing", "message": "m", "timestamp": 1}),
            json!({"type": "thinking", "message": "m", "timestamp": 1}),
            json!({"type": "tool_call", "tool_call_id": "c", "tool_name": "t", "tool_input": {}, "timestamp": 1}),
            json!({"type": "tool_executing", "tool_call_id": "c", "tool_name": "t", "message": "m", "timestamp": 1}),
            json!({"type": "tool_result", "tool_call_id": "c", "tool_name": "t", "tool_output": {}, "success": true, "timestamp": 1}),
            json!({"type": "content_start", "message": "m", "timestamp": 1}),
            json!({"type": "content_delta", "delta": "d", "guarded": true, "timestamp": 1}),
            json!({"type": "content_done", "full_content": "d", "timestamp": 1}),
            json!({"type": "iteration_info", "current_iteration": 1, "max_iterations": 5, "message": "m", "timestamp": 1}),
            json!({"type": "retry", "reason": "empty_content", "retry_count": 1, "max_retries": 3, "message": "m", "timestamp": 1}),
            json!({"type": "error", "error_code": "E", "error_message": "m", "timestamp": 1}),
            json!({"type": "done", "message_id": 1, "session_id": 2, "total_iterations": 1, "total_time_ms": 10, "timestamp": 1}),
        ];
        assert_eq!(samples.len(), EVENT_TYPES.len());
        for sample in samples {
            let event = ChatEvent::decode(&sample.to_string()).unwrap();
            assert_eq!(event.event_type(), sample["type"].as_str().unwrap());
        }
    }

    #[test]
    fn test_decode_unknown_type_is_distinct() {
        let err = ChatEvent::decode(r#"{"type":"telemetry","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, EventDecodeError::UnknownType(kind) if kind == "telemetry"));
    }

    #[test]
    fn test_decode_missing_type() {
        let err = ChatEvent::decode(r#"{"timestamp":1}"#).unwrap_err();
        assert!(matches!(err, EventDecodeError::MissingType));
    }

    #[test]
    fn test_decode_malformed_known_type() {
        let err = ChatEvent::decode(r#"{"type":"done","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, EventDecodeError::Malformed { kind, .. } if kind == "done"));
    }

    #[test]
    fn test_recoverable_error_is_not_terminal() {
        let event = ChatEvent::Error {
            error_code: "UNKNOWN_TOOL".into(),
            error_message: "no such tool".into(),
            details: Some(json!({"tool_name": "fly", "recoverable": true})),
            timestamp: 5,
        };
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_guarded_defaults_to_false() {
        let event = ChatEvent::decode(r#"{"type":"content_delta","delta":"x","timestamp":3}"#).unwrap();
        assert_eq!(
            event,
            ChatEvent::ContentDelta { delta: "x".into(), guarded: false, timestamp: 3 }
        );
    }
}
