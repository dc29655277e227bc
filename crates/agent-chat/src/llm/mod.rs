// agent-chat/crates/agent-chat/src/llm/mod.rs
//! Chat model abstraction and the OpenAI-compatible message model.

pub mod llm_worker;

pub use llm_worker::LLMWorker;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: MessageContent,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user_text(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            ChatMessage::System { .. } => "system",
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Tool { .. } => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text parts joined by newlines; image parts are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_tool_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    /// Forces a call to the named function.
    Function(String),
}

impl ToolChoice {
    pub fn to_json(&self) -> Value {
        match self {
            ToolChoice::Auto => Value::String("auto".to_string()),
            ToolChoice::Function(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name },
            }),
        }
    }
}

/// One model invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// OpenAI `tools` definitions; empty means no tools are offered.
    pub tools: Vec<Value>,
    pub tool_choice: ToolChoice,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelChunk {
    pub content_delta: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl ModelChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            content_delta: Some(delta.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    /// Connection failure, timeout, HTTP 429 or 5xx. Worth retrying.
    #[error("model transport error: {0}")]
    Transport(String),
    /// Rejected request or unparsable response.
    #[error("model protocol error: {0}")]
    Protocol(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Transport(_))
    }
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shapes() {
        let user = ChatMessage::User {
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "look".into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/jpeg;base64,AA==".into(),
                        detail: Some("auto".into()),
                    },
                },
            ]),
        };
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AA==", "detail": "auto"}}
                ]
            })
        );

        let call = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall::function("call_1", "search_web", "{}")],
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({
                "role": "assistant",
                "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "search_web", "arguments": "{}"}}]
            })
        );

        let tool = ChatMessage::Tool { tool_call_id: "call_1".into(), content: "{}".into() };
        assert_eq!(serde_json::to_value(&tool).unwrap()["role"], "tool");
    }

    #[test]
    fn test_user_content_accepts_plain_string() {
        let parsed: MessageContent = serde_json::from_value(json!("hi")).unwrap();
        assert_eq!(parsed, MessageContent::Text("hi".into()));
        assert_eq!(parsed.text(), "hi");
    }

    #[test]
    fn test_tool_choice_json() {
        assert_eq!(ToolChoice::Auto.to_json(), json!("auto"));
        assert_eq!(
            ToolChoice::Function("reasoning".into()).to_json(),
            json!({"type": "function", "function": {"name": "reasoning"}})
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::Transport("timeout".into()).is_retryable());
        assert!(!ModelError::Protocol("400".into()).is_retryable());
    }
}
