//! Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::LlmSettings;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ModelChunk, ModelError, ModelStream, ToolCallDelta};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<DeltaToolCall>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

pub struct LLMWorker {
    backend_url: String,
    api_key: String,
    settings: LlmSettings,
    http_client: reqwest::Client,
}

impl LLMWorker {
    pub fn new(settings: &LlmSettings) -> Self {
        info!("LLM worker initialized with backend: {}", settings.base_url);
        Self {
            backend_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            settings: settings.clone(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(settings.request_timeout_seconds))
                .build()
                .unwrap_or_default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.backend_url)
    }
}

#[async_trait]
impl ChatModel for LLMWorker {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "LLM worker starting streaming response"
        );
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            max_tokens: self.settings.max_tokens,
            frequency_penalty: self.settings.frequency_penalty,
            presence_penalty: self.settings.presence_penalty,
            tools: &request.tools,
            tool_choice: (!request.tools.is_empty()).then(|| request.tool_choice.to_json()),
        };

        let mut builder = self.http_client.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ModelError::Transport(format!("LLM backend request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("LLM backend returned {}: {}", status, body);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ModelError::Transport(message)
            } else {
                ModelError::Protocol(message)
            });
        }

        Ok(Box::pin(chunk_stream(response.bytes_stream())))
    }
}

/// Splits the response body into lines and decodes each `data:` payload.
fn chunk_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<ModelChunk, ModelError>> + Send {
    async_stream::try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures_util::pin_mut!(byte_stream);
        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result
                .map_err(|e| ModelError::Transport(format!("Stream read error: {}", e)))?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8_lossy(&line_bytes).to_string();
                match parse_line(line.trim())? {
                    LineEvent::Skip => {}
                    LineEvent::Done => return,
                    LineEvent::Chunk(chunk) => yield chunk,
                }
            }
        }
        let tail = String::from_utf8_lossy(&buffer).to_string();
        if let LineEvent::Chunk(chunk) = parse_line(tail.trim())? {
            yield chunk;
        }
    }
}

#[derive(Debug, PartialEq)]
enum LineEvent {
    Skip,
    Done,
    Chunk(ModelChunk),
}

fn parse_line(line: &str) -> Result<LineEvent, ModelError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(LineEvent::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(LineEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(LineEvent::Done);
    }

    let parsed: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ModelError::Protocol(format!("Failed to parse LLM stream chunk: {}", e)))?;

    let mut chunk = ModelChunk::default();
    for choice in parsed.choices {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                chunk.content_delta.get_or_insert_with(String::new).push_str(&content);
            }
            for call in delta.tool_calls {
                let (name, arguments_fragment) = match call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                chunk.tool_call_deltas.push(ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments_fragment,
                });
            }
        }
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            chunk.finish_reason = Some(reason);
        }
    }
    Ok(LineEvent::Chunk(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolChoice;
    use futures::TryStreamExt;

    fn create_test_settings(base_url: String) -> LlmSettings {
        LlmSettings {
            base_url,
            api_key: "sk-test".to_string(),
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: None,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            request_timeout_seconds: 5,
        }
    }

    fn create_test_request() -> ChatRequest {
        ChatRequest {
            model: "m1".to_string(),
            messages: vec![ChatMessage::user_text("hi")],
            tools: vec![serde_json::json!({"type": "function", "function": {"name": "reasoning"}})],
            tool_choice: ToolChoice::Auto,
        }
    }

    // ===== Line Parsing Tests =====

    #[test]
    fn test_parse_content_line() {
        let event = parse_line(r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#).unwrap();
        assert_eq!(event, LineEvent::Chunk(ModelChunk::text("Hel")));
    }

    #[test]
    fn test_parse_tool_call_fragment() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_a","type":"function","function":{"name":"search_web","arguments":"{\"q"}}]}}]}"#;
        let LineEvent::Chunk(chunk) = parse_line(line).unwrap() else {
            panic!("expected chunk");
        };
        assert_eq!(
            chunk.tool_call_deltas,
            vec![ToolCallDelta {
                index: 1,
                id: Some("call_a".into()),
                name: Some("search_web".into()),
                arguments_fragment: Some("{\"q".into()),
            }]
        );
    }

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(parse_line("data: [DONE]").unwrap(), LineEvent::Done);
        assert_eq!(parse_line(": keep-alive").unwrap(), LineEvent::Skip);
        assert_eq!(parse_line("").unwrap(), LineEvent::Skip);
        assert!(matches!(parse_line("data: {nope"), Err(ModelError::Protocol(_))));
    }

    // ===== HTTP Tests =====

    #[tokio::test]
    async fn test_streams_chunks_from_backend() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "m1",
                "stream": true,
                "tool_choice": "auto"
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let worker = LLMWorker::new(&create_test_settings(server.url()));
        let stream = worker.stream_chat(create_test_request()).await.unwrap();
        let chunks: Vec<ModelChunk> = stream.try_collect().await.unwrap();

        let text: String = chunks.iter().filter_map(|c| c.content_delta.clone()).collect();
        assert_eq!(text, "Hello world");
        assert_eq!(chunks.last().unwrap().finish_reason.as_deref(), Some("stop"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let worker = LLMWorker::new(&create_test_settings(server.url()));
        let err = worker.stream_chat(create_test_request()).await.err().unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_request_is_protocol() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_body("bad model")
            .create_async()
            .await;

        let worker = LLMWorker::new(&create_test_settings(server.url()));
        let err = worker.stream_chat(create_test_request()).await.err().unwrap();
        assert!(matches!(err, ModelError::Protocol(msg) if msg.contains("bad model")));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport() {
        let worker = LLMWorker::new(&create_test_settings("http://127.0.0.1:9".to_string()));
        let err = worker.stream_chat(create_test_request()).await.err().unwrap();
        assert!(err.is_retryable());
    }
}
