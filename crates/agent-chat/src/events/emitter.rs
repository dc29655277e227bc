//! Stamps and forwards chat events to the SSE response.
//!
//! One emitter exists per stream. It owns the sending half of a bounded
//! channel whose receiver is the HTTP body; every event is awaited on the
//! channel as soon as it is produced.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChatEvent, StatusKind};

pub const GUARDED_CONTENT_MESSAGE: &str = "Sharing execution progress...";
pub const CONTENT_MESSAGE: &str = "Starting response generation...";

#[derive(Debug)]
struct ContentBlock {
    guarded: bool,
    text: String,
}

pub struct EventEmitter {
    sender: mpsc::Sender<ChatEvent>,
    last_timestamp: i64,
    terminal_sent: bool,
    disconnected: bool,
    block: Option<ContentBlock>,
}

impl EventEmitter {
    pub fn new(sender: mpsc::Sender<ChatEvent>) -> Self {
        Self {
            sender,
            last_timestamp: 0,
            terminal_sent: false,
            disconnected: false,
            block: None,
        }
    }

    /// Creates an emitter together with the receiver the response reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// True once a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.terminal_sent
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    /// Stamps and sends one event. Returns whether the client received it.
    pub async fn emit(&mut self, mut event: ChatEvent) -> bool {
        if self.terminal_sent {
            debug!(event = event.event_type(), "Dropping event after terminal event");
            return false;
        }
        if event.is_terminal() {
            self.terminal_sent = true;
        }
        if self.disconnected {
            return false;
        }

        let timestamp = self.next_timestamp();
        event.set_timestamp(timestamp);
        if self.sender.send(event).await.is_err() {
            debug!("Event receiver dropped, marking stream as disconnected");
            self.disconnected = true;
            return false;
        }
        true
    }

    pub async fn status(&mut self, status: StatusKind, message: impl Into<String>) -> bool {
        self.emit(ChatEvent::Status {
            status,
            message: message.into(),
            timestamp: 0,
        })
        .await
    }

    pub async fn thinking(&mut self, message: impl Into<String>) -> bool {
        self.emit(ChatEvent::Thinking {
            message: message.into(),
            timestamp: 0,
        })
        .await
    }

    pub async fn iteration_info(&mut self, current: u32, max: u32) -> bool {
        self.emit(ChatEvent::IterationInfo {
            current_iteration: current,
            max_iterations: max,
            message: format!("Iteration {}/{}", current, max),
            timestamp: 0,
        })
        .await
    }

    pub async fn retry(&mut self, reason: &str, retry_count: u32, max_retries: u32, message: impl Into<String>) -> bool {
        self.emit(ChatEvent::Retry {
            reason: reason.to_string(),
            retry_count,
            max_retries,
            message: message.into(),
            timestamp: 0,
        })
        .await
    }

    pub async fn tool_call(&mut self, tool_call_id: &str, tool_name: &str, tool_input: Value) -> bool {
        self.emit(ChatEvent::ToolCall {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
            timestamp: 0,
        })
        .await
    }

    pub async fn tool_executing(&mut self, tool_call_id: &str, tool_name: &str) -> bool {
        self.emit(ChatEvent::ToolExecuting {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            message: format!("Executing tool {}...", tool_name),
            timestamp: 0,
        })
        .await
    }

    pub async fn tool_result(&mut self, tool_call_id: &str, tool_name: &str, tool_output: Value, success: bool) -> bool {
        self.emit(ChatEvent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_output,
            success,
            timestamp: 0,
        })
        .await
    }

    // ===== Content blocks =====

    pub fn content_open(&self) -> bool {
        self.block.is_some()
    }

    /// Opens a content block: `status{generating}` then `content_start`.
    /// An open block with a different `guarded` flag is closed first.
    pub async fn begin_content(&mut self, guarded: bool) {
        match &self.block {
            Some(block) if block.guarded == guarded => return,
            Some(_) => {
                self.finish_content().await;
            }
            None => {}
        }
        self.block = Some(ContentBlock {
            guarded,
            text: String::new(),
        });
        self.status(StatusKind::Generating, "Generating response...").await;
        let message = if guarded { GUARDED_CONTENT_MESSAGE } else { CONTENT_MESSAGE };
        self.emit(ChatEvent::ContentStart {
            message: message.to_string(),
            guarded,
            timestamp: 0,
        })
        .await;
    }

    /// Sends one delta in the current block, opening an unguarded block if
    /// none is open. Empty deltas are dropped.
    pub async fn push_delta(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.block.is_none() {
            self.begin_content(false).await;
        }
        let guarded = match self.block.as_mut() {
            Some(block) => {
                block.text.push_str(delta);
                block.guarded
            }
            None => false,
        };
        self.emit(ChatEvent::ContentDelta {
            delta: delta.to_string(),
            guarded,
            timestamp: 0,
        })
        .await;
    }

    /// Closes the open block with `content_done` and returns its text.
    pub async fn finish_content(&mut self) -> Option<String> {
        let block = self.block.take()?;
        self.emit(ChatEvent::ContentDone {
            full_content: block.text.clone(),
            guarded: block.guarded,
            timestamp: 0,
        })
        .await;
        Some(block.text)
    }

    // ===== Terminal events =====

    /// Emits a terminal `error`, closing any open content block first.
    pub async fn error(&mut self, code: &str, message: impl Into<String>, details: Option<Value>) -> bool {
        self.finish_content().await;
        self.emit(ChatEvent::Error {
            error_code: code.to_string(),
            error_message: message.into(),
            details,
            timestamp: 0,
        })
        .await
    }

    /// Emits an `error` the loop recovers from; it does not end the stream.
    pub async fn recoverable_error(&mut self, code: &str, message: impl Into<String>, mut details: Value) -> bool {
        if let Value::Object(map) = &mut details {
            map.insert("recoverable".to_string(), Value::Bool(true));
        }
        self.emit(ChatEvent::Error {
            error_code: code.to_string(),
            error_message: message.into(),
            details: Some(details),
            timestamp: 0,
        })
        .await
    }

    pub async fn done(&mut self, message_id: i64, session_id: i64, total_iterations: u32, total_time_ms: u64) -> bool {
        self.finish_content().await;
        self.emit(ChatEvent::Done {
            message_id,
            session_id,
            total_iterations,
            total_time_ms,
            timestamp: 0,
        })
        .await
    }

    /// Ends the stream with an error unless it already ended.
    pub async fn finish_with_error(&mut self, code: &str, message: impl Into<String>) {
        if !self.terminal_sent {
            self.error(code, message, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn create_test_emitter() -> (EventEmitter, mpsc::Receiver<ChatEvent>) {
        EventEmitter::channel(256)
    }

    fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ===== Timestamp Tests =====

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let (mut emitter, rx) = create_test_emitter();
        for i in 0..20 {
            emitter.thinking(format!("step {}", i)).await;
        }
        drop(emitter);

        let events = drain(rx);
        assert_eq!(events.len(), 20);
        for pair in events.windows(2) {
            assert!(pair[1].timestamp() > pair[0].timestamp());
        }
    }

    // ===== Terminal Tests =====

    #[tokio::test]
    async fn test_only_one_terminal_event() {
        let (mut emitter, rx) = create_test_emitter();
        assert!(emitter.done(1, 2, 1, 10).await);
        assert!(!emitter.error("INTERNAL_ERROR", "late", None).await);
        emitter.finish_with_error("INTERNAL_ERROR", "later").await;
        assert!(!emitter.thinking("after").await);
        drop(emitter);

        let events = drain(rx);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().event_type(), "done");
    }

    #[tokio::test]
    async fn test_recoverable_error_keeps_stream_open() {
        let (mut emitter, rx) = create_test_emitter();
        emitter
            .recoverable_error("UNKNOWN_TOOL", "no such tool", json!({"tool_name": "fly"}))
            .await;
        assert!(!emitter.is_finished());
        emitter.finish_with_error("MAX_ITERATIONS_REACHED", "stop").await;
        drop(emitter);

        let events = drain(rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ChatEvent::Error { details: Some(d), .. } if d["tool_name"] == "fly" && d["recoverable"] == true
        ));
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn test_error_closes_open_block() {
        let (mut emitter, rx) = create_test_emitter();
        emitter.push_delta("partial").await;
        emitter.error("MODEL_ERROR", "bad", None).await;
        drop(emitter);

        let events = drain(rx);
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec!["status", "content_start", "content_delta", "content_done", "error"]
        );
    }

    // ===== Disconnect Tests =====

    #[tokio::test]
    async fn test_dropped_receiver_marks_disconnected() {
        let (mut emitter, rx) = create_test_emitter();
        drop(rx);
        assert!(!emitter.thinking("anyone?").await);
        assert!(emitter.is_disconnected());
    }

    // ===== Content Block Tests =====

    #[tokio::test]
    async fn test_guard_change_starts_new_block() {
        let (mut emitter, rx) = create_test_emitter();
        emitter.begin_content(true).await;
        emitter.push_delta("working").await;
        emitter.begin_content(false).await;
        emitter.push_delta("answer").await;
        let last = emitter.finish_content().await;
        drop(emitter);

        assert_eq!(last.as_deref(), Some("answer"));
        let done: Vec<(String, bool)> = drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::ContentDone { full_content, guarded, .. } => Some((full_content, guarded)),
                _ => None,
            })
            .collect();
        assert_eq!(done, vec![("working".to_string(), true), ("answer".to_string(), false)]);
    }

    proptest! {
        #[test]
        fn prop_deltas_concatenate_to_full_content(deltas in proptest::collection::vec(".{0,12}", 0..32)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let events = runtime.block_on(async {
                let (mut emitter, rx) = create_test_emitter();
                emitter.begin_content(false).await;
                for delta in &deltas {
                    emitter.push_delta(delta).await;
                }
                emitter.finish_content().await;
                drop(emitter);
                drain(rx)
            });

            let streamed: String = events
                .iter()
                .filter_map(|e| match e {
                    ChatEvent::ContentDelta { delta, .. } => Some(delta.as_str()),
                    _ => None,
                })
                .collect();
            let full = events.iter().find_map(|e| match e {
                ChatEvent::ContentDone { full_content, .. } => Some(full_content.clone()),
                _ => None,
            });
            prop_assert_eq!(Some(streamed), full.clone());
            prop_assert_eq!(Some(deltas.concat()), full);
        }
    }
}
