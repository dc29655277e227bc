// agent-chat/crates/agent-chat/src/agent/agent_loop.rs
//! One chat turn: model calls, single tool execution per model turn, and
//! persistence of the result, narrated through an [`EventEmitter`].

use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::history::{self, AssistantFinal};
use super::textual::TextualToolFilter;
use super::*;
use crate::chat_db::{ChatDatabase, ToolExchange};
use crate::config::{AgentSettings, ModelInfo};
use crate::events::{EventEmitter, StatusKind};
use crate::llm::{ChatMessage, ChatModel, ChatRequest, MessageContent, ModelError, ModelStream, ToolCall, ToolChoice};
use crate::metrics;
use crate::tools::{normalize_tool_name, ToolContext, ToolRegistry};

const READY_TO_REPLY_REMINDER: &str = "Your most recent reasoning call set `ready_to_reply` to false, so you do not \
yet have enough information for a final answer. Keep executing your plan with tools instead of replying. When you \
believe a final answer is possible, call the reasoning tool again with `ready_to_reply` set to true.";

const TEXTUAL_TOOL_CALL_REMINDER: &str = "You wrote a tool call as plain text instead of using the structured \
tool-call channel. Regenerate the response using a proper tool call and do not print JSON. Only one tool call is \
allowed per turn.";

const EMPTY_CONTENT_REMINDER: &str = "Your previous response contained no usable text. Provide a natural-language \
answer or call an appropriate tool.";

const EMPTY_FINISH_REMINDER: &str = "Your previous response contained no text and no tool call. Call an appropriate \
tool or produce a natural-language answer.";

/// Input of one streamed chat turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub user_id: i64,
    pub session_id: i64,
    pub message: String,
    pub file_ids: Vec<i64>,
    pub model: ModelInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    textual_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    error: Option<ModelError>,
    /// The client went away before the turn was fully delivered.
    aborted: bool,
}

struct RunState {
    history: Vec<ChatMessage>,
    iteration: u32,
    retry_count: u32,
    transport_retries: u32,
    guarded: bool,
    force_reasoning: bool,
    self_check_inserted: bool,
    progress: Vec<String>,
    state: AgentState,
    started: Instant,
}

impl RunState {
    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, iteration = self.iteration, "Agent state transition");
            self.state = next;
        }
    }

    fn push_reminder(&mut self, text: &str) {
        let already_last = matches!(
            self.history.last(),
            Some(ChatMessage::System { content }) if content == text
        );
        if !already_last {
            self.history.push(ChatMessage::system(text));
        }
    }
}

pub struct AgentLoop {
    database: Arc<ChatDatabase>,
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    settings: AgentSettings,
    backoff_base: Duration,
}

impl AgentLoop {
    pub fn new(
        database: Arc<ChatDatabase>,
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            database,
            model,
            tools,
            settings,
            backoff_base: Duration::from_millis(500),
        }
    }

    /// Base delay of the exponential transport backoff.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Runs the turn to completion. Every path that reaches a verdict emits
    /// exactly one terminal event; an `Err` means storage failed and the
    /// caller owns the terminal `INTERNAL_ERROR`.
    pub async fn run(&self, request: AgentRequest, emitter: &mut EventEmitter) -> anyhow::Result<()> {
        let mut run = RunState {
            history: Vec::new(),
            iteration: 0,
            retry_count: 0,
            transport_retries: 0,
            guarded: false,
            force_reasoning: false,
            self_check_inserted: false,
            progress: Vec::new(),
            state: AgentState::Processing,
            started: Instant::now(),
        };
        emitter.status(StatusKind::Processing, "Processing your request...").await;

        let stored = self.database.messages.list_messages(request.session_id)?;
        run.history.push(ChatMessage::system(self.settings.system_prompt.clone()));
        run.history
            .extend(history::to_chat_messages(&stored, request.model.supports_vision));

        let parts = history::build_user_content(
            &self.database,
            request.user_id,
            &request.message,
            &request.file_ids,
            request.model.supports_vision,
        )?;
        let content = MessageContent::Parts(parts);
        self.database
            .messages
            .append_user_message(request.session_id, &serde_json::to_string(&content)?)?;
        run.history.push(ChatMessage::User { content });

        info!(
            session_id = request.session_id,
            model = %request.model.id,
            history_len = run.history.len(),
            "Agent loop started"
        );

        let result = self.iterate(&request, &mut run, emitter).await;
        metrics::observe_iterations(run.iteration);
        info!(
            session_id = request.session_id,
            iterations = run.iteration,
            state = ?run.state,
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "Agent loop finished"
        );
        result
    }

    async fn iterate(&self, request: &AgentRequest, run: &mut RunState, emitter: &mut EventEmitter) -> anyhow::Result<()> {
        let max_iterations = self.settings.max_iterations;

        while run.iteration < max_iterations {
            if emitter.is_disconnected() {
                info!(session_id = request.session_id, "Client disconnected, stopping before next model call");
                return Ok(());
            }

            run.iteration += 1;
            emitter.iteration_info(run.iteration, max_iterations).await;
            emitter.thinking("Thinking about how to respond...").await;
            run.transition(AgentState::Thinking);
            emitter.status(StatusKind::Thinking, "Analyzing the conversation...").await;

            let tool_choice = if run.force_reasoning && self.tools.contains("reasoning") {
                ToolChoice::Function("reasoning".to_string())
            } else {
                ToolChoice::Auto
            };
            let chat_request = ChatRequest {
                model: request.model.id.clone(),
                messages: run.history.clone(),
                tools: self.tools.definitions(),
                tool_choice,
            };

            let turn = match self.model.stream_chat(chat_request).await {
                Ok(stream) => self.consume_turn(stream, run, emitter).await,
                Err(err) => TurnOutput {
                    error: Some(err),
                    ..Default::default()
                },
            };

            if turn.aborted {
                info!(session_id = request.session_id, "Client disconnected mid-turn, discarding partial response");
                return Ok(());
            }

            if let Some(err) = turn.error {
                if err.is_retryable() {
                    run.transport_retries += 1;
                    let max = self.settings.max_transport_retries;
                    if run.transport_retries > max {
                        self.fail(
                            run,
                            emitter,
                            MODEL_UNAVAILABLE,
                            format!("Model is unavailable after {} retries: {}", max, err),
                        )
                        .await;
                        return Ok(());
                    }
                    warn!(attempt = run.transport_retries, error = %err, "Model transport error, retrying");
                    emitter
                        .retry(
                            "model_transport_error",
                            run.transport_retries,
                            max,
                            format!("Model request failed, retrying ({}/{})...", run.transport_retries, max),
                        )
                        .await;
                    tokio::time::sleep(self.backoff(run.transport_retries)).await;
                    continue;
                }
                self.fail(run, emitter, MODEL_ERROR, err.to_string()).await;
                return Ok(());
            }
            run.transport_retries = 0;

            let finish_reason = match turn.finish_reason.clone() {
                Some(reason) => Some(reason),
                None if !turn.tool_calls.is_empty() => Some("tool_calls".to_string()),
                None if !turn.text.trim().is_empty() || !turn.textual_calls.is_empty() => Some("stop".to_string()),
                None => None,
            };

            let flow = match finish_reason.as_deref() {
                Some("tool_calls" | "function_call" | "stop") if !turn.tool_calls.is_empty() => {
                    self.handle_tool_calls(request, run, emitter, turn).await?
                }
                Some("stop") => self.handle_stop(request, run, emitter, turn).await?,
                None => {
                    self.retry_or_fail(
                        run,
                        emitter,
                        "empty_finish_reason",
                        UNEXPECTED_FINISH_REASON,
                        "Model produced no content or tool call after multiple retries.",
                        Some(EMPTY_FINISH_REMINDER),
                    )
                    .await
                }
                Some(other) => {
                    self.fail(run, emitter, UNEXPECTED_FINISH_REASON, format!("Unexpected finish_reason: {}", other))
                        .await
                }
            };

            if flow == Flow::Finished {
                return Ok(());
            }
        }

        self.fail(
            run,
            emitter,
            MAX_ITERATIONS_REACHED,
            format!("Reached maximum iterations ({}); aborting execution", max_iterations),
        )
        .await;
        Ok(())
    }

    /// Streams one model response to the client, withholding textual tool
    /// calls, and collects the tool-call fragments.
    async fn consume_turn(&self, mut stream: ModelStream, run: &mut RunState, emitter: &mut EventEmitter) -> TurnOutput {
        let mut out = TurnOutput::default();
        let mut filter = TextualToolFilter::new();
        let mut fragments: BTreeMap<usize, PartialCall> = BTreeMap::new();

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    out.error = Some(err);
                    break;
                }
            };
            if let Some(delta) = chunk.content_delta.as_deref() {
                for segment in filter.push(delta) {
                    self.emit_segment(&segment, run, emitter, &mut out).await;
                }
            }
            for delta in chunk.tool_call_deltas {
                let partial = fragments.entry(delta.index).or_default();
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    partial.id = id;
                }
                if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
                    partial.name = name;
                }
                if let Some(fragment) = delta.arguments_fragment {
                    partial.arguments.push_str(&fragment);
                }
            }
            if let Some(reason) = chunk.finish_reason {
                out.finish_reason = Some(reason);
            }
            if emitter.is_disconnected() {
                break;
            }
        }

        for segment in filter.finish() {
            self.emit_segment(&segment, run, emitter, &mut out).await;
        }
        emitter.finish_content().await;
        out.aborted = emitter.is_disconnected();

        // Text from a turn that failed or was cut short is not progress.
        if run.guarded && !out.aborted && out.error.is_none() {
            let progress = out.text.trim();
            if !progress.is_empty() {
                run.progress.push(progress.to_string());
            }
        }
        out.textual_calls = filter.take_detected();
        out.tool_calls = fragments
            .into_values()
            .map(|p| ToolCall::function(p.id, p.name, p.arguments))
            .collect();
        out
    }

    async fn emit_segment(&self, segment: &str, run: &mut RunState, emitter: &mut EventEmitter, out: &mut TurnOutput) {
        if segment.is_empty() {
            return;
        }
        if !emitter.content_open() {
            run.transition(AgentState::Generating);
        }
        emitter.begin_content(run.guarded).await;
        emitter.push_delta(segment).await;
        out.text.push_str(segment);
    }

    async fn handle_tool_calls(
        &self,
        request: &AgentRequest,
        run: &mut RunState,
        emitter: &mut EventEmitter,
        turn: TurnOutput,
    ) -> anyhow::Result<Flow> {
        let mut calls = turn.tool_calls;
        if calls.len() > 1 {
            let names: Vec<String> = calls
                .iter()
                .map(|c| normalize_tool_name(&c.function.name).to_string())
                .collect();
            match self.settings.multi_tool_policy {
                MultiToolPolicy::Reject => {
                    warn!(tools = ?names, "Model requested several tools, rejecting the turn");
                    let warning = self.settings.multiple_tools_warning.clone();
                    return Ok(self
                        .retry_or_fail(
                            run,
                            emitter,
                            "multiple_tools_called",
                            MULTIPLE_TOOLS_MAX_RETRIES,
                            "Model kept invoking multiple tools in one turn.",
                            Some(&warning),
                        )
                        .await);
                }
                MultiToolPolicy::First => {
                    warn!(executing = %names[0], ignored = ?&names[1..], "Model requested several tools, executing the first");
                    emitter
                        .thinking(format!(
                            "Model requested {} tools; executing {}, ignoring {}",
                            names.len(),
                            names[0],
                            names[1..].join(", ")
                        ))
                        .await;
                    calls.truncate(1);
                }
            }
        }
        let Some(call) = calls.into_iter().next() else {
            return Ok(Flow::Continue);
        };

        let name = normalize_tool_name(&call.function.name).to_string();
        let call_id = if call.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            call.id.clone()
        };
        let input: Value = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| json!({ "raw": call.function.arguments }))
        };

        run.transition(AgentState::ToolCalling);
        emitter
            .status(StatusKind::ToolCalling, format!("Calling tool {}...", name))
            .await;
        emitter.tool_call(&call_id, &name, input.clone()).await;
        emitter.tool_executing(&call_id, &name).await;
        run.transition(AgentState::ToolExecuting);

        let known = self.tools.contains(&name);
        if !known {
            emitter
                .recoverable_error(UNKNOWN_TOOL, format!("Unknown tool: {}", name), json!({ "tool_name": name }))
                .await;
        }
        let ctx = ToolContext::new(request.session_id, run.history.clone());
        let outcome = self.tools.execute(&name, input.clone(), &ctx).await;
        emitter
            .tool_result(&call_id, &name, outcome.output.clone(), outcome.success)
            .await;

        let assistant_text = Some(turn.text.trim()).filter(|t| !t.is_empty());
        let input_json = input.to_string();
        let output_json = outcome.output.to_string();
        self.database.messages.append_tool_exchange(
            request.session_id,
            &ToolExchange {
                assistant_content: assistant_text,
                tool_call_id: &call_id,
                tool_name: &name,
                tool_input: &input_json,
                tool_output: &output_json,
                model_id: Some(&request.model.id),
            },
        )?;
        run.history.push(ChatMessage::Assistant {
            content: assistant_text.map(str::to_string),
            tool_calls: vec![ToolCall::function(call_id.clone(), name.clone(), input_json)],
        });
        run.history.push(ChatMessage::Tool {
            tool_call_id: call_id,
            content: output_json,
        });

        if !known {
            return Ok(self
                .retry_or_fail(
                    run,
                    emitter,
                    "unknown_tool",
                    UNKNOWN_TOOL_MAX_RETRIES,
                    "Model kept calling tools that do not exist.",
                    None,
                )
                .await);
        }

        if name == "reasoning" {
            match outcome.output.get("ready_to_reply").and_then(Value::as_bool) {
                Some(false) => {
                    run.guarded = true;
                    run.push_reminder(READY_TO_REPLY_REMINDER);
                }
                Some(true) => {
                    run.guarded = false;
                    if !run.self_check_inserted && !self.settings.self_check_prompt.is_empty() {
                        run.history.push(ChatMessage::system(self.settings.self_check_prompt.clone()));
                        run.self_check_inserted = true;
                    }
                }
                None => {}
            }
        }

        run.retry_count = 0;
        run.force_reasoning = false;
        Ok(Flow::Continue)
    }

    async fn handle_stop(
        &self,
        request: &AgentRequest,
        run: &mut RunState,
        emitter: &mut EventEmitter,
        turn: TurnOutput,
    ) -> anyhow::Result<Flow> {
        if !turn.textual_calls.is_empty() {
            warn!(count = turn.textual_calls.len(), "Model wrote tool calls as text");
            run.force_reasoning = true;
            return Ok(self
                .retry_or_fail(
                    run,
                    emitter,
                    "textual_tool_call",
                    TEXTUAL_TOOL_CALL_MAX_RETRIES,
                    "Model repeatedly emitted raw JSON tool calls without using the structured tool-call channel.",
                    Some(TEXTUAL_TOOL_CALL_REMINDER),
                )
                .await);
        }

        if turn.text.trim().is_empty() {
            run.force_reasoning = true;
            return Ok(self
                .retry_or_fail(
                    run,
                    emitter,
                    "empty_content",
                    EMPTY_RESPONSE_MAX_RETRIES,
                    "Model produced no usable content after multiple retries.",
                    Some(EMPTY_CONTENT_REMINDER),
                )
                .await);
        }

        if run.guarded {
            run.transition(AgentState::AwaitingMoreActions);
            emitter
                .status(
                    StatusKind::AwaitingMoreActions,
                    "Reasoning marked the task as not ready for a final answer. Continuing the plan.",
                )
                .await;
            run.history.push(ChatMessage::assistant_text(turn.text.trim()));
            run.push_reminder(READY_TO_REPLY_REMINDER);
            return Ok(Flow::Continue);
        }

        let envelope = AssistantFinal::new(turn.text, std::mem::take(&mut run.progress));
        let stored = self.database.messages.append_assistant_final(
            request.session_id,
            &serde_json::to_string(&envelope)?,
            Some(&request.model.id),
        )?;

        run.transition(AgentState::Completed);
        emitter.status(StatusKind::Completed, "Response complete").await;
        emitter
            .done(
                stored.id,
                request.session_id,
                run.iteration,
                run.started.elapsed().as_millis() as u64,
            )
            .await;
        Ok(Flow::Finished)
    }

    /// Counts a recoverable model mistake. Within budget this emits `retry`
    /// and appends `reminder` to the history; past it, the terminal error.
    async fn retry_or_fail(
        &self,
        run: &mut RunState,
        emitter: &mut EventEmitter,
        reason: &str,
        exhausted_code: &str,
        exhausted_message: &str,
        reminder: Option<&str>,
    ) -> Flow {
        run.retry_count += 1;
        let max = self.settings.max_retries;
        if run.retry_count > max {
            return self.fail(run, emitter, exhausted_code, exhausted_message.to_string()).await;
        }
        emitter
            .retry(
                reason,
                run.retry_count,
                max,
                reminder
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Retrying ({}/{})...", run.retry_count, max)),
            )
            .await;
        if let Some(text) = reminder {
            run.history.push(ChatMessage::system(text));
        }
        Flow::Continue
    }

    async fn fail(&self, run: &mut RunState, emitter: &mut EventEmitter, code: &str, message: String) -> Flow {
        warn!(code, message = %message, iteration = run.iteration, "Agent loop ended with error");
        run.transition(AgentState::Error);
        emitter.error(code, message, None).await;
        Flow::Finished
    }

    fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let base = self.backoff_base.saturating_mul(1u32 << attempt.saturating_sub(1).min(6));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.backoff_base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::create_test_config;
    use crate::events::ChatEvent;
    use crate::llm::mock::{ScriptedModel, ScriptedTurn};
    use crate::llm::ModelChunk;
    use crate::tools::{ReasoningTool, Tool, ToolError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LookupTool {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Look something up"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"key": {"type": "string"}}})
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"success": true, "value": 42}))
        }
    }

    struct Harness {
        database: Arc<ChatDatabase>,
        model: Arc<ScriptedModel>,
        executions: Arc<AtomicUsize>,
        agent: AgentLoop,
        request: AgentRequest,
    }

    fn create_test_harness(turns: Vec<ScriptedTurn>, tweak: impl FnOnce(&mut AgentSettings)) -> Harness {
        let database = Arc::new(ChatDatabase::new_in_memory().unwrap());
        let user = database.users.create_user("alice", "hash").unwrap().unwrap();
        let session = database.sessions.create_session(user.id, None, "text-model").unwrap();

        let executions = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(LookupTool { executions: executions.clone() }));
        registry.register(Arc::new(ReasoningTool));

        let mut settings = create_test_config().agent;
        tweak(&mut settings);

        let model = Arc::new(ScriptedModel::new(turns));
        let agent = AgentLoop::new(database.clone(), model.clone(), Arc::new(registry), settings)
            .with_backoff(Duration::ZERO);
        let request = AgentRequest {
            user_id: user.id,
            session_id: session.id,
            message: "What is the value?".to_string(),
            file_ids: Vec::new(),
            model: ModelInfo {
                id: "text-model".to_string(),
                name: "Text Model".to_string(),
                supports_vision: false,
            },
        };
        Harness { database, model, executions, agent, request }
    }

    async fn run_harness(harness: &Harness) -> Vec<ChatEvent> {
        let (mut emitter, mut rx) = EventEmitter::channel(1024);
        harness.agent.run(harness.request.clone(), &mut emitter).await.unwrap();
        drop(emitter);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_well_formed(&events);
        events
    }

    /// Properties every stream must satisfy.
    fn assert_well_formed(events: &[ChatEvent]) {
        let terminals: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminals, vec![events.len() - 1], "exactly one terminal event, last");

        for pair in events.windows(2) {
            assert!(pair[1].timestamp() > pair[0].timestamp());
        }

        let mut streamed = String::new();
        let mut in_block = false;
        for event in events {
            match event {
                ChatEvent::ContentStart { .. } => {
                    assert!(!in_block);
                    in_block = true;
                    streamed.clear();
                }
                ChatEvent::ContentDelta { delta, .. } => {
                    assert!(in_block);
                    streamed.push_str(delta);
                }
                ChatEvent::ContentDone { full_content, .. } => {
                    assert_eq!(&streamed, full_content);
                    in_block = false;
                }
                _ => {}
            }
        }

        let mut stages: HashMap<String, Vec<&str>> = HashMap::new();
        for event in events {
            match event {
                ChatEvent::ToolCall { tool_call_id, .. }
                | ChatEvent::ToolExecuting { tool_call_id, .. }
                | ChatEvent::ToolResult { tool_call_id, .. } => {
                    stages.entry(tool_call_id.clone()).or_default().push(event.event_type());
                }
                _ => {}
            }
        }
        for sequence in stages.values() {
            assert_eq!(sequence, &vec!["tool_call", "tool_executing", "tool_result"]);
        }
    }

    fn error_code(events: &[ChatEvent]) -> Option<String> {
        match events.last() {
            Some(ChatEvent::Error { error_code, .. }) => Some(error_code.clone()),
            _ => None,
        }
    }

    fn count(events: &[ChatEvent], kind: &str) -> usize {
        events.iter().filter(|e| e.event_type() == kind).count()
    }

    fn retry_reasons(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Retry { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    // ===== Completion Tests =====

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let harness = create_test_harness(vec![ScriptedTurn::text("The value is 42.")], |_| {});
        let events = run_harness(&harness).await;

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "status", "iteration_info", "thinking", "status", "status", "content_start",
                "content_delta", "content_done", "status", "done"
            ]
        );
        let ChatEvent::Done { message_id, total_iterations, session_id, .. } = events.last().unwrap() else {
            panic!("expected done");
        };
        assert_eq!(*total_iterations, 1);
        assert_eq!(*session_id, harness.request.session_id);

        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].id, *message_id);
        let envelope = AssistantFinal::parse(stored[1].content.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.final_text, "The value is 42.");
        assert_eq!(stored[1].model_id.as_deref(), Some("text-model"));
    }

    #[tokio::test]
    async fn test_one_tool_execution_per_iteration() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::tool_call("call_1", "lookup", r#"{"key":"a"}"#),
                ScriptedTurn::tool_call("call_2", "lookup", r#"{"key":"b"}"#),
                ScriptedTurn::text("Both lookups returned 42."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;

        assert_eq!(harness.executions.load(Ordering::SeqCst), 2);
        assert_eq!(harness.model.request_count(), 3);
        assert_eq!(count(&events, "tool_result"), 2);
        assert!(matches!(events.last(), Some(ChatEvent::Done { total_iterations: 3, .. })));

        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        let sequences: Vec<i64> = stored.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stored[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_first_policy_runs_only_first_call() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::tool_calls(&[("call_a", "lookup", "{}"), ("call_b", "reasoning", "{}")]),
                ScriptedTurn::text("Done."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;

        assert_eq!(harness.executions.load(Ordering::SeqCst), 1);
        assert_eq!(count(&events, "tool_call"), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Thinking { message, .. } if message.contains("ignoring reasoning")
        )));

        let next_turn = harness.model.request(1);
        let call_ids: Vec<String> = next_turn
            .messages
            .iter()
            .flat_map(|m| match m {
                ChatMessage::Assistant { tool_calls, .. } => tool_calls.iter().map(|c| c.id.clone()).collect(),
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(call_ids, vec!["call_a".to_string()]);
        assert!(matches!(
            next_turn.messages.last(),
            Some(ChatMessage::Tool { tool_call_id, .. }) if tool_call_id == "call_a"
        ));
    }

    #[tokio::test]
    async fn test_reject_policy_exhausts_retries() {
        let multi = || ScriptedTurn::tool_calls(&[("a", "lookup", "{}"), ("b", "lookup", "{}")]);
        let harness = create_test_harness(vec![multi(), multi(), multi()], |s| {
            s.multi_tool_policy = MultiToolPolicy::Reject;
        });
        let events = run_harness(&harness).await;

        assert_eq!(harness.executions.load(Ordering::SeqCst), 0);
        assert_eq!(retry_reasons(&events), vec!["multiple_tools_called"; 2]);
        assert_eq!(error_code(&events).as_deref(), Some(MULTIPLE_TOOLS_MAX_RETRIES));

        let second = harness.model.request(1);
        assert!(matches!(
            second.messages.last(),
            Some(ChatMessage::System { content }) if content == "One tool per turn."
        ));
    }

    // ===== Guard Rail Tests =====

    #[tokio::test]
    async fn test_iteration_cap() {
        let turns = (0..10)
            .map(|i| ScriptedTurn::tool_call(&format!("call_{}", i), "lookup", "{}"))
            .collect();
        let harness = create_test_harness(turns, |_| {});
        let events = run_harness(&harness).await;

        assert_eq!(harness.model.request_count(), 5);
        assert_eq!(harness.executions.load(Ordering::SeqCst), 5);
        assert_eq!(error_code(&events).as_deref(), Some(MAX_ITERATIONS_REACHED));
        let max_seen = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::IterationInfo { current_iteration, .. } => Some(*current_iteration),
                _ => None,
            })
            .max();
        assert_eq!(max_seen, Some(5));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::Fail(ModelError::Transport("reset".into())),
                ScriptedTurn::Fail(ModelError::Transport("reset".into())),
                ScriptedTurn::text("Recovered."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;
        assert_eq!(retry_reasons(&events), vec!["model_transport_error"; 2]);
        assert!(matches!(events.last(), Some(ChatEvent::Done { total_iterations: 3, .. })));
    }

    #[tokio::test]
    async fn test_mid_stream_transport_error_closes_block_and_retries() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::Broken(vec![ModelChunk::text("Partial ")], ModelError::Transport("reset".into())),
                ScriptedTurn::text("Recovered."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;

        let done_at = events
            .iter()
            .position(|e| matches!(e, ChatEvent::ContentDone { full_content, .. } if full_content == "Partial "))
            .expect("broken block is closed");
        let retry_at = events
            .iter()
            .position(|e| matches!(e, ChatEvent::Retry { reason, .. } if reason == "model_transport_error"))
            .expect("transport retry");
        assert!(done_at < retry_at);
        assert!(matches!(events.last(), Some(ChatEvent::Done { total_iterations: 2, .. })));

        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        assert_eq!(stored.len(), 2);
        let envelope = AssistantFinal::parse(stored[1].content.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.final_text, "Recovered.");
    }

    #[tokio::test]
    async fn test_transport_retry_exhaustion() {
        let fail = || ScriptedTurn::Fail(ModelError::Transport("down".into()));
        let harness = create_test_harness(vec![fail(), fail(), fail()], |_| {});
        let events = run_harness(&harness).await;

        assert_eq!(error_code(&events).as_deref(), Some(MODEL_UNAVAILABLE));
        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        assert_eq!(stored.len(), 1, "only the user message is committed");
    }

    #[tokio::test]
    async fn test_protocol_error_is_terminal() {
        let harness = create_test_harness(
            vec![ScriptedTurn::Fail(ModelError::Protocol("400 bad model".into()))],
            |_| {},
        );
        let events = run_harness(&harness).await;
        assert_eq!(error_code(&events).as_deref(), Some(MODEL_ERROR));
        assert_eq!(harness.model.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recoverable() {
        let harness = create_test_harness(
            vec![ScriptedTurn::tool_call("call_x", "fly", "{}"), ScriptedTurn::text("Sorry.")],
            |_| {},
        );
        let events = run_harness(&harness).await;

        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Error { error_code, details: Some(d), .. } if error_code == UNKNOWN_TOOL && d["tool_name"] == "fly"
        )));
        assert!(events.iter().any(|e| matches!(e, ChatEvent::ToolResult { success: false, .. })));
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_unknown_tool_retry_exhaustion() {
        let turns = (0..3)
            .map(|i| ScriptedTurn::tool_call(&format!("c{}", i), "functions.fly", "{}"))
            .collect();
        let harness = create_test_harness(turns, |_| {});
        let events = run_harness(&harness).await;
        assert_eq!(error_code(&events).as_deref(), Some(UNKNOWN_TOOL_MAX_RETRIES));
    }

    #[tokio::test]
    async fn test_textual_tool_call_forces_reasoning() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::text("{\"name\": \"lookup\", \"arguments\": {\"key\": \"a\"}}"),
                ScriptedTurn::text("The value is 42."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;

        assert_eq!(retry_reasons(&events), vec!["textual_tool_call"]);
        assert_eq!(harness.model.request(1).tool_choice, ToolChoice::Function("reasoning".into()));
        assert!(!events.iter().any(|e| matches!(
            e,
            ChatEvent::ContentDelta { delta, .. } if delta.contains("arguments")
        )));
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_empty_content_retry_exhaustion() {
        let empty = || ScriptedTurn::Chunks(vec![ModelChunk::finish("stop")]);
        let harness = create_test_harness(vec![empty(), empty(), empty()], |_| {});
        let events = run_harness(&harness).await;
        assert_eq!(retry_reasons(&events), vec!["empty_content"; 2]);
        assert_eq!(error_code(&events).as_deref(), Some(EMPTY_RESPONSE_MAX_RETRIES));
    }

    #[tokio::test]
    async fn test_missing_finish_reason_without_output() {
        let nothing = || ScriptedTurn::Chunks(Vec::new());
        let harness = create_test_harness(vec![nothing(), nothing(), nothing()], |_| {});
        let events = run_harness(&harness).await;
        assert_eq!(retry_reasons(&events), vec!["empty_finish_reason"; 2]);
        assert_eq!(error_code(&events).as_deref(), Some(UNEXPECTED_FINISH_REASON));
    }

    #[tokio::test]
    async fn test_missing_finish_reason_with_text_is_stop() {
        let harness = create_test_harness(
            vec![ScriptedTurn::Chunks(vec![ModelChunk::text("Answer.")])],
            |_| {},
        );
        let events = run_harness(&harness).await;
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_length_finish_reason_is_terminal() {
        let harness = create_test_harness(
            vec![ScriptedTurn::Chunks(vec![ModelChunk::text("Partial"), ModelChunk::finish("length")])],
            |_| {},
        );
        let events = run_harness(&harness).await;
        assert_eq!(error_code(&events).as_deref(), Some(UNEXPECTED_FINISH_REASON));
        assert!(events.iter().any(|e| matches!(e, ChatEvent::ContentDone { full_content, .. } if full_content == "Partial")));
    }

    // ===== Guarded Content Tests =====

    #[tokio::test]
    async fn test_ready_to_reply_guard() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::tool_call(
                    "r1",
                    "reasoning",
                    r#"{"thinking_focus":"task_planning","specific_question":"plan?","ready_to_reply":false}"#,
                ),
                ScriptedTurn::text("Still collecting data."),
                ScriptedTurn::tool_call(
                    "r2",
                    "reasoning",
                    r#"{"thinking_focus":"progress_review","specific_question":"done?","ready_to_reply":true}"#,
                ),
                ScriptedTurn::text("Final answer: 42."),
            ],
            |_| {},
        );
        let events = run_harness(&harness).await;

        let guarded_blocks: Vec<(String, bool)> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::ContentDone { full_content, guarded, .. } => Some((full_content.clone(), *guarded)),
                _ => None,
            })
            .collect();
        assert_eq!(
            guarded_blocks,
            vec![
                ("Still collecting data.".to_string(), true),
                ("Final answer: 42.".to_string(), false)
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Status { status: StatusKind::AwaitingMoreActions, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::ContentStart { message, guarded: true, .. } if message == "Sharing execution progress..."
        )));

        let last_request = harness.model.request(3);
        assert!(last_request.messages.iter().any(|m| matches!(
            m,
            ChatMessage::System { content } if content == "Check your answer."
        )));

        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        let envelope = AssistantFinal::parse(stored.last().unwrap().content.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.final_text, "Final answer: 42.");
        assert_eq!(envelope.progress, vec!["Still collecting data.".to_string()]);
    }

    #[tokio::test]
    async fn test_broken_guarded_turn_is_not_progress() {
        let harness = create_test_harness(
            vec![
                ScriptedTurn::tool_call(
                    "r1",
                    "reasoning",
                    r#"{"thinking_focus":"task_planning","specific_question":"plan?","ready_to_reply":false}"#,
                ),
                ScriptedTurn::Broken(vec![ModelChunk::text("Half a note")], ModelError::Transport("reset".into())),
                ScriptedTurn::text("Still collecting data."),
                ScriptedTurn::tool_call(
                    "r2",
                    "reasoning",
                    r#"{"thinking_focus":"progress_review","specific_question":"done?","ready_to_reply":true}"#,
                ),
                ScriptedTurn::text("Final answer: 42."),
            ],
            |s| s.max_iterations = 8,
        );
        let events = run_harness(&harness).await;
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        let envelope = AssistantFinal::parse(stored.last().unwrap().content.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.final_text, "Final answer: 42.");
        assert_eq!(envelope.progress, vec!["Still collecting data.".to_string()]);
    }

    // ===== Cancellation Tests =====

    #[tokio::test]
    async fn test_disconnected_client_stops_model_calls() {
        let harness = create_test_harness(vec![ScriptedTurn::text("unused")], |_| {});
        let (mut emitter, rx) = EventEmitter::channel(8);
        drop(rx);

        harness.agent.run(harness.request.clone(), &mut emitter).await.unwrap();
        assert!(emitter.is_disconnected());
        assert_eq!(harness.model.request_count(), 0);
    }

    /// Runs the harness with a reader that hangs up after the first delta.
    async fn run_until_first_delta(harness: &Harness) -> Vec<ChatEvent> {
        let (mut emitter, mut rx) = EventEmitter::channel(1);
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                let is_delta = matches!(event, ChatEvent::ContentDelta { .. });
                seen.push(event);
                if is_delta {
                    break;
                }
            }
            seen
        });
        harness.agent.run(harness.request.clone(), &mut emitter).await.unwrap();
        assert!(emitter.is_disconnected());
        reader.await.unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_mid_answer_saves_nothing() {
        let harness = create_test_harness(
            vec![ScriptedTurn::Chunks(vec![
                ModelChunk::text("The answer is "),
                ModelChunk::text("forty"),
                ModelChunk::text("-two, because "),
                ModelChunk::text("the lookup said so."),
                ModelChunk::finish("stop"),
            ])],
            |_| {},
        );
        let seen = run_until_first_delta(&harness).await;
        assert!(!seen.iter().any(|e| e.is_terminal()));

        assert_eq!(harness.model.request_count(), 1);
        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        assert_eq!(stored.len(), 1, "only the user message is committed");
    }

    #[tokio::test]
    async fn test_disconnect_mid_tool_call_runs_nothing() {
        let ScriptedTurn::Chunks(call_chunks) = ScriptedTurn::tool_call("call_1", "lookup", r#"{"key":"a"}"#) else {
            unreachable!();
        };
        let mut chunks = vec![ModelChunk::text("Let me check. "), ModelChunk::text("One moment.")];
        chunks.extend(call_chunks);
        let harness = create_test_harness(vec![ScriptedTurn::Chunks(chunks)], |_| {});
        run_until_first_delta(&harness).await;

        assert_eq!(harness.executions.load(Ordering::SeqCst), 0);
        assert_eq!(harness.model.request_count(), 1);
        let stored = harness.database.messages.list_messages(harness.request.session_id).unwrap();
        assert_eq!(stored.len(), 1);
    }
}
