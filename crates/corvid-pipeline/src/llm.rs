//! LLM stage: streaming generation with tool-call routing.
//!
//! On a gate-passed final the stage appends the user message, streams
//! completion deltas downstream as they arrive, and resolves tool calls
//! through the registry — exactly one `ToolResult` per `ToolCall`, injected
//! back into the context before the next request cycle. An interrupted turn
//! cancels the in-flight request through the turn token and never appends
//! the aborted partial to the context.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corvid_config::LlmProviderConfig;
use corvid_core::{
    ChatRequest, Context, ControlFrame, CoreError, FinishReason, Frame, FrameProcessor,
    FrameSender, LanguageModel, LlmEvent, MetricEvent, MetricKind, ProcessorContext, Result,
    ToolCall, ToolResult,
};
use corvid_tools::ToolRegistry;

use crate::control::TurnControl;

/// Bound on request cycles within one turn; each tool resolution starts a
/// new cycle.
const MAX_TOOL_CYCLES: u32 = 4;

const GREETING_INSTRUCTION: &str =
    "Please introduce yourself to the user briefly and warmly. This is the start of the session.";

pub struct LlmStage {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    context: Arc<RwLock<Context>>,
    control: Arc<TurnControl>,
    config: LlmProviderConfig,
    /// Wind-down budget once the turn is interrupted.
    abort_grace: Duration,
}

impl LlmStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        context: Arc<RwLock<Context>>,
        control: Arc<TurnControl>,
        config: LlmProviderConfig,
        abort_grace: Duration,
    ) -> Self {
        Self {
            model,
            tools,
            context,
            control,
            config,
            abort_grace,
        }
    }

    fn request(&self) -> ChatRequest {
        let messages = self.context.read().snapshot();
        let mut request = ChatRequest::new(messages);
        request.max_tokens = self.config.max_tokens;
        request.temperature = self.config.temperature;
        if !self.tools.is_empty() {
            request.tools = self.tools.definitions();
        }
        request
    }

    async fn run_turn(&self, turn_id: u64, out: &FrameSender) -> Result<()> {
        let cancel = self
            .control
            .token(turn_id)
            .unwrap_or_else(CancellationToken::new);

        self.control.set_assistant_active(true);
        let started = Instant::now();
        let mut ttfb_recorded = false;
        let mut full_text = String::new();

        for cycle in 0..MAX_TOOL_CYCLES {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let (event_tx, mut event_rx) = mpsc::channel::<LlmEvent>(64);
            let model = self.model.clone();
            let request = self.request();
            let stream_cancel = cancel.clone();
            let stream = tokio::spawn(async move {
                model.chat_stream(request, event_tx, stream_cancel).await
            });
            let stream_abort = stream.abort_handle();

            let mut pending_calls: Vec<ToolCall> = Vec::new();
            let mut finish = FinishReason::Stop;
            let mut call_seq = 0usize;
            // Set once the turn is interrupted: the backend gets the abort
            // grace to wind down before the task is dropped.
            let mut abort_deadline: Option<tokio::time::Instant> = None;

            loop {
                let event = if let Some(deadline) = abort_deadline {
                    match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(_) => {
                            tracing::warn!(turn_id, "abort grace elapsed, dropping generation");
                            stream_abort.abort();
                            break;
                        }
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            abort_deadline =
                                Some(tokio::time::Instant::now() + self.abort_grace);
                            continue;
                        }
                        maybe = event_rx.recv() => match maybe {
                            Some(event) => event,
                            None => break,
                        },
                    }
                };

                match event {
                    LlmEvent::Delta(text) => {
                        if !ttfb_recorded {
                            ttfb_recorded = true;
                            let ttfb = started.elapsed().as_secs_f64() * 1_000.0;
                            out.send(Frame::Metric(Arc::new(MetricEvent::latency(
                                "llm",
                                MetricKind::LlmTtfb,
                                ttfb,
                                turn_id,
                            ))))
                            .await
                            .ok();
                        }
                        full_text.push_str(&text);
                        out.send(Frame::AssistantDelta { text, turn_id }).await.ok();
                    }
                    LlmEvent::ToolCallRequest {
                        call_id,
                        name,
                        arguments,
                    } => {
                        let call_id = if call_id.is_empty() {
                            call_seq += 1;
                            format!("call-{}-{}-{}", turn_id, cycle, call_seq)
                        } else {
                            call_id
                        };
                        pending_calls.push(ToolCall {
                            call_id,
                            name,
                            arguments,
                            turn_id,
                        });
                    }
                    LlmEvent::Done(reason) => {
                        finish = reason;
                        break;
                    }
                }
            }

            // The join is bounded by the same grace; on a normal finish the
            // task has already returned by the time the loop ends.
            match tokio::time::timeout(self.abort_grace, stream).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    // The turn aborts; anything already spoken stops and the
                    // session stays alive for the next utterance.
                    self.control.interrupt(turn_id);
                    out.send(Frame::Interrupt {
                        reason: corvid_core::InterruptReason::ProviderFailure,
                        turn_id,
                    })
                    .await
                    .ok();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(CoreError::Invariant(format!("llm task: {}", e)));
                }
                Err(_) => {
                    stream_abort.abort();
                    if cancel.is_cancelled() {
                        tracing::warn!(turn_id, "llm wind-down exceeded abort grace");
                        return Ok(());
                    }
                    return Err(CoreError::Invariant(
                        "llm task outlived its event stream".into(),
                    ));
                }
            }

            // An interrupted request leaves no trace in the context.
            if finish == FinishReason::Cancelled || cancel.is_cancelled() {
                tracing::debug!(turn_id, "generation cancelled mid-stream");
                return Ok(());
            }

            if pending_calls.is_empty() {
                break;
            }

            for call in pending_calls {
                self.resolve_tool_call(call, out).await;
            }
            // Loop back for the post-tool continuation cycle.
        }

        self.context.write().push_assistant(&full_text);
        out.send(Frame::AssistantFinal {
            text: full_text,
            turn_id,
        })
        .await
        .ok();
        Ok(())
    }

    /// Execute one tool call and inject the paired result.
    async fn resolve_tool_call(&self, call: ToolCall, out: &FrameSender) {
        tracing::info!(turn_id = call.turn_id, tool = %call.name, "tool call");
        out.send(Frame::ToolCall(call.clone())).await.ok();

        let result = match self.tools.execute(&call.name, call.arguments.clone()).await {
            Ok(value) => ToolResult::ok(&call, value),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                ToolResult::err(&call, e.to_string())
            }
        };

        let content = match (&result.value, &result.error) {
            (Some(value), _) => value.to_string(),
            (None, Some(error)) => format!("Error: {}", error),
            (None, None) => String::new(),
        };
        self.context.write().push_tool_exchange(call, content);

        out.send(Frame::ToolResult(result)).await.ok();
    }
}

#[async_trait]
impl FrameProcessor for LlmStage {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            // The final stops here: downstream is assistant-output territory.
            Frame::SttFinal { transcript, turn_id } => {
                self.context.write().push_user(&transcript.text);
                self.run_turn(turn_id, out).await
            }
            Frame::Control(ControlFrame::Greet) => {
                let turn = self.control.begin_turn();
                self.context
                    .write()
                    .push(corvid_core::Message::system(GREETING_INSTRUCTION));
                self.run_turn(turn.turn_id, out).await
            }
            // Metrics and errors were tapped onto the bus at emission.
            Frame::Metric(_) | Frame::Error { .. } => Ok(()),
            other => {
                out.send(other).await.ok();
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::Transcript;
    use corvid_tools::{Tool, ToolError};
    use serde_json::{json, Value};

    /// Scripted model: first cycle may request a tool, then streams text.
    struct ScriptedModel {
        tool_first: bool,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        async fn chat_stream(
            &self,
            request: ChatRequest,
            events: mpsc::Sender<LlmEvent>,
            cancel: CancellationToken,
        ) -> Result<()> {
            if cancel.is_cancelled() {
                let _ = events.send(LlmEvent::Done(FinishReason::Cancelled)).await;
                return Ok(());
            }

            let has_tool_result = request
                .messages
                .iter()
                .any(|m| m.role == corvid_core::Role::Tool);

            if self.tool_first && !has_tool_result {
                let _ = events
                    .send(LlmEvent::ToolCallRequest {
                        call_id: "call_1".into(),
                        name: "execute_movement".into(),
                        arguments: json!({"gestures": ["wave_right"]}),
                    })
                    .await;
                let _ = events.send(LlmEvent::Done(FinishReason::ToolUse)).await;
                return Ok(());
            }

            for delta in ["There ", "you ", "go!"] {
                let _ = events.send(LlmEvent::Delta(delta.into())).await;
            }
            let _ = events.send(LlmEvent::Done(FinishReason::Stop)).await;
            Ok(())
        }
    }

    struct OkTool;

    #[async_trait]
    impl Tool for OkTool {
        fn name(&self) -> &str {
            "execute_movement"
        }
        fn description(&self) -> &str {
            "test movement"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: Value) -> std::result::Result<Value, ToolError> {
            Ok(json!("ok"))
        }
    }

    fn stage(tool_first: bool) -> (LlmStage, Arc<TurnControl>, Arc<RwLock<Context>>) {
        let control = Arc::new(TurnControl::new());
        let context = Arc::new(RwLock::new(Context::new("persona", 8_192)));
        let mut tools = ToolRegistry::new();
        if tool_first {
            tools.register(OkTool);
        }
        let stage = LlmStage::new(
            Arc::new(ScriptedModel { tool_first }),
            Arc::new(tools),
            context.clone(),
            control.clone(),
            LlmProviderConfig::default(),
            Duration::from_millis(200),
        );
        (stage, control, context)
    }

    fn final_frame(control: &TurnControl, text: &str) -> Frame {
        let turn = control.begin_turn();
        Frame::SttFinal {
            transcript: Transcript::new(text),
            turn_id: turn.turn_id,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_streams_deltas_then_final() {
        let (stage, control, context) = stage(false);
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(64);

        stage
            .process(final_frame(&control, "say something"), &mut ctx, &tx)
            .await
            .unwrap();

        let frames = collect(&mut rx).await;
        let deltas: Vec<&str> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::AssistantDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["There ", "you ", "go!"]);

        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::Metric(m) if m.kind == MetricKind::LlmTtfb
        )));
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { text, .. } if text == "There you go!")));

        // Context holds user + assistant messages.
        let messages = context.read().snapshot();
        assert!(messages
            .iter()
            .any(|m| m.role == corvid_core::Role::Assistant && m.content == "There you go!"));
    }

    #[tokio::test]
    async fn test_tool_call_cycle() {
        let (stage, control, context) = stage(true);
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(64);

        stage
            .process(final_frame(&control, "wave at me"), &mut ctx, &tx)
            .await
            .unwrap();

        let frames = collect(&mut rx).await;
        let calls: Vec<&ToolCall> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect();
        let results: Vec<&ToolResult> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::ToolResult(r) => Some(r),
                _ => None,
            })
            .collect();

        // Exactly one result per call, matching ids.
        assert_eq!(calls.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(calls[0].call_id, results[0].call_id);
        assert!(!results[0].is_error());

        // The continuation cycle produced spoken text.
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { text, .. } if !text.is_empty())));

        // Tool exchange is in the context.
        let messages = context.read().snapshot();
        assert!(messages.iter().any(|m| m.role == corvid_core::Role::Tool));
    }

    #[tokio::test]
    async fn test_interrupted_turn_appends_nothing() {
        let (stage, control, context) = stage(false);
        let before = context.read().len();

        let turn = control.begin_turn();
        control.interrupt(turn.turn_id);

        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(64);
        stage
            .process(
                Frame::SttFinal {
                    transcript: Transcript::new("ignored"),
                    turn_id: turn.turn_id,
                },
                &mut ctx,
                &tx,
            )
            .await
            .unwrap();

        let frames = collect(&mut rx).await;
        assert!(!frames
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { .. })));
        // Only the user message was appended; no assistant partial.
        assert_eq!(context.read().len(), before + 1);
    }

    #[tokio::test]
    async fn test_greet_runs_unsolicited_turn() {
        let (stage, _control, _context) = stage(false);
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(64);

        stage
            .process(Frame::Control(ControlFrame::Greet), &mut ctx, &tx)
            .await
            .unwrap();

        let frames = collect(&mut rx).await;
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { .. })));
    }
}
