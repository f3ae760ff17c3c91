use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use toolstream_core::events::{ProtocolEvent, RunContext};
use toolstream_core::messages::Message;
use toolstream_core::provider::{CompletionProvider, CompletionRequest};
use toolstream_core::sse::SseFrame;
use toolstream_core::state::{apply_ops, StateOp};
use toolstream_core::tools::ToolContext;
use toolstream_llm::accumulator::{AssistantTurn, DeltaAccumulator, ToolCallFragment};

use crate::emitter::EventSink;
use crate::error::EngineError;
use crate::registry::ToolRegistry;

const DEFAULT_MAX_ROUNDS: u32 = 8;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the dispatch loop.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Hard cap on completion rounds per run.
    pub max_rounds: u32,
    /// Per-call handler timeout. `None` waits indefinitely.
    pub tool_timeout: Option<Duration>,
    /// Prepended to every upstream request; never part of the history.
    pub system_prompt: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            system_prompt: None,
        }
    }
}

/// History and shared state owned by one run. The loop is their only writer.
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub state: Value,
}

impl Conversation {
    pub fn new(messages: Vec<Message>, state: Value) -> Self {
        Self { messages, state }
    }
}

/// Outcome of a run that reached RUN_FINISHED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: u32,
    pub tool_calls: usize,
}

/// Drives one run: completion round → tool calls → next round, until a
/// round yields no tool calls.
pub struct Runner {
    provider: Arc<dyn CompletionProvider>,
    registry: Arc<ToolRegistry>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(provider: Arc<dyn CompletionProvider>, registry: Arc<ToolRegistry>, config: RunnerConfig) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run to completion, emitting the full event sequence into `sink`.
    ///
    /// Every failure except a closed sink is reported as a single RUN_ERROR
    /// before returning. With a closed sink nothing further is emitted.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, thread_id = %ctx.thread_id))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        conversation: &mut Conversation,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        match self.drive(ctx, conversation, sink, cancel).await {
            Ok(summary) => {
                info!(rounds = summary.rounds, tool_calls = summary.tool_calls, "run finished");
                Ok(summary)
            }
            Err(EngineError::SinkClosed(closed)) => {
                info!("downstream closed, abandoning run");
                Err(EngineError::SinkClosed(closed))
            }
            Err(e) => {
                warn!(code = e.code(), error = %e, "run failed");
                let event = ProtocolEvent::run_error(e.to_string(), e.code());
                if sink.emit(ctx.stamp(event)).await.is_err() {
                    debug!("downstream closed before RUN_ERROR");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        conversation: &mut Conversation,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        emit(sink, ctx, ProtocolEvent::RunStarted).await?;
        emit(
            sink,
            ctx,
            ProtocolEvent::StateSnapshot {
                snapshot: conversation.state.clone(),
            },
        )
        .await?;

        let mut round = 0u32;
        let mut tool_calls = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if round >= self.config.max_rounds {
                return Err(EngineError::MaxRoundsExceeded(self.config.max_rounds));
            }
            round += 1;

            let step_name = format!("round-{round}");
            emit(sink, ctx, ProtocolEvent::StepStarted { step_name: step_name.clone() }).await?;

            let turn = self.stream_round(ctx, conversation, sink, cancel, round).await?;
            conversation.messages.push(turn.to_message());

            if !turn.has_tool_calls() {
                emit(sink, ctx, ProtocolEvent::StepFinished { step_name }).await?;
                break;
            }

            tool_calls += turn.tool_calls.len();
            self.dispatch_tools(ctx, conversation, &turn.tool_calls, sink, cancel)
                .await?;
            emit(sink, ctx, ProtocolEvent::StepFinished { step_name }).await?;
        }

        emit(
            sink,
            ctx,
            ProtocolEvent::MessagesSnapshot {
                messages: conversation.messages.clone(),
            },
        )
        .await?;
        emit(sink, ctx, ProtocolEvent::RunFinished).await?;

        Ok(RunSummary { rounds: round, tool_calls })
    }

    /// One completion request, streamed through a fresh accumulator.
    #[instrument(skip_all, fields(round = round))]
    async fn stream_round(
        &self,
        ctx: &RunContext,
        conversation: &Conversation,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        round: u32,
    ) -> Result<AssistantTurn, EngineError> {
        let request = CompletionRequest {
            messages: self.request_messages(&conversation.messages),
            tools: self.registry.definitions(),
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.provider.stream(&request) => result?,
        };

        let mut accumulator = DeltaAccumulator::new();
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(SseFrame::Data(payload))) => {
                    for event in accumulator.push_payload(&payload)? {
                        emit(sink, ctx, event).await?;
                    }
                }
                Some(Ok(SseFrame::Done)) | None => break,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let (events, turn) = accumulator.finish();
        for event in events {
            emit(sink, ctx, event).await?;
        }
        let turn = turn.ok_or(EngineError::MissingAssistantMessage)?;
        debug!(
            content_len = turn.content.len(),
            tool_calls = turn.tool_calls.len(),
            finish_reason = turn.finish_reason.as_deref().unwrap_or(""),
            "round complete"
        );
        Ok(turn)
    }

    fn request_messages(&self, history: &[Message]) -> Vec<Message> {
        match &self.config.system_prompt {
            Some(prompt) if !prompt.is_empty() => {
                let mut messages = Vec::with_capacity(history.len() + 1);
                messages.push(Message::system(prompt.clone()));
                messages.extend_from_slice(history);
                messages
            }
            _ => history.to_vec(),
        }
    }

    /// Execute a round's tool calls one after another, in the order their
    /// contexts were opened.
    async fn dispatch_tools(
        &self,
        ctx: &RunContext,
        conversation: &mut Conversation,
        calls: &[ToolCallFragment],
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for call in calls {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (mut content, state_ops) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                outcome = self.execute_tool(ctx, &conversation.state, call, cancel) => outcome,
            };

            // A rejected state update turns the result into an error.
            let mut next_state = None;
            if !state_ops.is_empty() {
                let mut next = conversation.state.clone();
                match apply_ops(&mut next, &state_ops) {
                    Ok(()) => next_state = Some(next),
                    Err(e) => {
                        warn!(tool = %call.name, tool_call_id = %call.id, error = %e, "rejecting state update");
                        content = format!("Error executing {}: {e}", call.name);
                    }
                }
            }

            let message = Message::tool_result(call.id.clone(), content.clone());
            let message_id = message.id.clone();
            conversation.messages.push(message);
            emit(
                sink,
                ctx,
                ProtocolEvent::ToolCallResult {
                    message_id,
                    tool_call_id: call.id.clone(),
                    content,
                },
            )
            .await?;

            if let Some(next) = next_state {
                conversation.state = next;
                emit(sink, ctx, ProtocolEvent::StateDelta { delta: state_ops }).await?;
            }
        }
        Ok(())
    }

    /// Resolve, parse and invoke one call. Every failure becomes result text.
    async fn execute_tool(
        &self,
        ctx: &RunContext,
        state: &Value,
        call: &ToolCallFragment,
        cancel: &CancellationToken,
    ) -> (String, Vec<StateOp>) {
        let name = call.name.as_str();

        let Some(tool) = self.registry.get(name) else {
            warn!(tool = %name, tool_call_id = %call.id, "unknown tool");
            return (format!("Error executing {name}: unknown tool"), Vec::new());
        };

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %name, tool_call_id = %call.id, error = %e, "unparseable tool arguments");
                return (format!("Error parsing arguments for {name}: {e}"), Vec::new());
            }
        };

        let tool_ctx = ToolContext {
            thread_id: ctx.thread_id.clone(),
            run_id: ctx.run_id.clone(),
            tool_call_id: call.id.clone(),
            state: state.clone(),
            abort_signal: cancel.child_token(),
        };

        let guarded = std::panic::AssertUnwindSafe(tool.execute(args, &tool_ctx)).catch_unwind();
        let result = match self.config.tool_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded).await.map_err(|_| limit),
            None => Ok(guarded.await),
        };

        match result {
            Ok(Ok(Ok(output))) => (output.content, output.state_ops),
            Ok(Ok(Err(e))) => {
                warn!(tool = %name, tool_call_id = %call.id, error = %e, "tool failed");
                (format!("Error executing {name}: {e}"), Vec::new())
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, tool_call_id = %call.id, panic = %msg, "tool panicked during execution");
                (format!("Error executing {name}: tool panicked"), Vec::new())
            }
            Err(limit) => {
                warn!(tool = %name, tool_call_id = %call.id, timeout_secs = limit.as_secs(), "tool timed out");
                (
                    format!("Error executing {name}: timed out after {}s", limit.as_secs()),
                    Vec::new(),
                )
            }
        }
    }
}

async fn emit(sink: &dyn EventSink, ctx: &RunContext, event: ProtocolEvent) -> Result<(), EngineError> {
    sink.emit(ctx.stamp(event)).await?;
    Ok(())
}

/// An empty buffer means "no arguments".
fn parse_arguments(buffer: &str) -> Result<Value, serde_json::Error> {
    if buffer.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(buffer)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
