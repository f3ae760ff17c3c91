use serde_json::Value;
use tracing::{debug, warn};

use toolstream_core::events::{EventEnvelope, ProtocolEvent};
use toolstream_core::ids::{MessageId, RunId, ThreadId, ToolCallId};
use toolstream_core::messages::{Message, Role, ToolCallRef};
use toolstream_core::state::apply_ops;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Error {
        message: String,
        code: Option<String>,
    },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolCallStatus {
    /// Arguments still streaming.
    Pending,
    /// Arguments complete, result not yet known.
    Complete,
    /// Result received.
    Resolved,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallProgress {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: String,
    pub parent_message_id: Option<MessageId>,
    pub status: ToolCallStatus,
    pub result: Option<String>,
}

/// The message currently being typed out.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub started_at: u64,
}

/// Renderable state folded from one conversation's event sequence.
///
/// Events must be applied in exact emission order. Folding the same log
/// twice produces the same state: nothing here reads the clock, and message
/// timestamps come from the events themselves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunState {
    pub thread_id: Option<ThreadId>,
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub current_step: Option<String>,
    /// Finalized messages.
    pub messages: Vec<Message>,
    pub streaming: Option<StreamingMessage>,
    /// Tool calls of the current run, in the order they started.
    pub tool_calls: Vec<ToolCallProgress>,
    pub state: Value,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an ordered log into a fresh state.
    pub fn fold<'a>(envelopes: impl IntoIterator<Item = &'a EventEnvelope>) -> Self {
        let mut state = Self::new();
        for envelope in envelopes {
            state.apply(envelope);
        }
        state
    }

    pub fn tool_call(&self, id: &ToolCallId) -> Option<&ToolCallProgress> {
        self.tool_calls.iter().find(|c| &c.id == id)
    }

    /// Text of the last finalized assistant message.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Apply one event. After RUN_FINISHED or RUN_ERROR only a new
    /// RUN_STARTED is accepted.
    pub fn apply(&mut self, envelope: &EventEnvelope) {
        let event = &envelope.event;
        if self.status.is_terminal() && !matches!(event, ProtocolEvent::RunStarted) {
            debug!(event = event.event_type(), "ignoring event after terminal state");
            return;
        }

        match event {
            ProtocolEvent::RunStarted => {
                self.thread_id = Some(envelope.thread_id.clone());
                self.run_id = Some(envelope.run_id.clone());
                self.status = RunStatus::Running;
                self.current_step = None;
                self.streaming = None;
                self.tool_calls.clear();
            }
            ProtocolEvent::RunFinished => {
                self.status = RunStatus::Finished;
                self.current_step = None;
                self.streaming = None;
            }
            ProtocolEvent::RunError { message, code } => {
                // The transcript survives; only the unfinished placeholder goes.
                self.status = RunStatus::Error {
                    message: message.clone(),
                    code: code.clone(),
                };
                self.current_step = None;
                self.streaming = None;
            }
            ProtocolEvent::StepStarted { step_name } => {
                self.current_step = Some(step_name.clone());
            }
            ProtocolEvent::StepFinished { .. } => {
                self.current_step = None;
            }

            ProtocolEvent::TextMessageStart { message_id, role } => {
                self.streaming = Some(StreamingMessage {
                    id: message_id.clone(),
                    role: *role,
                    content: String::new(),
                    started_at: envelope.timestamp,
                });
            }
            ProtocolEvent::TextMessageContent { message_id, delta } => match &mut self.streaming {
                Some(msg) if &msg.id == message_id => msg.content.push_str(delta),
                _ => warn!(message_id = %message_id, "content for a message that is not streaming"),
            },
            ProtocolEvent::TextMessageEnd { message_id } => {
                if self.streaming.as_ref().map(|m| &m.id) != Some(message_id) {
                    warn!(message_id = %message_id, "end for a message that is not streaming");
                    return;
                }
                let Some(msg) = self.streaming.take() else {
                    return;
                };
                let tool_calls = self
                    .tool_calls
                    .iter()
                    .filter(|c| c.parent_message_id.as_ref() == Some(&msg.id))
                    .map(|c| ToolCallRef {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect();
                self.messages.push(Message {
                    id: msg.id,
                    role: msg.role,
                    content: msg.content,
                    tool_calls,
                    tool_call_id: None,
                    created_at: msg.started_at,
                });
            }

            ProtocolEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id,
            } => {
                self.tool_calls.push(ToolCallProgress {
                    id: tool_call_id.clone(),
                    name: tool_call_name.clone(),
                    arguments: String::new(),
                    parent_message_id: parent_message_id.clone(),
                    status: ToolCallStatus::Pending,
                    result: None,
                });
            }
            ProtocolEvent::ToolCallArgs { tool_call_id, delta } => {
                match self.tool_call_mut(tool_call_id) {
                    Some(call) if call.status == ToolCallStatus::Pending => call.arguments.push_str(delta),
                    _ => warn!(tool_call_id = %tool_call_id, "arguments for a call that is not pending"),
                }
            }
            ProtocolEvent::ToolCallEnd { tool_call_id } => {
                if let Some(call) = self.tool_call_mut(tool_call_id) {
                    call.status = ToolCallStatus::Complete;
                }
            }
            ProtocolEvent::ToolCallResult {
                message_id,
                tool_call_id,
                content,
            } => {
                if let Some(call) = self.tool_call_mut(tool_call_id) {
                    call.status = ToolCallStatus::Resolved;
                    call.result = Some(content.clone());
                }
                self.messages.push(Message {
                    id: message_id.clone(),
                    role: Role::Tool,
                    content: content.clone(),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(tool_call_id.clone()),
                    created_at: envelope.timestamp,
                });
            }

            ProtocolEvent::StateSnapshot { snapshot } => {
                self.state = snapshot.clone();
            }
            ProtocolEvent::StateDelta { delta } => {
                if let Err(e) = apply_ops(&mut self.state, delta) {
                    warn!(error = %e, "state delta did not apply cleanly");
                }
            }
            ProtocolEvent::MessagesSnapshot { messages } => {
                self.messages = messages.clone();
            }
        }
    }

    fn tool_call_mut(&mut self, id: &ToolCallId) -> Option<&mut ToolCallProgress> {
        self.tool_calls.iter_mut().find(|c| &c.id == id)
    }
}
