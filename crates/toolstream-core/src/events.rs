use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, RunId, ThreadId, ToolCallId};
use crate::messages::{Message, Role};
use crate::state::StateOp;

/// The fixed event vocabulary streamed to clients. Strict ordering contract
/// for one run:
///
/// RunStarted → (StepStarted → (TextMessage* | ToolCall* | State*)* → StepFinished)*
///            → RunFinished | RunError
///
/// RunError is terminal from any point. ToolCallStart precedes every
/// ToolCallArgs/ToolCallEnd for the same id, and TextMessageStart/Content/End
/// bracket exactly one message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolEvent {
    RunStarted,
    RunFinished,
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepStarted { step_name: String },
    #[serde(rename_all = "camelCase")]
    StepFinished { step_name: String },

    #[serde(rename_all = "camelCase")]
    TextMessageStart { message_id: MessageId, role: Role },
    #[serde(rename_all = "camelCase")]
    TextMessageContent { message_id: MessageId, delta: String },
    #[serde(rename_all = "camelCase")]
    TextMessageEnd { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: ToolCallId,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallArgs { tool_call_id: ToolCallId, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call_id: ToolCallId },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        message_id: MessageId,
        tool_call_id: ToolCallId,
        content: String,
    },

    StateSnapshot { snapshot: Value },
    StateDelta { delta: Vec<StateOp> },
    MessagesSnapshot { messages: Vec<Message> },
}

impl ProtocolEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::RunFinished => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
            Self::StepStarted { .. } => "STEP_STARTED",
            Self::StepFinished { .. } => "STEP_FINISHED",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Self::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Self::StateDelta { .. } => "STATE_DELTA",
            Self::MessagesSnapshot { .. } => "MESSAGES_SNAPSHOT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished | Self::RunError { .. })
    }

    pub fn run_error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::RunError {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// Correlation ids for one run, generated once per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunContext {
    pub thread_id: ThreadId,
    pub run_id: RunId,
}

impl RunContext {
    pub fn new(thread_id: Option<ThreadId>, run_id: Option<RunId>) -> Self {
        Self {
            thread_id: thread_id.unwrap_or_default(),
            run_id: run_id.unwrap_or_default(),
        }
    }

    /// Wrap an event with this run's ids and the current time.
    pub fn stamp(&self, event: ProtocolEvent) -> EventEnvelope {
        EventEnvelope {
            event,
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            timestamp: crate::now_ms(),
        }
    }
}

/// One framed record on the downstream stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: ProtocolEvent,
    pub thread_id: ThreadId,
    pub run_id: RunId,
    pub timestamp: u64,
}

impl EventEnvelope {
    /// Serialize as a single `data: <json>\n\n` frame.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
