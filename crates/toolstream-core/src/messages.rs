use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ToolCallId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One entry of the conversation history.
///
/// Clients may omit `id` and `createdAt`; both are filled in on arrival.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    #[serde(default = "crate::now_ms")]
    pub created_at: u64,
}

/// A tool call as recorded on the assistant message that issued it.
/// `arguments` is the raw argument text exactly as the model produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl Message {
    fn build(role: Role, content: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: crate::now_ms(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::build(Role::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::build(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(Role::Assistant, text.into())
    }

    /// Assistant message carrying a tool-call manifest. Content may be empty.
    pub fn assistant_with_tool_calls(
        id: MessageId,
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRef>,
    ) -> Self {
        Self {
            id,
            tool_calls,
            ..Self::build(Role::Assistant, text.into())
        }
    }

    pub fn tool_result(tool_call_id: ToolCallId, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id),
            ..Self::build(Role::Tool, text.into())
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
