use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, ThreadId, ToolCallId};
use crate::state::StateOp;

/// Context available to tools during execution.
pub struct ToolContext {
    pub thread_id: ThreadId,
    pub run_id: RunId,
    pub tool_call_id: ToolCallId,
    /// Shared state as it stood when the call was dispatched.
    pub state: Value,
    pub abort_signal: CancellationToken,
}

/// What a handler hands back: the result text recorded in history, plus any
/// shared-state operations to apply and publish as STATE_DELTA.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub state_ops: Vec<StateOp>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            state_ops: Vec::new(),
        }
    }

    pub fn with_state_ops(mut self, ops: Vec<StateOp>) -> Self {
        self.state_ops = ops;
        self
    }
}

/// Tool definition surfaced to the model for function calling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-Schema-like parameter spec (`type`, `properties`, `required`).
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Handler failures. The display text is what ends up after
/// `Error executing <name>: ` in the tool's result message.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

/// A tool backed by a plain `(args) -> string` async function. This is how
/// external handlers are plugged into the registry.
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    /// Resolves to `ToolError::Cancelled` as soon as the run is aborted.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::select! {
            biased;
            _ = ctx.abort_signal.cancelled() => Err(ToolError::Cancelled),
            result = (self.handler)(args) => result.map(ToolOutput::text),
        }
    }
}
