use async_trait::async_trait;
use serde_json::{json, Value};

use toolstream_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use super::field_pointer;

/// Returns the shared state, or one field of it, as JSON text.
pub struct ReadStateTool;

#[async_trait]
impl Tool for ReadStateTool {
    fn name(&self) -> &str {
        "read_state"
    }

    fn description(&self) -> &str {
        "Read the shared state, or a single field of it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Optional field name; dots address nested fields"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let value = match args["field"].as_str().filter(|f| !f.is_empty()) {
            Some(field) => ctx
                .state
                .pointer(&field_pointer(field))
                .ok_or_else(|| ToolError::failed(format!("no field {field} in state")))?,
            None => &ctx.state,
        };
        Ok(ToolOutput::text(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use toolstream_core::ids::{RunId, ThreadId, ToolCallId};

    fn ctx(state: Value) -> ToolContext {
        ToolContext {
            thread_id: ThreadId::new(),
            run_id: RunId::new(),
            tool_call_id: ToolCallId::new(),
            state,
            abort_signal: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn whole_state() {
        let out = ReadStateTool
            .execute(json!({}), &ctx(json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out.content, r#"{"a":1}"#);
        assert!(out.state_ops.is_empty());
    }

    #[tokio::test]
    async fn nested_field() {
        let state = json!({"proposal": {"score": 7}});
        let out = ReadStateTool
            .execute(json!({"field": "proposal.score"}), &ctx(state))
            .await
            .unwrap();
        assert_eq!(out.content, "7");
    }

    #[tokio::test]
    async fn missing_field_fails() {
        let err = ReadStateTool
            .execute(json!({"field": "nope"}), &ctx(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no field nope in state");
    }
}
