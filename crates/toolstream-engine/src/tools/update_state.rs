use async_trait::async_trait;
use serde_json::{json, Value};

use toolstream_core::state::StateOp;
use toolstream_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use super::field_pointer;

/// Writes one field of the run's shared state. The change reaches the
/// client as a STATE_DELTA.
pub struct UpdateStateTool;

#[async_trait]
impl Tool for UpdateStateTool {
    fn name(&self) -> &str {
        "update_state"
    }

    fn description(&self) -> &str {
        "Set one field of the shared state that is mirrored to the user's screen"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["field", "value"],
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Field name; use dots for nested fields (e.g. \"proposal.status\")"
                },
                "value": {
                    "description": "New value for the field (any JSON value)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let field = args["field"]
            .as_str()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("field is required".into()))?;
        let Some(value) = args.get("value").cloned() else {
            return Err(ToolError::InvalidArguments("value is required".into()));
        };

        let path = field_pointer(field);
        Ok(ToolOutput::text(format!("Updated {field}")).with_state_ops(vec![StateOp::replace(path, value)]))
    }
}
