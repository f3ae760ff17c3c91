use serde_json::{json, Value};

use toolstream_core::messages::{Message, Role};
use toolstream_core::provider::CompletionRequest;
use toolstream_core::tools::ToolDefinition;

/// Convert a round's history and tool list into a streaming
/// chat-completions request body.
pub fn build_request_body(request: &CompletionRequest, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "messages": convert_messages(&request.messages),
    });

    if !request.tools.is_empty() {
        body["tools"] = json!(convert_tools(&request.tools));
        body["tool_choice"] = json!("auto");
    }

    body
}

pub fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(convert_message).collect()
}

fn convert_message(message: &Message) -> Value {
    match message.role {
        Role::Assistant if message.has_tool_calls() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments,
                        }
                    })
                })
                .collect();
            // Text alongside tool calls is optional upstream.
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                json!(message.content)
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        role => json!({"role": role.as_str(), "content": message.content}),
    }
}

pub fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}
