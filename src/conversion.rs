//! OpenResponses <-> Chat Completions translation.
//!
//! The gateway's upstreams all speak Chat Completions; `/v1/responses` is a
//! client-facing dialect. Requests are lowered to chat form before routing
//! and the chat result is lifted back into response items afterwards. The
//! streaming direction lives in `stream_events`.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::chat;
use crate::models::responses as resp;

pub fn new_response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

fn new_function_call_id() -> String {
    format!("fc_{}", Uuid::new_v4().simple())
}

/// Normalize the request `input` into item form. A bare string is shorthand
/// for a single user message with one `input_text` part; message items with
/// string content get the same expansion.
pub fn normalize_input(input: &resp::InputPayload) -> Vec<resp::InputItem> {
    match input {
        resp::InputPayload::Text(text) => vec![resp::InputItem::Message {
            role: "user".to_string(),
            content: resp::MessageContent::Parts(vec![resp::ContentPart::InputText {
                text: text.clone(),
            }]),
        }],
        resp::InputPayload::Items(items) => items
            .iter()
            .map(|item| match item {
                resp::InputItem::Message {
                    role,
                    content: resp::MessageContent::Text(text),
                } => resp::InputItem::Message {
                    role: role.clone(),
                    content: resp::MessageContent::Parts(vec![resp::ContentPart::InputText {
                        text: text.clone(),
                    }]),
                },
                other => other.clone(),
            })
            .collect(),
    }
}

fn message_text(content: &resp::MessageContent) -> String {
    match content {
        resp::MessageContent::Text(text) => text.clone(),
        resp::MessageContent::Parts(parts) => {
            // Image parts carry no text; they are dropped from the
            // concatenation. TODO: forward input_image parts as multimodal
            // content for providers that accept it.
            let mut out = String::new();
            for part in parts {
                if let resp::ContentPart::InputText { text } = part {
                    out.push_str(text);
                }
            }
            out
        }
    }
}

fn role_for_chat(role: &str) -> chat::Role {
    match role {
        "system" => chat::Role::System,
        "assistant" => chat::Role::Assistant,
        "tool" => chat::Role::Tool,
        _ => chat::Role::User,
    }
}

fn map_tool(tool: &resp::ResponsesTool) -> chat::ToolDefinition {
    match tool {
        resp::ResponsesTool::Function {
            name,
            description,
            parameters,
        } => chat::ToolDefinition::Function {
            function: chat::FunctionDef {
                name: name.clone(),
                description: description.clone(),
                parameters: parameters.clone(),
            },
        },
    }
}

/// `auto`/`none`/`required` pass through; the flat
/// `{type: function, name}` form gains the nested `function` wrapper chat
/// providers expect.
fn map_tool_choice(choice: &Value) -> Value {
    if let Some(obj) = choice.as_object() {
        if obj.get("type").and_then(Value::as_str) == Some("function") {
            if let Some(name) = obj.get("name").and_then(Value::as_str) {
                return json!({"type": "function", "function": {"name": name}});
            }
        }
    }
    choice.clone()
}

/// Lower a responses request to chat form. `input` is passed separately so
/// the caller can splice in a prior conversation first.
pub fn to_chat_request(
    request: &resp::ResponsesRequest,
    input: &[resp::InputItem],
) -> chat::ChatCompletionRequest {
    let mut messages = Vec::with_capacity(input.len() + 1);

    if let Some(instructions) = request.instructions.as_deref() {
        if !instructions.is_empty() {
            messages.push(chat::ChatMessage::text(chat::Role::System, instructions));
        }
    }

    for item in input {
        match item {
            resp::InputItem::Message { role, content } => {
                messages.push(chat::ChatMessage::text(
                    role_for_chat(role),
                    message_text(content),
                ));
            }
            resp::InputItem::FunctionCallOutput { call_id, output } => {
                messages.push(chat::ChatMessage {
                    role: chat::Role::Tool,
                    content: Value::String(output.clone()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                });
            }
        }
    }

    chat::ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_output_tokens,
        stream: request.stream,
        stop: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
        tools: request
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(map_tool).collect()),
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
        provider: request.provider.clone(),
        cache: request.cache,
        extra: serde_json::Map::new(),
    }
}

fn map_usage(usage: &chat::ChatUsage) -> resp::ResponsesUsage {
    resp::ResponsesUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

/// Lift a unary chat response into response items. Within each choice the
/// tool-call items come before the message item, and `call_id`/`arguments`
/// are carried byte-for-byte.
pub fn from_chat_response(chat_response: &chat::ChatCompletionResponse) -> resp::ResponsesResponse {
    let mut output = Vec::new();

    for choice in &chat_response.choices {
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                output.push(resp::OutputItem::FunctionCall {
                    id: new_function_call_id(),
                    name: call.function.name.clone(),
                    call_id: call.id.clone(),
                    arguments: call.function.arguments.clone(),
                    status: resp::ItemStatus::Completed,
                });
            }
        }

        if let Some(content) = choice.message.content.as_deref() {
            if !content.is_empty() {
                output.push(resp::OutputItem::Message {
                    id: new_message_id(),
                    role: "assistant".to_string(),
                    status: resp::ItemStatus::Completed,
                    content: vec![resp::OutputContent::OutputText {
                        text: content.to_string(),
                        annotations: Vec::new(),
                    }],
                });
            }
        }
    }

    resp::ResponsesResponse {
        id: new_response_id(),
        object: "response".to_string(),
        status: resp::ResponseStatus::Completed,
        output,
        error: None,
        usage: chat_response.usage.as_ref().map(map_usage),
        model: chat_response.model.clone(),
        created_at: chat_response.created,
        provider: chat_response.provider.clone(),
        cached: chat_response.cached,
    }
}
