//! OpenAI Chat Completions compatibility
//!
//! Chat requests are converted to the Messages shape and run through the same
//! orchestrator. Buffered results convert back to one `chat.completion`;
//! streams convert event by event to `chat.completion.chunk` frames.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::protocol::{
    BlockDelta, ContentBlock, Message, MessageContent, MessageResponse, MessagesRequest,
    ResponseBlock, StreamEvent, SystemBlock, Tool,
};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ChatTool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatTool {
    #[serde(default)]
    pub function: Option<FunctionDef>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ChatRequest {
    pub fn into_messages_request(self) -> MessagesRequest {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for msg in self.messages {
            match msg.role.as_str() {
                "system" | "developer" => {
                    let text = content_text(msg.content.as_ref());
                    if !text.is_empty() {
                        system.push(SystemBlock::text(text));
                    }
                }
                "tool" => messages.push(Message {
                    role: "user".into(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.unwrap_or_default(),
                        content: msg.content,
                        is_error: false,
                    }]),
                }),
                "assistant" if !msg.tool_calls.is_empty() => {
                    let mut blocks = Vec::with_capacity(msg.tool_calls.len() + 1);
                    let text = content_text(msg.content.as_ref());
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text { text });
                    }
                    blocks.extend(msg.tool_calls.into_iter().map(|call| ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| Value::Object(Map::new())),
                    }));
                    messages.push(Message {
                        role: "assistant".into(),
                        content: MessageContent::Blocks(blocks),
                    });
                }
                _ => messages.push(Message {
                    role: msg.role,
                    content: convert_content(msg.content),
                }),
            }
        }

        let tools = self
            .tools
            .into_iter()
            .filter_map(|tool| tool.function)
            .map(|function| Tool {
                name: function.name,
                description: function.description,
                input_schema: function.parameters,
            })
            .collect();

        MessagesRequest {
            model: self.model,
            messages,
            system,
            tools,
            stream: self.stream,
            max_tokens: self.max_tokens,
            thinking: None,
        }
    }
}

fn convert_content(content: Option<Value>) -> MessageContent {
    match content {
        None | Some(Value::Null) => MessageContent::Text(String::new()),
        Some(Value::String(text)) => MessageContent::Text(text),
        Some(Value::Array(parts)) => MessageContent::Blocks(
            parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(|text| ContentBlock::Text {
                    text: text.to_string(),
                })
                .collect(),
        ),
        Some(other) => MessageContent::Text(other.to_string()),
    }
}

/// Plain text of a content value: strings as-is, text parts joined.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Serialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletion {
    pub fn from_message(response: MessageResponse, model: String) -> Self {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ResponseBlock::Text { text } => content.push_str(&text),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    kind: function_kind(),
                    function: FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                }),
                ResponseBlock::Thinking { .. } => {}
            }
        }

        let finish_reason = if tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        let usage = response.usage;
        Self {
            id: response.id,
            object: "chat.completion",
            created: common::unix_millis() / 1000,
            model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason,
            }],
            usage: ChatUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
            },
        }
    }
}

/// Converts Messages stream events into `chat.completion.chunk` payloads.
pub struct ChunkConverter {
    id: String,
    model: String,
    created: u64,
    /// Block index to position in `tool_calls`
    tool_slots: HashMap<usize, usize>,
}

impl ChunkConverter {
    pub fn new(model: String) -> Self {
        Self {
            id: String::new(),
            model,
            created: common::unix_millis() / 1000,
            tool_slots: HashMap::new(),
        }
    }

    /// The chunk for `event`, if it maps to one.
    pub fn convert(&mut self, event: &StreamEvent) -> Option<Value> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                Some(self.chunk(json!({"role": "assistant", "content": ""}), None))
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseBlock::ToolUse { id, name, .. },
            } => {
                let slot = self.tool_slots.len();
                self.tool_slots.insert(*index, slot);
                Some(self.chunk(
                    json!({"tool_calls": [{
                        "index": slot,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""}
                    }]}),
                    None,
                ))
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    BlockDelta::TextDelta { text } => json!({"content": text}),
                    BlockDelta::ThinkingDelta { thinking } => json!({"reasoning_content": thinking}),
                    BlockDelta::InputJsonDelta { partial_json } => {
                        let slot = *self.tool_slots.get(index)?;
                        json!({"tool_calls": [{
                            "index": slot,
                            "function": {"arguments": partial_json}
                        }]})
                    }
                };
                Some(self.chunk(delta, None))
            }
            StreamEvent::MessageDelta { delta, .. } => {
                let finish = if delta.stop_reason == "tool_use" || !self.tool_slots.is_empty() {
                    "tool_calls"
                } else {
                    "stop"
                };
                Some(self.chunk(json!({}), Some(finish)))
            }
            _ => None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}
