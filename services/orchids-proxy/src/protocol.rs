//! Claude Messages wire types
//!
//! Request types are lenient: `system` may be a string or a block list, block
//! fields default when absent, and unknown block kinds decode to
//! `ContentBlock::Unknown` instead of failing the request. Response and stream
//! types mirror the Messages API event stream.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, deserialize_with = "system_blocks")]
    pub system: Vec<SystemBlock>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Accepted for compatibility; the upstream decides reasoning on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
}

impl MessagesRequest {
    /// Whether the client marked any system block for ephemeral caching.
    pub fn has_cache_control(&self) -> bool {
        self.system.iter().any(|block| {
            block
                .cache_control
                .as_ref()
                .is_some_and(|c| c.kind == "ephemeral")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type", default = "text_kind")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: text_kind(),
            text: text.into(),
            cache_control: None,
        }
    }
}

fn text_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

fn system_blocks<'de, D>(deserializer: D) -> Result<Vec<SystemBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Blocks(Vec<SystemBlock>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::Text(text)) if text.is_empty() => Vec::new(),
        Some(Raw::Text(text)) => vec![SystemBlock::text(text)],
        Some(Raw::Blocks(blocks)) => blocks,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Image {
        #[serde(default)]
        source: ImageSource,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

// --- responses ---

/// One assistant content block as returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Thinking { thinking: String },
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// A complete assistant message. Also the payload of `message_start`, with
/// empty content and no stop reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<ResponseBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopDelta {
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputUsage {
    pub output_tokens: u32,
}

/// Client-facing stream event. Serialized as the SSE `data` payload; `name()`
/// is the SSE `event` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: ResponseBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: StopDelta,
        usage: OutputUsage,
    },
    MessageStop,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_accepts_string_or_blocks() {
        let req: MessagesRequest =
            serde_json::from_str(r#"{"model":"m","messages":[],"system":"be brief"}"#).unwrap();
        assert_eq!(req.system, vec![SystemBlock::text("be brief")]);

        let req: MessagesRequest = serde_json::from_str(
            r#"{"model":"m","system":[{"type":"text","text":"a","cache_control":{"type":"ephemeral"}}]}"#,
        )
        .unwrap();
        assert_eq!(req.system.len(), 1);
        assert!(req.has_cache_control());

        let req: MessagesRequest = serde_json::from_str(r#"{"model":"m","system":null}"#).unwrap();
        assert!(req.system.is_empty());
        assert!(!req.has_cache_control());
    }

    #[test]
    fn content_accepts_string_or_blocks() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.content, MessageContent::Text("hi".into()));

        let msg: Message = serde_json::from_str(
            r#"{"role":"assistant","content":[
                {"type":"thinking","thinking":"hmm","signature":"sig"},
                {"type":"text","text":"ok"},
                {"type":"tool_use","id":"t1","name":"Read","input":{"path":"a"}}
            ]}"#,
        )
        .unwrap();
        let MessageContent::Blocks(blocks) = msg.content else {
            panic!("expected blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::Thinking { .. }));
        assert_eq!(blocks[1], ContentBlock::Text { text: "ok".into() });
        assert!(matches!(&blocks[2], ContentBlock::ToolUse { name, .. } if name == "Read"));
    }

    #[test]
    fn unknown_block_kinds_do_not_fail_the_request() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"document","source":{}},{"type":"text","text":"x"}]}"#,
        )
        .unwrap();
        let MessageContent::Blocks(blocks) = msg.content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks[0], ContentBlock::Unknown);
    }

    #[test]
    fn tool_result_content_is_optional() {
        let block: ContentBlock =
            serde_json::from_str(r#"{"type":"tool_result","tool_use_id":"t1"}"#).unwrap();
        assert_eq!(
            block,
            ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: None,
                is_error: false
            }
        );
    }

    #[test]
    fn stream_events_serialize_with_type_tags() {
        let event = StreamEvent::ContentBlockDelta {
            index: 2,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{}".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["index"], 2);
        assert_eq!(json["delta"]["type"], "input_json_delta");
        assert_eq!(event.name(), "content_block_delta");

        let stop = serde_json::to_value(StreamEvent::MessageStop).unwrap();
        assert_eq!(stop, serde_json::json!({"type": "message_stop"}));
    }

    #[test]
    fn usage_omits_cache_fields_when_unset() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 2,
            ..Usage::default()
        };
        let json = serde_json::to_value(usage).unwrap();
        assert!(json.get("cache_read_input_tokens").is_none());
        assert_eq!(json["input_tokens"], 10);
    }
}
