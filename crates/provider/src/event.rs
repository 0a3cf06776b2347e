//! Upstream event model and line decoding

use serde::{Deserialize, Deserializer};
use tracing::trace;

/// One decoded upstream model event, discriminated on its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamEvent {
    ReasoningStart,
    ReasoningDelta {
        #[serde(default)]
        delta: String,
    },
    ReasoningEnd,
    TextStart,
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    TextEnd,
    ToolInputStart {
        #[serde(default)]
        id: String,
        #[serde(default, rename = "toolName")]
        tool_name: String,
    },
    ToolInputDelta,
    ToolInputEnd,
    ToolCall {
        #[serde(default, rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, rename = "toolName")]
        tool_name: String,
        /// Raw argument JSON as sent by the upstream (not yet repaired)
        #[serde(default, deserialize_with = "string_or_json")]
        input: String,
    },
    Finish {
        #[serde(default, rename = "finishReason")]
        finish_reason: Option<String>,
    },
}

impl UpstreamEvent {
    /// Wire name of the event kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamEvent::ReasoningStart => "reasoning-start",
            UpstreamEvent::ReasoningDelta { .. } => "reasoning-delta",
            UpstreamEvent::ReasoningEnd => "reasoning-end",
            UpstreamEvent::TextStart => "text-start",
            UpstreamEvent::TextDelta { .. } => "text-delta",
            UpstreamEvent::TextEnd => "text-end",
            UpstreamEvent::ToolInputStart { .. } => "tool-input-start",
            UpstreamEvent::ToolInputDelta => "tool-input-delta",
            UpstreamEvent::ToolInputEnd => "tool-input-end",
            UpstreamEvent::ToolCall { .. } => "tool-call",
            UpstreamEvent::Finish { .. } => "finish",
        }
    }
}

/// Top-level stream message. Only `model` messages carry agent output.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "model")]
    Model { event: UpstreamEvent },
    #[serde(other)]
    Other,
}

/// Decode one event-stream line.
///
/// Returns `None` for non-`data:` lines, other message kinds, unknown event
/// kinds and malformed JSON. None of these abort the stream.
pub fn decode_line(line: &str) -> Option<UpstreamEvent> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Envelope>(payload) {
        Ok(Envelope::Model { event }) => Some(event),
        Ok(Envelope::Other) => None,
        Err(e) => {
            trace!(error = %e, "skipping undecodable upstream line");
            None
        }
    }
}

/// Tool input arrives as a JSON string; tolerate an inline object as well.
fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}
