//! Prompt builder
//!
//! The upstream agent accepts a single text prompt, so the whole Messages
//! request is flattened into tagged sections:
//!
//! 1. `<client_system>` with the client's system text, if any
//! 2. `<proxy_instructions>` explaining the tag conventions below
//! 3. `<available_tools>` with one `- name: description` line per tool
//! 4. `<conversation_history>` with one `<turn>` per prior message
//! 5. `<user_request>` holding the trailing user turn
//!
//! Building is pure: the same request always yields the same prompt.

use std::borrow::Cow;

use serde_json::Value;

use crate::protocol::{ContentBlock, ImageSource, Message, MessageContent, SystemBlock, Tool};

const PROXY_PRESET: &str = "You are an AI coding assistant.

## Conversation history layout
- <turn index=\"N\" role=\"user|assistant\"> wraps one earlier turn
- <tool_use id=\"...\" name=\"...\"> is a tool invocation with its JSON input
- <tool_result tool_use_id=\"...\"> is the output of that invocation
- [IMAGE: format] marks an image the user attached
- <user_request> is the message to answer now

## Rules
1. Rely only on the listed tools and the history above
2. The user works in their own local environment
3. Keep replies concise and professional
4. Emit tool calls with well-formed JSON arguments";

/// Placeholder for a current turn with no text.
pub const EMPTY_TURN: &str = "Continue.";

/// Conversations longer than this are condensed before building.
pub const SUMMARIZE_THRESHOLD: usize = 50;
/// Messages kept verbatim when condensing.
pub const KEEP_RECENT: usize = 10;
const SUMMARY_CHARS_PER_MESSAGE: usize = 200;

/// Collapse all but the most recent messages into one synthetic user turn.
///
/// Returns the input unchanged at or below `SUMMARIZE_THRESHOLD` messages.
pub fn summarize(messages: &[Message]) -> Cow<'_, [Message]> {
    if messages.len() <= SUMMARIZE_THRESHOLD {
        return Cow::Borrowed(messages);
    }

    let (older, kept) = messages.split_at(messages.len() - KEEP_RECENT);
    let lines: Vec<String> = older
        .iter()
        .filter_map(|msg| {
            let text = plain_text(&msg.content);
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            Some(format!("[{}]: {}", msg.role, truncate_chars(text)))
        })
        .collect();

    let mut condensed = Vec::with_capacity(kept.len() + 1);
    if !lines.is_empty() {
        condensed.push(Message::text(
            "user",
            format!("Earlier conversation summary:\n{}", lines.join("\n")),
        ));
    }
    condensed.extend_from_slice(kept);
    Cow::Owned(condensed)
}

fn plain_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn truncate_chars(text: &str) -> Cow<'_, str> {
    match text.char_indices().nth(SUMMARY_CHARS_PER_MESSAGE) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

/// Build the upstream prompt for one request.
pub fn build_prompt(system: &[SystemBlock], messages: &[Message], tools: &[Tool]) -> String {
    let mut sections = Vec::with_capacity(5);

    let client_system: Vec<&str> = system
        .iter()
        .filter(|block| block.kind == "text" && !block.text.is_empty())
        .map(|block| block.text.as_str())
        .collect();
    if !client_system.is_empty() {
        sections.push(tagged("client_system", &client_system.join("\n\n")));
    }

    sections.push(tagged("proxy_instructions", PROXY_PRESET));

    let catalog = render_tools(tools);
    if !catalog.is_empty() {
        sections.push(tagged("available_tools", &catalog));
    }

    let (history, current) = match messages.split_last() {
        Some((last, rest)) if last.role == "user" => (rest, Some(last)),
        _ => (messages, None),
    };

    let history = render_history(history);
    if !history.is_empty() {
        sections.push(tagged("conversation_history", &history));
    }

    let mut request = current.map(render_current_turn).unwrap_or_default();
    if request.trim().is_empty() {
        request = EMPTY_TURN.to_string();
    }
    sections.push(tagged("user_request", &request));

    sections.join("\n\n")
}

fn tagged(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{body}\n</{tag}>")
}

fn render_tools(tools: &[Tool]) -> String {
    tools
        .iter()
        .filter(|tool| !tool.name.is_empty())
        .map(|tool| {
            if tool.description.is_empty() {
                format!("- {}", tool.name)
            } else {
                format!("- {}: {}", tool.name, tool.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_history(messages: &[Message]) -> String {
    let mut turns = Vec::new();
    let mut index = 1;
    for msg in messages {
        if msg.role != "user" && msg.role != "assistant" {
            continue;
        }
        let body = render_content(&msg.content);
        if body.is_empty() {
            continue;
        }
        turns.push(format!(
            "<turn index=\"{index}\" role=\"{}\">\n{body}\n</turn>",
            msg.role
        ));
        index += 1;
    }
    turns.join("\n\n")
}

fn render_content(content: &MessageContent) -> String {
    let blocks = match content {
        MessageContent::Text(text) => return text.trim().to_string(),
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            ContentBlock::Image { source } => {
                parts.push(format!("[IMAGE: {}]", image_format(source)));
            }
            ContentBlock::ToolUse { id, name, input } => {
                parts.push(format!(
                    "<tool_use id=\"{id}\" name=\"{name}\">\n{input}\n</tool_use>"
                ));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let error_attr = if *is_error { " is_error=\"true\"" } else { "" };
                parts.push(format!(
                    "<tool_result tool_use_id=\"{tool_use_id}\"{error_attr}>\n{}\n</tool_result>",
                    flatten_tool_result(content.as_ref())
                ));
            }
            ContentBlock::Thinking { .. } | ContentBlock::Unknown => {}
        }
    }
    parts.join("\n")
}

fn render_current_turn(msg: &Message) -> String {
    let mut request = render_content(&msg.content);

    // Binary image data never goes upstream, only its format and decoded size.
    if let MessageContent::Blocks(blocks) = &msg.content {
        let placeholders: Vec<String> = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Image { source }
                    if source.kind == "base64" && !source.data.is_empty() =>
                {
                    Some(format!(
                        "[IMAGE: {}, size={} bytes]",
                        image_format(source),
                        source.data.len() * 3 / 4
                    ))
                }
                _ => None,
            })
            .collect();
        if !placeholders.is_empty() {
            request.push('\n');
            request.push_str(&placeholders.join("\n"));
        }
    }
    request
}

fn image_format(source: &ImageSource) -> &str {
    source
        .media_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .filter(|subtype| !subtype.is_empty())
        .unwrap_or("png")
}

/// Best-effort text for a tool result: strings pass through, lists of
/// objects contribute their `text` fields, anything else is JSON.
fn flatten_tool_result(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                Value::Array(items.clone()).to_string()
            } else {
                texts.join("\n")
            }
        }
        Some(other) => other.to_string(),
    }
}
