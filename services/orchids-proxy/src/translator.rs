//! Upstream events to Claude Messages stream events
//!
//! The translator is a synchronous visitor: `apply` is called once per
//! upstream event, in stream order, and returns the client events to emit.
//! It owns every piece of per-request output state (block indices, the open
//! block, tool reservations, the buffered message and the output-token
//! counter), so ordering holds without locks.
//!
//! Index invariants:
//! - indices are assigned in emission order, starting at 0, without gaps
//! - a `content_block_stop` is only emitted for the currently open block
//! - at most one block is open at a time
//! - after `finish`, nothing more is emitted

use std::collections::HashMap;

use provider::UpstreamEvent;
use serde_json::{Map, Value};

use crate::protocol::{
    BlockDelta, MessageResponse, OutputUsage, ResponseBlock, StopDelta, StreamEvent, Usage,
};
use crate::tokens::tokens_for_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Events go to the client as they are produced.
    Streaming,
    /// Text and tool_use blocks are collected into one message.
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
}

#[derive(Debug)]
pub struct Translator {
    mode: Mode,
    message_id: String,
    model: String,
    usage: Usage,
    next_index: usize,
    open: Option<OpenBlock>,
    /// Indices reserved by `tool-input-start`, keyed by tool call id
    reserved: HashMap<String, usize>,
    content: Vec<ResponseBlock>,
    /// Position in `content` of the text block receiving deltas
    buffered_text: Option<usize>,
    output_chars: usize,
    stop_reason: Option<String>,
}

impl Translator {
    /// `cache_hint` adds the display-only cache usage fields.
    pub fn new(
        mode: Mode,
        message_id: String,
        model: String,
        input_tokens: u32,
        cache_hint: bool,
    ) -> Self {
        let usage = Usage {
            input_tokens,
            output_tokens: 0,
            cache_creation_input_tokens: cache_hint.then_some(0),
            cache_read_input_tokens: cache_hint.then_some(input_tokens / 10),
        };
        Self {
            mode,
            message_id,
            model,
            usage,
            next_index: 0,
            open: None,
            reserved: HashMap::new(),
            content: Vec::new(),
            buffered_text: None,
            output_chars: 0,
            stop_reason: None,
        }
    }

    pub fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageResponse {
                id: self.message_id.clone(),
                kind: "message",
                role: "assistant",
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: self.usage,
            },
        }
    }

    pub fn apply(&mut self, event: UpstreamEvent) -> Vec<StreamEvent> {
        if self.is_finished() {
            return Vec::new();
        }

        let mut out = Vec::new();
        match event {
            UpstreamEvent::ReasoningStart => {
                self.start_block(BlockKind::Thinking, &mut out);
            }
            UpstreamEvent::ReasoningDelta { delta } => {
                let index = self.ensure_open(BlockKind::Thinking, &mut out);
                if self.mode == Mode::Streaming {
                    self.output_chars += delta.chars().count();
                }
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta { thinking: delta },
                });
            }
            UpstreamEvent::ReasoningEnd => self.stop_block(BlockKind::Thinking, &mut out),
            UpstreamEvent::TextStart => {
                self.start_block(BlockKind::Text, &mut out);
            }
            UpstreamEvent::TextDelta { delta } => {
                let index = self.ensure_open(BlockKind::Text, &mut out);
                self.output_chars += delta.chars().count();
                if let Some(ResponseBlock::Text { text }) =
                    self.buffered_text.and_then(|pos| self.content.get_mut(pos))
                {
                    text.push_str(&delta);
                }
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: delta },
                });
            }
            UpstreamEvent::TextEnd => self.stop_block(BlockKind::Text, &mut out),
            UpstreamEvent::ToolInputStart { id, tool_name } => {
                if !id.is_empty() && !tool_name.is_empty() && !self.reserved.contains_key(&id) {
                    self.close_open(&mut out);
                    let index = self.allocate();
                    self.reserved.insert(id, index);
                }
            }
            UpstreamEvent::ToolInputDelta | UpstreamEvent::ToolInputEnd => {}
            UpstreamEvent::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => {
                if !tool_call_id.is_empty() {
                    self.tool_call(tool_call_id, tool_name, &input, &mut out);
                }
            }
            UpstreamEvent::Finish { finish_reason } => {
                out = self.finish_into(map_stop_reason(finish_reason.as_deref()), out);
            }
        }
        out
    }

    fn tool_call(&mut self, id: String, name: String, raw: &str, out: &mut Vec<StreamEvent>) {
        self.close_open(out);
        let index = match self.reserved.remove(&id) {
            Some(index) => index,
            None => self.allocate(),
        };

        self.output_chars += name.chars().count() + raw.chars().count();
        let repaired = repair_tool_input(raw);
        let input = serde_json::from_str(&repaired).unwrap_or_else(|_| Value::Object(Map::new()));

        if self.mode == Mode::Buffered {
            self.content.push(ResponseBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input,
            });
        }

        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseBlock::ToolUse {
                id,
                name,
                input: Value::Object(Map::new()),
            },
        });
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: repaired,
            },
        });
        out.push(StreamEvent::ContentBlockStop { index });
    }

    fn allocate(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn start_block(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) -> usize {
        self.close_open(out);
        let index = self.allocate();
        self.open = Some(OpenBlock { index, kind });

        let content_block = match kind {
            BlockKind::Thinking => ResponseBlock::Thinking {
                thinking: String::new(),
            },
            BlockKind::Text => {
                if self.mode == Mode::Buffered {
                    self.content.push(ResponseBlock::Text {
                        text: String::new(),
                    });
                    self.buffered_text = Some(self.content.len() - 1);
                }
                ResponseBlock::Text {
                    text: String::new(),
                }
            }
        };
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    /// Index of the open block of `kind`, opening one if needed. Deltas that
    /// arrive without their start event still land in a started block.
    fn ensure_open(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) -> usize {
        match self.open {
            Some(open) if open.kind == kind => open.index,
            _ => self.start_block(kind, out),
        }
    }

    fn stop_block(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) {
        if self.open.is_some_and(|open| open.kind == kind) {
            self.close_open(out);
        }
    }

    fn close_open(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open.take() {
            if open.kind == BlockKind::Text {
                self.buffered_text = None;
            }
            out.push(StreamEvent::ContentBlockStop { index: open.index });
        }
    }

    /// Drop reservations whose `tool-call` never arrived. Trailing ones give
    /// their index back so the emitted indices stay contiguous.
    fn release_reservations(&mut self) {
        let mut unused: Vec<usize> = self.reserved.drain().map(|(_, index)| index).collect();
        unused.sort_unstable_by(|a, b| b.cmp(a));
        for index in unused {
            if index + 1 == self.next_index {
                self.next_index = index;
            }
        }
    }

    /// Clean up after a failed upstream attempt so the next one starts from a
    /// consistent state.
    ///
    /// Streaming: the open block is closed, since the client already saw its
    /// start. Buffered: the partial message is discarded.
    pub fn abort_attempt(&mut self) -> Vec<StreamEvent> {
        if self.is_finished() {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_open(&mut out);
        self.release_reservations();
        if self.mode == Mode::Buffered {
            self.content.clear();
            self.output_chars = 0;
        }
        out
    }

    /// Emit the trailing `message_delta` and `message_stop`. Only the first
    /// call has any effect.
    pub fn finish(&mut self, stop_reason: &str) -> Vec<StreamEvent> {
        if self.is_finished() {
            return Vec::new();
        }
        self.finish_into(stop_reason.to_string(), Vec::new())
    }

    fn finish_into(&mut self, stop_reason: String, mut out: Vec<StreamEvent>) -> Vec<StreamEvent> {
        self.close_open(&mut out);
        self.release_reservations();
        self.stop_reason = Some(stop_reason.clone());
        out.push(StreamEvent::MessageDelta {
            delta: StopDelta {
                stop_reason,
                stop_sequence: None,
            },
            usage: OutputUsage {
                output_tokens: self.output_tokens(),
            },
        });
        out.push(StreamEvent::MessageStop);
        out
    }

    pub fn is_finished(&self) -> bool {
        self.stop_reason.is_some()
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    pub fn output_tokens(&self) -> u32 {
        tokens_for_chars(self.output_chars)
    }

    pub fn usage(&self) -> Usage {
        Usage {
            output_tokens: self.output_tokens(),
            ..self.usage
        }
    }

    /// The buffered message. Text blocks that never received text are dropped.
    pub fn into_response(self) -> MessageResponse {
        let usage = self.usage();
        let content = self
            .content
            .into_iter()
            .filter(|block| !matches!(block, ResponseBlock::Text { text } if text.is_empty()))
            .collect();
        MessageResponse {
            id: self.message_id,
            kind: "message",
            role: "assistant",
            content,
            model: self.model,
            stop_reason: Some(self.stop_reason.unwrap_or_else(|| "end_turn".to_string())),
            stop_sequence: None,
            usage,
        }
    }
}

/// Upstream finish reason to client stop reason.
pub fn map_stop_reason(finish_reason: Option<&str>) -> String {
    match finish_reason {
        Some("tool-calls") => "tool_use",
        _ => "end_turn",
    }
    .to_string()
}

/// Coerce stringly-typed top-level argument fields to the JSON types they
/// spell out.
///
/// Input that is not a JSON object is returned untouched, as is input where
/// no field changed. Empty input becomes `{}`.
pub fn repair_tool_input(raw: &str) -> String {
    if raw.is_empty() {
        return "{}".to_string();
    }
    let Ok(mut fields) = serde_json::from_str::<Map<String, Value>>(raw) else {
        return raw.to_string();
    };

    let mut changed = false;
    for value in fields.values_mut() {
        let Value::String(text) = value else {
            continue;
        };
        if let Some(coerced) = coerce(text.trim()) {
            *value = coerced;
            changed = true;
        }
    }

    if !changed {
        return raw.to_string();
    }
    serde_json::to_string(&fields).unwrap_or_else(|_| raw.to_string())
}

fn coerce(text: &str) -> Option<Value> {
    match text {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(int) = text.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(float) = text.parse::<f64>()
        && float.is_finite()
        && text.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return serde_json::Number::from_f64(float).map(Value::Number);
    }
    let bracketed = (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('{') && text.ends_with('}'));
    if bracketed {
        return serde_json::from_str(text).ok();
    }
    None
}
