//! Per-request debug hooks
//!
//! The orchestrator reports the incoming request, the built prompt, every
//! upstream event, every emitted client event and a final summary. Hooks are
//! infallible and must not block.

use std::time::Duration;

use provider::UpstreamEvent;
use serde::Serialize;
use tracing::{debug, trace};

use crate::protocol::{MessagesRequest, StreamEvent};

/// Outcome of one request, recorded exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub model: String,
    pub upstream_model: String,
    /// Id of the last account used; 0 for the static account
    pub account_id: Option<i64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: String,
    /// Upstream attempts made, including the successful one
    pub attempts: u32,
    pub excluded: Vec<i64>,
    #[serde(with = "millis")]
    pub duration: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

pub trait DebugSink: Send + Sync {
    fn request(&self, request: &MessagesRequest);
    fn prompt(&self, prompt: &str);
    fn upstream_event(&self, event: &UpstreamEvent);
    fn client_event(&self, event: &StreamEvent);
    fn summary(&self, summary: &RequestSummary);
}

/// Discards everything. Used unless `proxy.debug` is set.
pub struct NoopDebugSink;

impl DebugSink for NoopDebugSink {
    fn request(&self, _: &MessagesRequest) {}
    fn prompt(&self, _: &str) {}
    fn upstream_event(&self, _: &UpstreamEvent) {}
    fn client_event(&self, _: &StreamEvent) {}
    fn summary(&self, _: &RequestSummary) {}
}

/// Writes hooks as tracing events under the current request span. Payloads
/// go out at `trace`, summaries at `debug`.
pub struct TracingDebugSink;

impl DebugSink for TracingDebugSink {
    fn request(&self, request: &MessagesRequest) {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            stream = request.stream,
            "incoming request"
        );
        if let Ok(body) = serde_json::to_string(request) {
            trace!(body = %body, "request body");
        }
    }

    fn prompt(&self, prompt: &str) {
        debug!(chars = prompt.chars().count(), "built prompt");
        trace!(prompt, "prompt text");
    }

    fn upstream_event(&self, event: &UpstreamEvent) {
        trace!(kind = event.kind(), event = ?event, "upstream event");
    }

    fn client_event(&self, event: &StreamEvent) {
        if let Ok(data) = serde_json::to_string(event) {
            trace!(event = event.name(), data = %data, "client event");
        }
    }

    fn summary(&self, summary: &RequestSummary) {
        if let Ok(json) = serde_json::to_string(summary) {
            debug!(summary = %json, "request summary");
        }
    }
}
