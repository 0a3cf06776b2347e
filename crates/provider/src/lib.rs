//! Upstream agent abstraction
//!
//! Defines the seam between the request orchestrator and the upstream agent
//! service. The orchestrator never touches HTTP directly: it hands an
//! `UpstreamCall` to an `Upstream` implementation and receives decoded
//! `UpstreamEvent`s through an `EventSink`, one synchronous callback per event.
//!
//! Stream decoding:
//! 1. Raw bytes are split into lines by `LineBuffer` (tolerates chunk boundaries
//!    inside multi-byte characters and `\r\n` endings)
//! 2. `decode_line` keeps `data:` lines whose JSON envelope is a model event
//! 3. Everything else (keep-alives, unknown kinds, malformed JSON) is skipped

pub mod event;
pub mod sse;

pub use event::{UpstreamEvent, decode_line};
pub use sse::LineBuffer;

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Routing identifiers of one account, everything the upstream needs to
/// authenticate and attribute a call.
#[derive(Debug, Clone)]
pub struct Session {
    /// Identity-provider session; also the token cache key
    pub session_id: String,
    pub client_cookie: Secret<String>,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub agent_mode: String,
    pub email: String,
}

/// One upstream attempt: the rendered prompt, the internal model tier and the
/// account it is routed through.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub prompt: String,
    pub model: String,
    pub session: Session,
}

/// Errors from a single upstream attempt. Every variant counts as an attempt
/// failure; the caller owns retry and failover.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("token fetch failed: {0}")]
    Token(String),

    #[error("upstream rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether the bearer token was rejected (401/403).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::Unauthorized { .. })
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Token(_) => "token",
            ProviderError::Unauthorized { .. } => "unauthorized",
            ProviderError::Status { .. } => "status",
            ProviderError::Transport(_) => "transport",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Receives decoded upstream events in stream order.
///
/// Implementations must not block: the callback runs inline with the read
/// loop of the upstream response.
pub trait EventSink: Send {
    fn on_event(&mut self, event: UpstreamEvent);
}

impl EventSink for Vec<UpstreamEvent> {
    fn on_event(&mut self, event: UpstreamEvent) {
        self.push(event);
    }
}

/// A streaming upstream agent.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
/// Dropping the returned future aborts the call mid-read.
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "orchids")
    fn id(&self) -> &str;

    /// Issue one call and feed every recognized event to `sink`.
    ///
    /// Returns `Ok(())` once the upstream closes the stream, whether or not a
    /// `finish` event was seen.
    fn stream<'a>(
        &'a self,
        call: &'a UpstreamCall,
        sink: &'a mut dyn EventSink,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
