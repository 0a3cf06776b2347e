//! HTTP request handling
//!
//! Decodes client requests, hands them to the orchestrator and renders the
//! outcome: a JSON body for buffered requests, server-sent events for
//! streaming ones. Claude streams use named events; OpenAI streams use
//! data-only chunks terminated by `[DONE]`.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use tracing::{instrument, warn};

use crate::error::Error;
use crate::metrics;
use crate::openai::{ChatCompletion, ChatRequest, ChunkConverter};
use crate::orchestrator::{EventStream, Orchestrator, Outcome};
use crate::protocol::MessagesRequest;

/// Shared state passed to the handlers via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Arc<Orchestrator>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Claude-style error body: {"type":"error","error":{"type":..,"message":..,"request_id":..}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Counts a request as in flight until dropped. Streaming responses carry it
/// inside the body stream, so it lives until the client is done reading.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn fail(state: &ProxyState, err: Error, endpoint: &str, started: Instant, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    let status = err.status();
    warn!(error = %err, status = status.as_u16(), "request failed");
    metrics::record_request(status.as_u16(), endpoint, started.elapsed().as_secs_f64());
    error_response(status, err.error_type(), &err.to_string(), request_id)
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// `POST /v1/messages`
#[instrument(skip_all, fields(request_id = %request_id, endpoint = "messages"))]
pub async fn handle_messages(state: &ProxyState, body: Bytes, request_id: String) -> Response {
    const ENDPOINT: &str = "messages";
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard::new(&state.in_flight);

    let request: MessagesRequest = match decode(&body) {
        Ok(r) => r,
        Err(e) => return fail(state, e, ENDPOINT, started, &request_id),
    };

    let response = match state.orchestrator.run(request, &request_id).await {
        Ok(Outcome::Stream(events)) => claude_stream(events, guard),
        Ok(Outcome::Message(message)) => Json(message).into_response(),
        Err(e) => return fail(state, e, ENDPOINT, started, &request_id),
    };
    metrics::record_request(200, ENDPOINT, started.elapsed().as_secs_f64());
    response
}

/// `POST /v1/chat/completions` and its alias
#[instrument(skip_all, fields(request_id = %request_id, endpoint = "chat_completions"))]
pub async fn handle_chat_completions(
    state: &ProxyState,
    body: Bytes,
    request_id: String,
) -> Response {
    const ENDPOINT: &str = "chat_completions";
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard::new(&state.in_flight);

    let chat: ChatRequest = match decode(&body) {
        Ok(r) => r,
        Err(e) => return fail(state, e, ENDPOINT, started, &request_id),
    };
    let model = chat.model.clone();
    let request = chat.into_messages_request();

    let response = match state.orchestrator.run(request, &request_id).await {
        Ok(Outcome::Stream(events)) => openai_stream(events, model, guard),
        Ok(Outcome::Message(message)) => {
            Json(ChatCompletion::from_message(message, model)).into_response()
        }
        Err(e) => return fail(state, e, ENDPOINT, started, &request_id),
    };
    metrics::record_request(200, ENDPOINT, started.elapsed().as_secs_f64());
    response
}

fn claude_stream(events: EventStream, guard: InFlightGuard) -> Response {
    let frames = stream::unfold((events, guard), |(mut events, guard)| async move {
        let event = events.next().await?;
        let frame = Event::default().event(event.name()).json_data(&event);
        Some((frame, (events, guard)))
    });
    Sse::new(frames).into_response()
}

fn openai_stream(events: EventStream, model: String, guard: InFlightGuard) -> Response {
    let converter = ChunkConverter::new(model);
    let frames = stream::unfold(
        Some((events, converter, guard)),
        |state| async move {
            let (mut events, mut converter, guard) = state?;
            loop {
                let Some(event) = events.next().await else {
                    let done = Ok::<_, Infallible>(Event::default().data("[DONE]"));
                    return Some((done, None));
                };
                if let Some(chunk) = converter.convert(&event) {
                    let frame = Event::default().data(chunk.to_string());
                    return Some((Ok(frame), Some((events, converter, guard))));
                }
            }
        },
    );
    Sse::new(frames).into_response()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;

    use orchids_pool::{Account, AccountKeeper};
    use provider::{EventSink, Upstream, UpstreamCall, UpstreamEvent};

    /// Answers every call with the same event script.
    pub(crate) struct FixedUpstream(pub Vec<UpstreamEvent>);

    impl Upstream for FixedUpstream {
        fn id(&self) -> &str {
            "fixed"
        }

        fn stream<'a>(
            &'a self,
            _call: &'a UpstreamCall,
            sink: &'a mut dyn EventSink,
        ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.0.iter().cloned().for_each(|e| sink.on_event(e));
                Ok(())
            })
        }
    }

    pub(crate) fn static_account() -> Account {
        serde_json::from_value(serde_json::json!({
            "id": 0,
            "session_id": "sess_static",
            "client_cookie": "cookie",
        }))
        .unwrap()
    }

    pub(crate) fn hello_events() -> Vec<UpstreamEvent> {
        vec![
            UpstreamEvent::TextStart,
            UpstreamEvent::TextDelta {
                delta: "Hello".into(),
            },
            UpstreamEvent::TextEnd,
            UpstreamEvent::Finish {
                finish_reason: Some("stop".into()),
            },
        ]
    }

    pub(crate) fn test_state(events: Vec<UpstreamEvent>, with_account: bool) -> ProxyState {
        let mut orchestrator = Orchestrator::new(
            Arc::new(FixedUpstream(events)),
            Arc::new(AccountKeeper::new()),
        );
        if with_account {
            orchestrator = orchestrator.with_static_account(static_account());
        }
        ProxyState {
            orchestrator: Arc::new(orchestrator),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn error_response_has_claude_shape() {
        let resp = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            "no accounts available",
            "req_abc123",
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "overloaded_error");
        assert_eq!(json["error"]["request_id"], "req_abc123");
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        let guard = InFlightGuard::new(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn buffered_message_is_json() {
        let state = test_state(hello_events(), true);
        let body = Bytes::from_static(
            br#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let resp = handle_messages(&state, body, "req_1".into()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["stop_reason"], "end_turn");
        assert_eq!(json["content"][0]["text"], "Hello");
        assert_eq!(state.requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(state.in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn streamed_message_uses_named_events() {
        let state = test_state(hello_events(), true);
        let body = Bytes::from_static(
            br#"{"model":"claude-sonnet-4-5","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let resp = handle_messages(&state, body, "req_2".into()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[axum::http::header::CONTENT_TYPE],
            "text/event-stream"
        );

        let text = body_string(resp).await;
        let names: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(text.contains(r#""text":"Hello""#));
        assert_eq!(state.in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let state = test_state(hello_events(), true);
        let resp = handle_messages(&state, Bytes::from_static(b"{not json"), "req_3".into()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(state.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn no_accounts_is_service_unavailable() {
        let state = test_state(hello_events(), false);
        let body = Bytes::from_static(br#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#);
        let resp = handle_messages(&state, body, "req_4".into()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn chat_completion_buffered() {
        let state = test_state(hello_events(), true);
        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}]}"#,
        );
        let resp = handle_chat_completions(&state, body, "req_5".into()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn chat_completion_stream_ends_with_done() {
        let state = test_state(hello_events(), true);
        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let resp = handle_chat_completions(&state, body, "req_6".into()).await;
        let text = body_string(resp).await;
        let data: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();

        assert_eq!(data.last(), Some(&"[DONE]"));
        assert!(!text.contains("event: "));
        let chunks: Vec<serde_json::Value> = data[..data.len() - 1]
            .iter()
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert!(chunks.iter().any(|c| c["choices"][0]["delta"]["content"] == "Hello"));
        assert_eq!(
            chunks.last().unwrap()["choices"][0]["finish_reason"],
            "stop"
        );
    }
}
