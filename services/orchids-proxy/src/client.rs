//! Orchids agent client
//!
//! Implements `provider::Upstream` over one shared, connection-pooled
//! `reqwest::Client`. Each call mints (or reuses) a bearer token from the
//! `TokenCache`, POSTs the prompt, and decodes the event-stream body line by
//! line into the caller's sink.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use orchids_auth::{TokenCache, fetch_session_token};
use provider::{EventSink, LineBuffer, ProviderError, Upstream, UpstreamCall, decode_line};
use rand::RngExt;
use serde::Serialize;
use tracing::{debug, warn};

/// Default agent endpoint
pub const DEFAULT_UPSTREAM_URL: &str =
    "https://orchids-server.calmstone-6964e08a.westeurope.azurecontainerapps.io/agent/coding-agent";

const API_VERSION: u32 = 2;

/// Build the process-wide HTTP client.
///
/// `timeout` bounds a whole call, body included, so it also caps how long a
/// single upstream stream may run.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(20)
        .build()
}

/// Request body of one agent call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentRequest<'a> {
    prompt: &'a str,
    chat_history: Vec<serde_json::Value>,
    project_id: &'a str,
    current_page: serde_json::Map<String, serde_json::Value>,
    agent_mode: &'a str,
    mode: &'static str,
    git_repo_url: &'static str,
    email: &'a str,
    chat_session_id: u32,
    user_id: &'a str,
    api_version: u32,
    model: &'a str,
}

pub struct OrchidsClient {
    http: reqwest::Client,
    upstream_url: String,
    token_endpoint: String,
    tokens: TokenCache,
}

impl OrchidsClient {
    pub fn new(
        http: reqwest::Client,
        upstream_url: String,
        token_endpoint: String,
        tokens: TokenCache,
    ) -> Self {
        Self {
            http,
            upstream_url,
            token_endpoint,
            tokens,
        }
    }

    async fn token(&self, call: &UpstreamCall) -> provider::Result<String> {
        let http = self.http.clone();
        let endpoint = self.token_endpoint.clone();
        let session = call.session.clone();
        self.tokens
            .get_or_fetch(&call.session.session_id, move || async move {
                fetch_session_token(&http, &endpoint, &session).await
            })
            .await
            .map_err(|e| ProviderError::Token(e.to_string()))
    }

    async fn call(&self, call: &UpstreamCall, sink: &mut dyn EventSink) -> provider::Result<()> {
        let token = self.token(call).await?;

        let session = &call.session;
        let body = AgentRequest {
            prompt: &call.prompt,
            chat_history: Vec::new(),
            project_id: &session.project_id,
            current_page: serde_json::Map::new(),
            agent_mode: &session.agent_mode,
            mode: "agent",
            git_repo_url: "",
            email: &session.email,
            chat_session_id: rand::rng().random_range(10_000_000..100_000_000),
            user_id: &session.user_id,
            api_version: API_VERSION,
            model: &call.model,
        };

        let response = self
            .http
            .post(&self.upstream_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("X-Orchids-Api-Version", API_VERSION.to_string())
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            if status.as_u16() == 401 || status.as_u16() == 403 {
                // The next attempt with this session must mint a fresh token.
                self.tokens.invalidate(&session.session_id).await;
                return Err(ProviderError::Unauthorized {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut lines = LineBuffer::new();
        let mut delivered = 0usize;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                warn!(delivered, error = %e, "upstream stream interrupted");
                ProviderError::Transport(e.to_string())
            })?;
            for line in lines.push(&chunk) {
                if let Some(event) = decode_line(&line) {
                    delivered += 1;
                    sink.on_event(event);
                }
            }
        }
        if let Some(event) = lines.finish().as_deref().and_then(decode_line) {
            delivered += 1;
            sink.on_event(event);
        }

        debug!(session_id = %session.session_id, delivered, "upstream stream closed");
        Ok(())
    }
}

impl Upstream for OrchidsClient {
    fn id(&self) -> &str {
        "orchids"
    }

    fn stream<'a>(
        &'a self,
        call: &'a UpstreamCall,
        sink: &'a mut dyn EventSink,
    ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
        Box::pin(self.call(call, sink))
    }
}
