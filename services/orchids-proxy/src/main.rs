//! Orchids Proxy
//!
//! Single-binary Rust service that:
//! 1. Accepts Claude Messages and OpenAI Chat Completions requests
//! 2. Picks a pooled orchids account (or the static fallback account)
//! 3. Renders the conversation as one agent prompt and streams the upstream call
//! 4. Translates upstream events back into the client's protocol, failing over
//!    to another account when an attempt fails

mod client;
mod config;
mod debug_log;
mod error;
mod metrics;
mod models;
mod openai;
mod orchestrator;
mod prompt;
mod protocol;
mod proxy;
mod retry;
mod tokens;
mod translator;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use orchids_auth::TokenCache;
use orchids_pool::{AccountKeeper, FileStore, Pool};

use crate::client::OrchidsClient;
use crate::config::{Config, StaticAccountConfig};
use crate::debug_log::TracingDebugSink;
use crate::metrics::ServiceMetrics;
use crate::orchestrator::Orchestrator;
use crate::proxy::ProxyState;

/// How long in-flight requests may take to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Conversations with inline images get large
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    pool: Option<Arc<Pool>>,
    has_static_account: bool,
    keeper: Arc<AccountKeeper>,
    tokens: TokenCache,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat-stream", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting orchids-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.upstream.url,
        pool = config.pool.is_some(),
        static_account = config.static_account.is_some(),
        debug = config.proxy.debug,
        "configuration loaded"
    );

    let http = client::build_http_client(Duration::from_secs(config.proxy.timeout_secs))
        .context("failed to build HTTP client")?;

    let tokens = TokenCache::new(config.token_cache.settings());
    let mut tasks = vec![orchids_auth::spawn_sweep_task(
        tokens.clone(),
        Duration::from_secs(config.token_cache.sweep_interval_secs),
    )];

    let upstream = Arc::new(OrchidsClient::new(
        http,
        config.upstream.url.clone(),
        config.upstream.token_endpoint.clone(),
        tokens.clone(),
    ));
    let keeper = Arc::new(AccountKeeper::new());
    let mut orchestrator =
        Orchestrator::new(upstream, Arc::clone(&keeper)).with_retry(config.retry.policy());

    let pool = match &config.pool {
        Some(pool_config) => {
            let store = FileStore::load(pool_config.accounts_file.clone())
                .await
                .with_context(|| {
                    format!(
                        "failed to open accounts file {}",
                        pool_config.accounts_file.display()
                    )
                })?;
            let refresh_interval = Duration::from_secs(pool_config.refresh_interval_secs);
            let pool = Arc::new(Pool::new(Arc::new(store), refresh_interval));
            match pool.refresh().await {
                Ok(accounts) => info!(accounts, "account pool loaded"),
                Err(e) => warn!(error = %e, "initial account refresh failed"),
            }
            tasks.push(orchids_pool::spawn_refresh_task(
                Arc::clone(&pool),
                refresh_interval,
            ));
            tasks.push(orchids_pool::spawn_flush_task(
                Arc::clone(&pool),
                Duration::from_secs(pool_config.flush_interval_secs),
            ));
            orchestrator = orchestrator.with_pool(Arc::clone(&pool));
            Some(pool)
        }
        None => None,
    };

    let static_account = config
        .static_account
        .as_ref()
        .and_then(StaticAccountConfig::to_account);
    let has_static_account = static_account.is_some();
    if let Some(account) = static_account {
        orchestrator = orchestrator.with_static_account(account);
    }
    if config.proxy.debug {
        orchestrator = orchestrator.with_debug_sink(Arc::new(TracingDebugSink));
    }

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        orchestrator: Arc::new(orchestrator),
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        pool: pool.clone(),
        has_static_account,
        keeper,
        tokens,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    for task in &tasks {
        task.abort();
    }
    // Counters queued since the last tick would otherwise be lost
    if let Some(pool) = pool {
        let written = pool.flush().await;
        info!(accounts = written, "final counter flush");
    }

    info!("shutdown complete");
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn messages_handler(State(state): State<AppState>, body: Bytes) -> Response {
    proxy::handle_messages(&state.proxy, body, new_request_id()).await
}

async fn chat_completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    proxy::handle_chat_completions(&state.proxy, body, new_request_id()).await
}

async fn models_handler() -> impl IntoResponse {
    axum::Json(models::catalog())
}

/// Health endpoint: uptime, request totals, pool summary, per-account keeper
/// status and token cache counts. Returns 503 when no account can be routed.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let in_flight = state.metrics.in_flight.load(Ordering::Relaxed);

    let pool = match &state.pool {
        Some(pool) => Some(pool.health().await),
        None => None,
    };
    let pool_has_accounts = pool
        .as_ref()
        .and_then(|p| p["accounts_enabled"].as_u64())
        .is_some_and(|n| n > 0);
    let routable = pool_has_accounts || state.has_static_account;

    let token_stats = state.tokens.stats().await;
    let body = serde_json::json!({
        "status": if routable { "healthy" } else { "degraded" },
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "in_flight": in_flight,
        "static_account": state.has_static_account,
        "pool": pool,
        "accounts": state.keeper.snapshot().await,
        "token_cache": {
            "total": token_stats.total,
            "valid": token_stats.valid,
        },
    });

    let status_code = if routable {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
