//! Request orchestration
//!
//! One request runs through:
//! 1. Select an account (pool first, static account as fallback)
//! 2. Build the prompt and map the model
//! 3. Stream the upstream call through the `Translator`
//! 4. On failure, exclude the account, back off, re-select (falling back to the
//!    static account once the pool is exhausted) and retry from 3
//! 5. Finalize exactly once and record the summary
//!
//! Steps 3 to 5 run on a dedicated task. In streaming mode the caller reads
//! client events from a channel as they are produced; in buffered mode it
//! waits for the task and gets the assembled message. Either way the task is
//! aborted when the caller goes away, which drops the in-flight upstream read.
//!
//! Upstream failures never reach the caller as errors: once an account is
//! selected, the request always completes with `stop_reason: "end_turn"` at
//! worst. Only a failed initial selection is reported as `Error::NoAccounts`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use orchids_pool::{Account, AccountKeeper, Pool};
use provider::{EventSink, Upstream, UpstreamCall, UpstreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, warn};

use crate::debug_log::{DebugSink, NoopDebugSink, RequestSummary};
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::map_model;
use crate::prompt::{build_prompt, summarize};
use crate::protocol::{MessageResponse, MessagesRequest, StreamEvent};
use crate::retry::{RetryAction, RetryPolicy, RetryState};
use crate::tokens::estimate_tokens;
use crate::translator::{Mode, Translator};

/// The account an attempt is routed through.
#[derive(Debug, Clone)]
enum Route {
    /// Selected from the pool; failures are counted and excluded
    Pooled(Account),
    /// The configured fallback; failures end the request
    Static(Account),
}

impl Route {
    fn account(&self) -> &Account {
        match self {
            Route::Pooled(account) | Route::Static(account) => account,
        }
    }
}

pub struct Orchestrator {
    pool: Option<Arc<Pool>>,
    static_account: Option<Account>,
    upstream: Arc<dyn Upstream>,
    keeper: Arc<AccountKeeper>,
    retry: RetryPolicy,
    debug: Arc<dyn DebugSink>,
}

impl Orchestrator {
    pub fn new(upstream: Arc<dyn Upstream>, keeper: Arc<AccountKeeper>) -> Self {
        Self {
            pool: None,
            static_account: None,
            upstream,
            keeper,
            retry: RetryPolicy::default(),
            debug: Arc::new(NoopDebugSink),
        }
    }

    pub fn with_pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_static_account(mut self, account: Account) -> Self {
        self.static_account = Some(account);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_debug_sink(mut self, debug: Arc<dyn DebugSink>) -> Self {
        self.debug = debug;
        self
    }

    /// Start a request. Returns once the response can begin: immediately in
    /// streaming mode, after completion in buffered mode.
    pub async fn run(self: &Arc<Self>, request: MessagesRequest, request_id: &str) -> Result<Outcome> {
        let started = Instant::now();
        self.debug.request(&request);

        let route = self.select_initial().await?;

        let messages = summarize(&request.messages);
        if messages.len() != request.messages.len() {
            debug!(
                original = request.messages.len(),
                condensed = messages.len(),
                "conversation summarized"
            );
        }
        let prompt = build_prompt(&request.system, &messages, &request.tools);
        self.debug.prompt(&prompt);

        let upstream_model = map_model(&request.model);
        let input_tokens = estimate_tokens(&prompt);
        let mode = if request.stream {
            Mode::Streaming
        } else {
            Mode::Buffered
        };
        let translator = Translator::new(
            mode,
            format!("msg_{}", common::unix_millis()),
            request.model.clone(),
            input_tokens,
            request.has_cache_control(),
        );

        let call = UpstreamCall {
            prompt,
            model: upstream_model.to_string(),
            session: route.account().session(),
        };
        let job = Job {
            request_id: request_id.to_string(),
            model: request.model,
            started,
        };

        let (tx, rx) = match mode {
            Mode::Streaming => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            Mode::Buffered => (None, None),
        };
        let emitter = Emitter {
            tx,
            debug: Arc::clone(&self.debug),
        };

        let this = Arc::clone(self);
        let mut task = AbortOnDrop(tokio::spawn(
            async move { this.drive(route, call, translator, emitter, job).await }
                .instrument(Span::current()),
        ));

        match rx {
            Some(rx) => Ok(Outcome::Stream(EventStream { rx, _task: task })),
            None => {
                let translator = task.join().await?;
                Ok(Outcome::Message(translator.into_response()))
            }
        }
    }

    async fn select_initial(&self) -> Result<Route> {
        if let Some(pool) = &self.pool {
            match pool.select_excluding(&HashSet::new()).await {
                Ok(account) => return Ok(Route::Pooled(account)),
                Err(e) if self.static_account.is_some() => {
                    debug!(error = %e, "pool selection failed, using static account");
                }
                Err(e) => {
                    warn!(error = %e, "no account available");
                    return Err(Error::NoAccounts);
                }
            }
        }
        self.static_account
            .clone()
            .map(Route::Static)
            .ok_or(Error::NoAccounts)
    }

    /// Attempt loop. Always finalizes the translator before returning.
    async fn drive(
        self: Arc<Self>,
        mut route: Route,
        mut call: UpstreamCall,
        mut translator: Translator,
        emitter: Emitter,
        job: Job,
    ) -> Translator {
        emitter.emit(vec![translator.message_start()]);
        let mut retry = RetryState::new(self.retry);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let account_id = route.account().id;
            let result = {
                let mut sink = TranslatingSink {
                    translator: &mut translator,
                    emitter: &emitter,
                };
                self.upstream.stream(&call, &mut sink).await
            };

            let err = match result {
                Ok(()) => {
                    if let (Route::Pooled(_), Some(pool)) = (&route, &self.pool) {
                        pool.schedule_success(account_id).await;
                        self.keeper.mark_active(account_id).await;
                    }
                    break;
                }
                Err(e) => e,
            };

            warn!(account_id, attempt = attempts, error = %err, "upstream attempt failed");
            metrics::record_upstream_error(err.kind());
            emitter.emit(translator.abort_attempt());

            let (Route::Pooled(_), Some(pool)) = (&route, &self.pool) else {
                break;
            };
            pool.schedule_failure(account_id).await;
            self.keeper.record_failure(account_id, &err.to_string()).await;
            let action = retry.on_failure(account_id);

            // The client already has a complete message.
            if translator.is_finished() {
                break;
            }

            let RetryAction::Backoff { delay } = action else {
                warn!(attempts, "retry limit reached");
                break;
            };
            metrics::record_retry();
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;

            match pool.select_excluding(retry.excluded()).await {
                Ok(next) => {
                    info!(
                        from = account_id,
                        to = next.id,
                        attempt = attempts + 1,
                        "retrying on another account"
                    );
                    call.session = next.session();
                    route = Route::Pooled(next);
                }
                Err(e) => match &self.static_account {
                    Some(fallback) => {
                        info!(
                            from = account_id,
                            error = %e,
                            attempt = attempts + 1,
                            "pool exhausted, retrying on static account"
                        );
                        call.session = fallback.session();
                        route = Route::Static(fallback.clone());
                    }
                    None => {
                        warn!(error = %e, "no account left to retry on");
                        break;
                    }
                },
            }
        }

        emitter.emit(translator.finish("end_turn"));

        let mut excluded: Vec<i64> = retry.excluded().iter().copied().collect();
        excluded.sort_unstable();
        let summary = RequestSummary {
            request_id: job.request_id,
            model: job.model,
            upstream_model: call.model,
            account_id: Some(route.account().id),
            input_tokens: translator.usage().input_tokens,
            output_tokens: translator.output_tokens(),
            stop_reason: translator.stop_reason().unwrap_or("end_turn").to_string(),
            attempts,
            excluded,
            duration: job.started.elapsed(),
        };
        self.debug.summary(&summary);
        metrics::record_tokens(summary.input_tokens, summary.output_tokens);
        info!(
            account_id = summary.account_id,
            input_tokens = summary.input_tokens,
            output_tokens = summary.output_tokens,
            stop_reason = %summary.stop_reason,
            attempts = summary.attempts,
            duration_ms = summary.duration.as_millis() as u64,
            "request finished"
        );

        translator
    }
}

struct Job {
    request_id: String,
    model: String,
    started: Instant,
}

pub enum Outcome {
    Stream(EventStream),
    Message(MessageResponse),
}

/// Client events of a streaming request, in emission order. Ends after
/// `message_stop`. Dropping it cancels the request.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    _task: AbortOnDrop<Translator>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Aborts the task when dropped, so an abandoned request stops reading from
/// the upstream.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(&mut self) -> Result<T> {
        (&mut self.0)
            .await
            .map_err(|e| Error::Internal(format!("request task failed: {e}")))
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Emitter {
    /// `None` in buffered mode
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    debug: Arc<dyn DebugSink>,
}

impl Emitter {
    fn emit(&self, events: Vec<StreamEvent>) {
        let Some(tx) = &self.tx else {
            return;
        };
        for event in events {
            self.debug.client_event(&event);
            // A closed channel means the client left; the task is being aborted.
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

struct TranslatingSink<'a> {
    translator: &'a mut Translator,
    emitter: &'a Emitter,
}

impl EventSink for TranslatingSink<'_> {
    fn on_event(&mut self, event: UpstreamEvent) {
        self.emitter.debug.upstream_event(&event);
        let out = self.translator.apply(event);
        self.emitter.emit(out);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use orchids_pool::FileStore;
    use provider::ProviderError;
    use serde_json::json;

    use super::*;
    use crate::debug_log::tests::RecordingSink;
    use crate::protocol::{BlockDelta, ResponseBlock};

    enum Script {
        Events(Vec<UpstreamEvent>),
        Fail(ProviderError),
        /// Emit events, then fail mid-stream
        FailAfter(Vec<UpstreamEvent>, ProviderError),
    }

    /// Plays one script per call and records the session each call used.
    struct ScriptedUpstream {
        scripts: Mutex<VecDeque<Script>>,
        sessions: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                sessions: Mutex::new(Vec::new()),
            })
        }

        fn sessions(&self) -> Vec<String> {
            self.sessions.lock().unwrap().clone()
        }
    }

    impl Upstream for ScriptedUpstream {
        fn id(&self) -> &str {
            "scripted"
        }

        fn stream<'a>(
            &'a self,
            call: &'a UpstreamCall,
            sink: &'a mut dyn EventSink,
        ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.sessions
                    .lock()
                    .unwrap()
                    .push(call.session.session_id.clone());
                let script = self
                    .scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Script::Events(Vec::new()));
                match script {
                    Script::Events(events) => {
                        events.into_iter().for_each(|e| sink.on_event(e));
                        Ok(())
                    }
                    Script::Fail(err) => Err(err),
                    Script::FailAfter(events, err) => {
                        events.into_iter().for_each(|e| sink.on_event(e));
                        Err(err)
                    }
                }
            })
        }
    }

    fn account(id: i64) -> Account {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("account-{id}"),
            "session_id": format!("sess_{id}"),
            "client_cookie": format!("cookie_{id}"),
            "project_id": format!("proj_{id}"),
            "user_id": format!("user_{id}"),
            "email": format!("{id}@example.com"),
        }))
        .unwrap()
    }

    async fn pool_with(dir: &tempfile::TempDir, ids: &[i64]) -> Arc<Pool> {
        let store = FileStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        for &id in ids {
            store.upsert(account(id)).await.unwrap();
        }
        let pool = Arc::new(Pool::new(Arc::new(store), Duration::from_secs(30)));
        pool.refresh().await.unwrap();
        pool
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn request(stream: bool) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream,
        }))
        .unwrap()
    }

    fn hello_events() -> Vec<UpstreamEvent> {
        vec![
            UpstreamEvent::TextStart,
            UpstreamEvent::TextDelta {
                delta: "Hello there".into(),
            },
            UpstreamEvent::TextEnd,
            UpstreamEvent::Finish {
                finish_reason: Some("stop".into()),
            },
        ]
    }

    fn unauthorized() -> ProviderError {
        ProviderError::Unauthorized {
            status: 401,
            body: "expired".into(),
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        upstream: Arc<ScriptedUpstream>,
        keeper: Arc<AccountKeeper>,
        sink: Arc<RecordingSink>,
    }

    fn harness(scripts: Vec<Script>, pool: Option<Arc<Pool>>, fallback: Option<Account>) -> Harness {
        let upstream = ScriptedUpstream::new(scripts);
        let keeper = Arc::new(AccountKeeper::new());
        let sink = Arc::new(RecordingSink::default());
        let mut orchestrator = Orchestrator::new(upstream.clone(), Arc::clone(&keeper))
            .with_retry(fast_retry())
            .with_debug_sink(sink.clone());
        if let Some(pool) = pool {
            orchestrator = orchestrator.with_pool(pool);
        }
        if let Some(account) = fallback {
            orchestrator = orchestrator.with_static_account(account);
        }
        Harness {
            orchestrator: Arc::new(orchestrator),
            upstream,
            keeper,
            sink,
        }
    }

    async fn buffered(h: &Harness) -> MessageResponse {
        match h.orchestrator.run(request(false), "req_test").await.unwrap() {
            Outcome::Message(response) => response,
            Outcome::Stream(_) => panic!("expected a buffered message"),
        }
    }

    async fn collect(mut stream: EventStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn single_turn_buffered_request_completes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1, 2, 3]).await;
        let h = harness(vec![Script::Events(hello_events())], Some(pool), None);

        let response = buffered(&h).await;
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(
            response.content,
            vec![ResponseBlock::Text {
                text: "Hello there".into()
            }]
        );
        assert!(response.id.starts_with("msg_"));
        assert_eq!(response.model, "claude-sonnet-4-5");
        assert!(response.usage.input_tokens > 0);
        assert_eq!(response.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn auth_failures_fail_over_to_other_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1, 2, 3]).await;
        let h = harness(
            vec![
                Script::Fail(unauthorized()),
                Script::Fail(unauthorized()),
                Script::Events(hello_events()),
            ],
            Some(Arc::clone(&pool)),
            None,
        );

        let response = buffered(&h).await;
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert!(!response.content.is_empty());

        let sessions = h.upstream.sessions();
        assert_eq!(sessions.len(), 3);
        let distinct: HashSet<&String> = sessions.iter().collect();
        assert_eq!(distinct.len(), 3, "each attempt must use a fresh account");

        let summaries = h.sink.summaries.lock().unwrap().clone();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].excluded.len(), 2);
        assert_eq!(summaries[0].attempts, 3);

        let pending = pool.pending().await;
        let totals = pending.values().fold((0, 0, 0), |acc, d| {
            (acc.0 + d.requests, acc.1 + d.successes, acc.2 + d.failures)
        });
        assert_eq!(totals, (3, 1, 2));

        let winner: i64 = sessions[2].trim_start_matches("sess_").parse().unwrap();
        let status = h.keeper.status(winner).await.unwrap();
        assert!(status.last_active_at.is_some());
        assert!(status.last_error.is_none());
        for failed in &summaries[0].excluded {
            let status = h.keeper.status(*failed).await.unwrap();
            assert_eq!(status.consecutive_failures, 1);
        }
    }

    #[tokio::test]
    async fn exhausted_retries_still_finish_with_end_turn() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1, 2, 3, 4]).await;
        let h = harness(
            vec![
                Script::Fail(ProviderError::Transport("reset".into())),
                Script::Fail(ProviderError::Status {
                    status: 502,
                    body: String::new(),
                }),
                Script::Fail(unauthorized()),
                Script::Events(hello_events()),
            ],
            Some(pool),
            None,
        );

        let response = buffered(&h).await;
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert!(response.content.is_empty());
        assert_eq!(h.upstream.sessions().len(), 3, "attempts are bounded");
    }

    #[tokio::test]
    async fn failover_stops_when_no_account_is_left() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1]).await;
        let h = harness(vec![Script::Fail(unauthorized())], Some(pool), None);

        let response = buffered(&h).await;
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(h.upstream.sessions().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_over_to_static_account() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1]).await;
        let h = harness(
            vec![
                Script::Fail(unauthorized()),
                Script::Events(hello_events()),
            ],
            Some(Arc::clone(&pool)),
            Some(account(0)),
        );

        let response = buffered(&h).await;
        assert_eq!(h.upstream.sessions(), vec!["sess_1", "sess_0"]);
        assert!(!response.content.is_empty());
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));

        // The static account never enters the pool counters.
        let pending = pool.pending().await;
        assert!(!pending.contains_key(&0));
        assert_eq!(pending[&1].failures, 1);
    }

    #[tokio::test]
    async fn tool_arguments_are_repaired_in_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1]).await;
        let h = harness(
            vec![Script::Events(vec![
                UpstreamEvent::ToolInputStart {
                    id: "call_1".into(),
                    tool_name: "Count".into(),
                },
                UpstreamEvent::ToolCall {
                    tool_call_id: "call_1".into(),
                    tool_name: "Count".into(),
                    input: r#"{"count":"3","flag":"true"}"#.into(),
                },
                UpstreamEvent::Finish {
                    finish_reason: Some("tool-calls".into()),
                },
            ])],
            Some(pool),
            None,
        );

        let Outcome::Stream(stream) = h.orchestrator.run(request(true), "req_test").await.unwrap()
        else {
            panic!("expected a stream");
        };
        let events = collect(stream).await;

        let partial = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.clone()),
                _ => None,
            })
            .expect("input_json_delta emitted");
        let parsed: serde_json::Value = serde_json::from_str(&partial).unwrap();
        assert_eq!(parsed, json!({"count": 3, "flag": true}));

        let StreamEvent::MessageDelta { delta, .. } = &events[events.len() - 2] else {
            panic!("message_delta must precede message_stop");
        };
        assert_eq!(delta.stop_reason, "tool_use");
    }

    #[tokio::test]
    async fn streaming_retry_closes_the_interrupted_block() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1, 2]).await;
        let h = harness(
            vec![
                Script::FailAfter(
                    vec![
                        UpstreamEvent::TextStart,
                        UpstreamEvent::TextDelta {
                            delta: "partial".into(),
                        },
                    ],
                    ProviderError::Transport("connection reset".into()),
                ),
                Script::Events(hello_events()),
            ],
            Some(pool),
            None,
        );

        let Outcome::Stream(stream) = h.orchestrator.run(request(true), "req_test").await.unwrap()
        else {
            panic!("expected a stream");
        };
        let events = collect(stream).await;

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));

        let mut open = None;
        let mut next = 0;
        for event in &events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(open.is_none());
                    assert_eq!(*index, next);
                    next += 1;
                    open = Some(*index);
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open.take(), Some(*index));
                }
                _ => {}
            }
        }
        assert_eq!(next, 2, "one block per attempt");
        assert!(open.is_none());

        // The debug sink saw exactly what the client saw.
        assert_eq!(*h.sink.client.lock().unwrap(), events);
    }

    #[tokio::test]
    async fn no_accounts_is_an_error_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[]).await;
        let h = harness(vec![], Some(pool), None);

        let result = h.orchestrator.run(request(true), "req_test").await;
        assert!(matches!(result, Err(Error::NoAccounts)));
        assert!(h.upstream.sessions().is_empty());

        let h = harness(vec![], None, None);
        assert!(matches!(
            h.orchestrator.run(request(false), "req_test").await,
            Err(Error::NoAccounts)
        ));
    }

    #[tokio::test]
    async fn static_account_covers_an_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[]).await;
        let h = harness(
            vec![Script::Events(hello_events())],
            Some(pool),
            Some(account(0)),
        );

        let response = buffered(&h).await;
        assert!(!response.content.is_empty());
        assert_eq!(h.upstream.sessions(), vec!["sess_0".to_string()]);
    }

    #[tokio::test]
    async fn static_account_failure_is_not_retried() {
        let h = harness(
            vec![Script::Fail(unauthorized()), Script::Events(hello_events())],
            None,
            Some(account(0)),
        );

        let response = buffered(&h).await;
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert!(response.content.is_empty());
        assert_eq!(h.upstream.sessions().len(), 1);
        assert!(h.keeper.status(0).await.is_none());
    }

    #[tokio::test]
    async fn long_conversations_are_condensed_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1]).await;
        let h = harness(vec![Script::Events(hello_events())], Some(pool), None);

        let messages: Vec<serde_json::Value> = (0..121)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                json!({"role": role, "content": format!("message number {i}")})
            })
            .collect();
        let request: MessagesRequest =
            serde_json::from_value(json!({"model": "claude-opus-4-5", "messages": messages}))
                .unwrap();
        h.orchestrator.run(request, "req_test").await.unwrap();

        let prompt = h.sink.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Earlier conversation summary:"));
        // summary turn plus 9 history turns; the 10th kept message is the request
        assert!(prompt.contains("<turn index=\"10\""));
        assert!(!prompt.contains("<turn index=\"11\""));
        assert!(prompt.contains("<user_request>\nmessage number 120\n</user_request>"));
    }

    #[tokio::test]
    async fn summary_is_recorded_once_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[1]).await;
        // finish arrives, then the stream errors: no retry, one summary
        let mut events = hello_events();
        events.push(UpstreamEvent::TextDelta {
            delta: "ignored".into(),
        });
        let h = harness(
            vec![Script::FailAfter(events, ProviderError::Transport("eof".into()))],
            Some(pool),
            None,
        );

        let response = buffered(&h).await;
        assert_eq!(
            response.content,
            vec![ResponseBlock::Text {
                text: "Hello there".into()
            }]
        );
        assert_eq!(h.upstream.sessions().len(), 1);
        assert_eq!(h.sink.summaries.lock().unwrap().len(), 1);
    }

    /// Never completes; flags when its future is dropped.
    struct HangingUpstream {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Upstream for HangingUpstream {
        fn id(&self) -> &str {
            "hanging"
        }

        fn stream<'a>(
            &'a self,
            _call: &'a UpstreamCall,
            sink: &'a mut dyn EventSink,
        ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
            let flag = DropFlag(Arc::clone(&self.dropped));
            Box::pin(async move {
                let _flag = flag;
                sink.on_event(UpstreamEvent::TextStart);
                std::future::pending::<()>().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_upstream_read() {
        let dropped = Arc::new(AtomicBool::new(false));
        let upstream = Arc::new(HangingUpstream {
            dropped: Arc::clone(&dropped),
        });
        let orchestrator = Arc::new(
            Orchestrator::new(upstream, Arc::new(AccountKeeper::new()))
                .with_static_account(account(0)),
        );

        let Outcome::Stream(mut stream) = orchestrator.run(request(true), "req_test").await.unwrap()
        else {
            panic!("expected a stream");
        };
        assert!(matches!(stream.next().await, Some(StreamEvent::MessageStart { .. })));
        assert!(matches!(
            stream.next().await,
            Some(StreamEvent::ContentBlockStart { .. })
        ));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("upstream future dropped after cancellation");
    }
}
