//! LLM API client with retry, response caching and cancellable streaming

use super::auth::{CredentialStore, RequestAuthenticator};
use super::cache::ResponseCache;
use super::models::{ChatMessage, MessageRequest, MessageResponse, StreamEvent, StreamingResult};
use super::retry::{RetryAttempt, RetryConfig, RetryDecision, RetryPolicy};
use super::stream::{pump_stream, StreamDecoder};
use crate::config::{ApiConfig, Config};
use crate::error::{ContextError, ErrorKind, Result};
use crate::metrics::Metrics;
use futures::Stream;
use reqwest::{Client, Response};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the client's current call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
    Streaming,
    StreamingCompleted,
}

/// The stream task currently owned by a client
struct ActiveStream {
    task: JoinHandle<()>,
}

/// Handle to one streaming call.
///
/// Yields [`StreamEvent`]s as a [`Stream`]; [`StreamingCall::finish`] returns
/// the aggregated result once the stream has ended.
pub struct StreamingCall {
    events: mpsc::Receiver<StreamEvent>,
    result: oneshot::Receiver<StreamingResult>,
    token: CancellationToken,
}

impl StreamingCall {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Request cancellation; takes effect at the next frame boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the final result, discarding events not yet consumed
    pub async fn finish(self) -> StreamingResult {
        let StreamingCall { events, result, .. } = self;
        drop(events);
        result.await.unwrap_or_else(|_| StreamingResult {
            error: Some(ErrorKind::Internal),
            ..StreamingResult::default()
        })
    }

    /// Consume every event, then return them with the final result
    pub async fn collect(mut self) -> (Vec<StreamEvent>, StreamingResult) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let result = self.finish().await;
        (events, result)
    }
}

impl Stream for StreamingCall {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.poll_recv(cx)
    }
}

/// Client for the provider's messages endpoint
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
    auth: RequestAuthenticator,
    policy: RetryPolicy,
    cache: Option<ResponseCache>,
    metrics: Arc<Metrics>,
    status: Arc<watch::Sender<CallStatus>>,
    active: Mutex<Option<ActiveStream>>,
    current_token: StdMutex<Option<CancellationToken>>,
}

impl ApiClient {
    /// Create a new client
    pub fn new(
        config: ApiConfig,
        retry: RetryConfig,
        store: Arc<dyn CredentialStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        // No overall timeout on the client: it would cut long streams short.
        // Single-shot requests set their own.
        let http = Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| ContextError::Internal(e.to_string()))?;

        let auth = RequestAuthenticator::new(
            store,
            config.provider.clone(),
            config.api_version.clone(),
            config.auth_scheme,
        );
        let (status, _) = watch::channel(CallStatus::Idle);

        Ok(Self {
            http,
            config,
            auth,
            policy: RetryPolicy::new(retry),
            cache: None,
            metrics,
            status: Arc::new(status),
            active: Mutex::new(None),
            current_token: StdMutex::new(None),
        })
    }

    /// Create from the full configuration, enabling the response cache if configured
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut client = Self::new(config.api.clone(), config.retry.clone(), store, metrics)?;
        if config.cache.enabled {
            client = client.with_response_cache(ResponseCache::new(&config.cache));
        }
        Ok(client)
    }

    pub fn with_response_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn response_cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &RequestAuthenticator {
        &self.auth
    }

    /// Current call status
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// Observe call status transitions
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    /// Build a request from a single user prompt
    pub fn build_request(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
        stream: bool,
    ) -> MessageRequest {
        MessageRequest {
            model: model.unwrap_or(&self.config.default_model).to_string(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: system_prompt.map(str::to_string),
            stream: stream.then_some(true),
        }
    }

    /// Single-shot completion
    pub async fn send(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
    ) -> Result<String> {
        let request = self.build_request(prompt, system_prompt, model, false);
        self.send_request(&request).await
    }

    /// Single-shot completion for a prepared request
    pub async fn send_request(&self, request: &MessageRequest) -> Result<String> {
        let start = Instant::now();

        if let Err(e) = self.auth.require_credential() {
            self.record_outcome("send", "missing_credential", start);
            return Err(e);
        }

        if let Some(cache) = &self.cache {
            if let Some(text) = cache.get(request).await {
                debug!("Response cache hit for model {}", request.model);
                self.metrics.response_cache_hits.inc();
                self.record_outcome("send", "cached", start);
                return Ok(text);
            }
        }

        self.status.send_replace(CallStatus::InProgress);
        let outcome = self.with_retry("send", || self.attempt_send(request)).await;

        match &outcome {
            Ok(text) => {
                if let Some(cache) = &self.cache {
                    cache.store(request, text.clone()).await;
                }
                self.status.send_replace(CallStatus::Completed);
                self.record_outcome("send", "success", start);
            }
            Err(e) => {
                self.status.send_replace(CallStatus::Failed);
                self.record_outcome("send", e.kind().as_str(), start);
            }
        }
        outcome
    }

    /// Start a streaming completion.
    ///
    /// Any stream already active on this client is cancelled and fully wound
    /// down before the new one connects. Only the initial connection is
    /// retried; once bytes flow, a failure ends the call.
    pub async fn send_streaming(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
    ) -> Result<StreamingCall> {
        let request = self.build_request(prompt, system_prompt, model, true);
        self.send_streaming_request(&request).await
    }

    pub async fn send_streaming_request(&self, request: &MessageRequest) -> Result<StreamingCall> {
        let start = Instant::now();
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            debug!("Superseding active stream");
            if let Some(token) = self.take_token() {
                token.cancel();
            }
            if let Err(e) = previous.task.await {
                warn!("Previous stream task ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.auth.require_credential() {
            self.record_outcome("stream", "missing_credential", start);
            return Err(e);
        }

        let token = CancellationToken::new();
        self.set_token(token.clone());
        self.status.send_replace(CallStatus::Streaming);

        let connect = self.with_retry("stream", || self.post(request, true));
        let response = tokio::select! {
            _ = token.cancelled() => Err(ContextError::Cancelled),
            response = connect => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(ContextError::Cancelled) => {
                info!("Stream cancelled while connecting");
                self.status.send_replace(CallStatus::Completed);
                self.record_outcome("stream", "cancelled", start);
                return Err(ContextError::Cancelled);
            }
            Err(e) => {
                self.take_token();
                self.status.send_replace(CallStatus::Failed);
                self.record_outcome("stream", e.kind().as_str(), start);
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let (result_tx, result_rx) = oneshot::channel();
        let status = self.status.clone();
        let metrics = self.metrics.clone();
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let result = pump_stream(
                response.bytes_stream(),
                StreamDecoder::new(),
                task_token,
                event_tx,
                Some(metrics.clone()),
            )
            .await;

            let (final_status, outcome) = match result.error {
                Some(ErrorKind::Cancelled) => (CallStatus::Completed, "cancelled"),
                Some(kind) => (CallStatus::Failed, kind.as_str()),
                None => (CallStatus::StreamingCompleted, "success"),
            };
            status.send_replace(final_status);
            metrics
                .api_requests
                .with_label_values(&["stream", outcome])
                .inc();
            metrics
                .api_request_duration
                .with_label_values(&["stream"])
                .observe(start.elapsed().as_secs_f64());
            debug!(
                "Stream finished: {} chars, outcome {}",
                result.accumulated_text.len(),
                outcome
            );
            let _ = result_tx.send(result);
        });

        *active = Some(ActiveStream { task });

        Ok(StreamingCall {
            events: event_rx,
            result: result_rx,
            token,
        })
    }

    /// Cancel the active stream, if any, and wait for it to wind down
    pub async fn cancel_streaming(&self) {
        if let Some(token) = self.take_token() {
            token.cancel();
        }
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if let Err(e) = previous.task.await {
                warn!("Stream task ended abnormally: {}", e);
            }
        }
        self.status.send_replace(CallStatus::Completed);
    }

    /// One dispatch of a single-shot request, including body parsing
    async fn attempt_send(&self, request: &MessageRequest) -> Result<String> {
        let response = self.post(request, false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ContextError::from_transport(&e))?;
        let parsed: MessageResponse = serde_json::from_str(&body)?;
        parsed
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| ContextError::ParsingError("response has no text content block".into()))
    }

    /// Sign and dispatch, mapping non-success statuses to errors
    async fn post(&self, request: &MessageRequest, streaming: bool) -> Result<Response> {
        let url = self.config.messages_url();
        let mut builder = self.http.post(&url).json(request);
        if !streaming {
            builder = builder.timeout(self.config.timeout());
        }
        let builder = self.auth.sign(builder)?;

        debug!(
            "Calling {} (model {}, {} messages, stream={})",
            url,
            request.model,
            request.messages.len(),
            streaming
        );

        let response = builder
            .send()
            .await
            .map_err(|e| ContextError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ContextError::from_status(status.as_u16(), error_text));
        }
        Ok(response)
    }

    /// Run `attempt` until it succeeds or the retry policy says stop
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt_index = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let cause = e.retry_cause();
                    let failed = RetryAttempt {
                        attempt_index,
                        classified_cause: cause,
                    };
                    match self.policy.next(failed) {
                        RetryDecision::Stop => {
                            error!(
                                "{} failed after {} attempts: {}",
                                operation,
                                attempt_index + 1,
                                e
                            );
                            return Err(e);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            warn!(
                                "{} attempt {} failed: {}, retrying in {:?}",
                                operation,
                                attempt_index + 1,
                                e,
                                delay
                            );
                            self.metrics
                                .api_retries
                                .with_label_values(&[cause.as_str()])
                                .inc();
                            tokio::time::sleep(delay).await;
                            attempt_index += 1;
                        }
                    }
                }
            }
        }
    }

    fn record_outcome(&self, operation: &str, outcome: &str, start: Instant) {
        self.metrics
            .api_requests
            .with_label_values(&[operation, outcome])
            .inc();
        self.metrics
            .api_request_duration
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
    }

    fn set_token(&self, token: CancellationToken) {
        *self
            .current_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn take_token(&self) -> Option<CancellationToken> {
        self.current_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
