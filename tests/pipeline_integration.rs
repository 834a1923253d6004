//! End-to-end tests for the conversation pipeline against a mock provider

use context_relay::api::{ApiClient, CallStatus, InMemoryCredentialStore, RetryConfig, StreamEvent};
use context_relay::cache::CacheCoordinator;
use context_relay::config::{ApiConfig, Config};
use context_relay::context::{ContextBuffer, ContextKind, SharedContextBuffer, TruncatingSummarizer};
use context_relay::conversation::{ConversationOrchestrator, InMemoryConversationStore};
use context_relay::{ContextError, ErrorKind, Metrics};
use futures::StreamExt;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().unwrap())
}

fn client(url: &str, key: Option<&str>, metrics: Arc<Metrics>) -> Arc<ApiClient> {
    let store = Arc::new(InMemoryCredentialStore::new());
    if let Some(key) = key {
        store.insert("anthropic", key);
    }
    let api = ApiConfig {
        base_url: url.to_string(),
        ..ApiConfig::default()
    };
    let retry = RetryConfig {
        max_retries: 2,
        base_delay_ms: 1,
        ..RetryConfig::default()
    };
    Arc::new(ApiClient::new(api, retry, store, metrics).unwrap())
}

fn sse(id: &str, parts: &[&str]) -> String {
    let mut body = format!(
        "data: {{\"type\":\"message_start\",\"message\":{{\"id\":\"{}\"}}}}\n\n",
        id
    );
    body.push_str(": keep-alive\n\nevent: ping\ndata: {\"type\":\"ping\"}\n\n");
    for part in parts {
        body.push_str(&format!(
            "data: {{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{{\"type\":\"text_delta\",\"text\":\"{}\"}}}}\n\n",
            part
        ));
    }
    body.push_str("data: {\"type\":\"message_stop\"}\n\n");
    body
}

#[tokio::test]
async fn test_streaming_turn_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "sk-live")
        .match_body(mockito::Matcher::Regex("User: tell me".to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse("msg_42", &["Once ", "upon ", "a time"]))
        .create_async()
        .await;

    let metrics = metrics();
    let client = client(&server.url(), Some("sk-live"), metrics.clone());
    let buffer = SharedContextBuffer::new(ContextBuffer::new(10_000, 500));
    let convo = ConversationOrchestrator::new(
        client.clone(),
        buffer,
        Config::default().budget,
        metrics.clone(),
    );

    let mut call = convo.send_turn_streaming("tell me a story").await.unwrap();
    let mut deltas = String::new();
    while let Some(event) = call.next().await {
        if let StreamEvent::ContentDelta { text } = event {
            deltas.push_str(&text);
        }
    }
    let result = call.finish().await;

    assert_eq!(deltas, "Once upon a time");
    assert_eq!(result.accumulated_text, deltas);
    assert!(result.is_complete);
    assert_eq!(client.status(), CallStatus::StreamingCompleted);

    assert_ok!(convo.commit_reply(&result).await);
    assert_eq!(
        convo.buffer().render_structured(),
        "User: tell me a story\n\nAssistant: Once upon a time"
    );
    assert!(metrics.render().unwrap().contains("relay_stream_events_total"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries_then_recovers() {
    let mut server = mockito::Server::new_async().await;
    let limited = server
        .mock("POST", "/v1/messages")
        .with_status(429)
        .with_body(r#"{"type":"error","error":{"type":"rate_limit_error"}}"#)
        .expect(3)
        .create_async()
        .await;

    let metrics = metrics();
    let client = client(&server.url(), Some("sk-live"), metrics.clone());
    assert_err!(client.send("hi", None, None).await);
    assert_eq!(client.status(), CallStatus::Failed);
    limited.assert_async().await;
    limited.remove_async().await;

    let ok = server
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_body(r#"{"id":"msg_1","content":[{"type":"text","text":"hello"}]}"#)
        .create_async()
        .await;
    assert_eq!(client.send("hi", None, None).await.unwrap(), "hello");
    assert_eq!(client.status(), CallStatus::Completed);
    assert!(metrics
        .render()
        .unwrap()
        .contains("relay_api_retries_total{cause=\"rate_limited\"} 2"));
    ok.assert_async().await;
}

#[tokio::test]
async fn test_missing_credential_never_dispatches() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("POST", "/v1/messages").expect(0).create_async().await;

    let client = client(&server.url(), None, metrics());
    let streaming = client.send_streaming("hi", None, None).await;
    assert!(matches!(streaming, Err(ContextError::MissingCredential(p)) if p == "anthropic"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_stream_error_frame_fails_call() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_body(concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m\"}}\n\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"busy\"}}\n\n",
        ))
        .create_async()
        .await;

    let client = client(&server.url(), Some("k"), metrics());
    let (events, result) = client.send_streaming("hi", None, None).await.unwrap().collect().await;

    assert_eq!(
        events.last(),
        Some(&StreamEvent::Error {
            cause: ErrorKind::ServerError
        })
    );
    assert_eq!(result.error, Some(ErrorKind::ServerError));
    assert!(!result.is_complete);
    assert_eq!(client.status(), CallStatus::Failed);
}

#[tokio::test]
async fn test_persisted_conversation_survives_restart() {
    let store = InMemoryConversationStore::new();
    let metrics = metrics();
    let client = client("http://localhost:1", Some("k"), metrics.clone());

    let convo = ConversationOrchestrator::new(
        client.clone(),
        SharedContextBuffer::new(ContextBuffer::new(60, 0)),
        Config::default().budget,
        metrics.clone(),
    )
    .with_summarizer(Arc::new(TruncatingSummarizer::default()));
    convo.add_document(&"long appendix ".repeat(100)).await.unwrap();
    convo.save_to(&store, "session").unwrap();

    let mut restored = ConversationOrchestrator::new(
        client,
        SharedContextBuffer::new(ContextBuffer::new(60, 0)),
        Config::default().budget,
        metrics,
    );
    assert!(restored.load_from(&store, "session").unwrap());

    let snapshot = restored.buffer().snapshot();
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].kind(), &ContextKind::Summary);
    assert!(restored.buffer().render_structured().starts_with("## Summary\n\n"));
}

#[test]
fn test_cache_coordinator_clears_buffer() {
    let buffer = SharedContextBuffer::new(ContextBuffer::new(1000, 0));
    buffer.add("a", ContextKind::Message, 1).unwrap();
    buffer.add("b", ContextKind::Document, 1).unwrap();

    let mut coordinator = CacheCoordinator::new();
    coordinator.register(Arc::new(buffer.clone()));

    assert_eq!(coordinator.stats()[0].entries, 2);
    assert_eq!(coordinator.clear("context_buffer"), 1);
    assert_eq!(buffer.used_tokens(), 0);
}
