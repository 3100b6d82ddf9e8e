//! End-to-end dispatch scenarios against a scripted upstream client.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use tianji_common::{ErrorKind, GeneralSettings};
use tianji_core::engine::{ChatOutcome, chat_completion};
use tianji_core::{AppState, RateLimitStore, Router, UpstreamClient};
use tianji_protocol::openai::ChatCompletionRequest;
use tianji_provider_core::provider::{
    UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};
use tianji_provider_core::{GatewayConfig, ModelTable};
use tianji_provider_impl::build_registry;
use tianji_storage::{MemoryStorage, Storage};

const CONFIG_YAML: &str = r#"
model_list:
  - model_name: gpt-smart
    tianji_params:
      model: openai/gpt-4o-2024
      api_key: sk-test
  - model_name: claude-smart
    tianji_params:
      model: anthropic/claude-sonnet
      api_key: sk-ant-test
router_settings:
  max_retries: 1
"#;

#[derive(Default)]
struct MockClient {
    responses: Mutex<VecDeque<Result<UpstreamHttpResponse, UpstreamFailure>>>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

impl MockClient {
    fn push(&self, resp: Result<UpstreamHttpResponse, UpstreamFailure>) {
        self.responses.lock().unwrap().push_back(resp);
    }

    fn requests(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Other,
                    message: "mock response queue exhausted".to_string(),
                })
            })
        })
    }
}

fn build_state(client: Arc<MockClient>, storage: Arc<MemoryStorage>) -> Arc<AppState> {
    let registry = build_registry();
    let config = GatewayConfig::from_yaml(CONFIG_YAML).unwrap();
    let table = ModelTable::from_config(&config, &registry.names()).unwrap();
    Arc::new(AppState {
        registry,
        table,
        router: Router::new(),
        ratelimit: RateLimitStore::new(),
        storage: storage as Arc<dyn Storage>,
        client,
        general: GeneralSettings::default(),
        router_settings: config.router_settings.clone(),
    })
}

fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn json_response(status: u16, extra_headers: &[(&str, &str)], body: serde_json::Value) -> UpstreamHttpResponse {
    let mut hs = headers(&[("content-type", "application/json")]);
    hs.extend(headers(extra_headers));
    UpstreamHttpResponse {
        status,
        headers: hs,
        body: UpstreamBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap())),
    }
}

fn chat_request(value: serde_json::Value) -> ChatCompletionRequest {
    serde_json::from_value(value).unwrap()
}

async fn wait_for_spend_logs(storage: &MemoryStorage, count: usize) -> bool {
    for _ in 0..200 {
        if storage.spend_logs().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn openai_happy_path_records_telemetry_once() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    client.push(Ok(json_response(
        200,
        &[
            ("x-ratelimit-remaining-tokens", "1999000"),
            ("x-ratelimit-limit-tokens", "2000000"),
        ],
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-2024",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi there"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16},
        }),
    )));
    let state = build_state(client.clone(), storage.clone());

    let req = chat_request(json!({
        "model": "gpt-smart",
        "messages": [{"role": "user", "content": "hello"}],
    }));
    let outcome = chat_completion(state.clone(), req).await.unwrap();

    let ChatOutcome::Completion(resp) = outcome else {
        panic!("expected a buffered completion");
    };
    // the logical name goes back to the client, never the vendor model id
    assert_eq!(resp.model, "gpt-smart");
    assert_eq!(resp.choices[0].message.content.as_deref(), Some("hi there"));

    assert_eq!(client.requests().len(), 1);
    let snapshot = state.ratelimit.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, "openai/gpt-4o-2024");
    assert_eq!(snapshot[0].1.tokens_remaining, 1_999_000);

    assert!(wait_for_spend_logs(&storage, 1).await);
    let logs = storage.spend_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].model_group, "gpt-smart");
    assert_eq!(logs[0].provider, "openai");
    assert_eq!(logs[0].total_tokens, 16);
    assert!(!logs[0].stream);
}

#[tokio::test]
async fn unknown_model_is_a_404() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    let state = build_state(client.clone(), storage);

    let req = chat_request(json!({
        "model": "nope",
        "messages": [{"role": "user", "content": "hello"}],
    }));
    let err = chat_completion(state, req).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.code.as_deref(), Some("model_not_found"));
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn anthropic_stream_translates_to_openai_chunks() {
    let sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"role\":\"assistant\",\"model\":\"claude-sonnet\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n",
        "\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n",
        "\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n",
        "\n",
    );
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    client.push(Ok(UpstreamHttpResponse {
        status: 200,
        headers: headers(&[("content-type", "text/event-stream")]),
        body: UpstreamBody::Bytes(Bytes::from_static(sse.as_bytes())),
    }));
    let state = build_state(client.clone(), storage.clone());

    let req = chat_request(json!({
        "model": "claude-smart",
        "messages": [{"role": "user", "content": "hello"}],
        "stream": true,
    }));
    let outcome = chat_completion(state, req).await.unwrap();
    let ChatOutcome::Stream(mut rx) = outcome else {
        panic!("expected a stream");
    };

    let mut out = String::new();
    while let Some(frame) = rx.recv().await {
        out.push_str(std::str::from_utf8(&frame).unwrap());
    }

    assert!(out.contains("\"model\":\"claude-smart\""));
    assert!(out.contains("Hello"));
    assert!(out.contains(" world"));
    assert!(out.contains("\"finish_reason\":\"stop\""));
    assert!(out.trim_end().ends_with("data: [DONE]"));
    // usage was not requested, so it never reaches the client
    assert!(!out.contains("prompt_tokens"));

    // usage still feeds the spend log
    assert!(wait_for_spend_logs(&storage, 1).await);
    let logs = storage.spend_logs();
    assert_eq!(logs[0].provider, "anthropic");
    assert!(logs[0].stream);
    assert_eq!(logs[0].completion_tokens, 3);
}

#[tokio::test]
async fn exhausted_429_passes_through_verbatim() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    let upstream_body = json!({"error": {"message": "slow down", "type": "rate_limit_error"}});
    client.push(Ok(json_response(
        429,
        &[("retry-after", "30")],
        upstream_body.clone(),
    )));
    let state = build_state(client.clone(), storage.clone());

    let req = chat_request(json!({
        "model": "gpt-smart",
        "messages": [{"role": "user", "content": "hello"}],
    }));
    let outcome = chat_completion(state, req).await.unwrap();
    let ChatOutcome::Upstream { status, body, .. } = outcome else {
        panic!("expected the upstream reply to surface");
    };
    assert_eq!(status, 429);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, upstream_body);

    // the only deployment is excluded after the 429; no second attempt
    assert_eq!(client.requests().len(), 1);
    assert!(storage.spend_logs().is_empty());
}

#[tokio::test]
async fn stream_request_hitting_a_client_error_surfaces_plain_http() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    let upstream_body =
        json!({"error": {"message": "bad payload", "type": "invalid_request_error"}});
    client.push(Ok(json_response(400, &[], upstream_body.clone())));
    let state = build_state(client.clone(), storage.clone());

    let req = chat_request(json!({
        "model": "claude-smart",
        "messages": [{"role": "user", "content": "hello"}],
        "stream": true,
    }));
    let outcome = chat_completion(state, req).await.unwrap();
    // the failure happens before any event stream opens toward the client,
    // so the reply is an ordinary HTTP response, not an SSE frame
    let ChatOutcome::Upstream {
        status,
        content_type,
        body,
    } = outcome
    else {
        panic!("expected the upstream reply to surface");
    };
    assert_eq!(status, 400);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, upstream_body);
    assert_eq!(client.requests().len(), 1);
    assert!(storage.spend_logs().is_empty());
}

#[tokio::test]
async fn prompt_template_resolves_before_dispatch() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_prompt("greet", 1, "Say hello to {{name}}");
    client.push(Ok(json_response(
        200,
        &[],
        json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-2024",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello Ada!"},
                "finish_reason": "stop",
            }],
        }),
    )));
    let state = build_state(client.clone(), storage);

    let req = chat_request(json!({
        "model": "gpt-smart",
        "messages": [],
        "prompt_name": "greet",
        "prompt_variables": {"name": "Ada"},
    }));
    let outcome = chat_completion(state, req).await.unwrap();
    assert!(matches!(outcome, ChatOutcome::Completion(_)));

    let sent = client.requests();
    assert_eq!(sent.len(), 1);
    let body: serde_json::Value =
        serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body["messages"][0]["content"], "Say hello to Ada");
    // the gateway extension fields never reach a vendor
    assert!(body.get("prompt_name").is_none());
    assert!(body.get("prompt_variables").is_none());
}

#[tokio::test]
async fn client_cancel_mid_stream_skips_spend() {
    let (upstream_tx, upstream_rx) = tokio::sync::mpsc::channel::<Bytes>(4);
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    client.push(Ok(UpstreamHttpResponse {
        status: 200,
        headers: headers(&[("content-type", "text/event-stream")]),
        body: UpstreamBody::Stream(upstream_rx),
    }));
    let state = build_state(client.clone(), storage.clone());

    let req = chat_request(json!({
        "model": "claude-smart",
        "messages": [{"role": "user", "content": "hello"}],
        "stream": true,
    }));
    let outcome = chat_completion(state, req).await.unwrap();
    let ChatOutcome::Stream(mut rx) = outcome else {
        panic!("expected a stream");
    };

    upstream_tx
        .send(Bytes::from_static(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        ))
        .await
        .unwrap();
    assert!(rx.recv().await.is_some());

    // the client hangs up; the next relay write fails
    drop(rx);
    let _ = upstream_tx
        .send(Bytes::from_static(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        ))
        .await;
    drop(upstream_tx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(storage.spend_logs().is_empty());
}

#[tokio::test]
async fn upstream_transport_failure_maps_to_gateway_error() {
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MemoryStorage::new());
    client.push(Err(UpstreamFailure::Transport {
        kind: UpstreamTransportErrorKind::Timeout,
        message: "deadline exceeded".to_string(),
    }));
    let state = build_state(client.clone(), storage);

    let req = chat_request(json!({
        "model": "gpt-smart",
        "messages": [{"role": "user", "content": "hello"}],
    }));
    let err = chat_completion(state, req).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}
