use axum::body::Body;
use axum::http::{Request, StatusCode};
use llm_router::{build_router, AppState, HttpTransport, Registry, RegistryHandle, Relay, RouterConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app(upstream: &MockServer, extra: &str) -> axum::Router {
    let config = format!(
        r#"
[[routes]]
name = "fast"
backend = "openai"
endpoint = "{uri}/v1"
api_key = "sk-openai-test"
target_model = "gpt-4o-mini"

[[routes]]
name = "smart"
backend = "anthropic"
endpoint = "{uri}"
api_key = "sk-ant-test"
target_model = "claude-sonnet-4-20250514"

[[routes]]
name = "slow"
backend = "openai"
endpoint = "{uri}/slow"
connect_timeout = 0.2
[routes.retry]
max_retries = 0

{extra}
"#,
        uri = upstream.uri()
    );
    let config: RouterConfig = toml::from_str(&config).unwrap();
    let registry = Arc::new(RegistryHandle::new(Registry::from_config(&config).unwrap()));
    let relay = Relay::new(registry, Arc::new(HttpTransport::new().unwrap()));
    build_router(Arc::new(AppState { relay }))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_messages_caller_served_by_openai_backend() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-openai-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/messages",
            json!({
                "model": "fast",
                "max_tokens": 32,
                "system": "be brief",
                "messages": [{"role": "user", "content": "ping"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["model"], "fast");
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 4);
}

#[tokio::test]
async fn test_native_caller_served_by_anthropic_backend() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "hi from claude"}],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 3}
        })))
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/api/chat",
            json!({
                "model": "smart",
                "stream": false,
                "messages": [{"role": "user", "content": "hello"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"]["content"], "hi from claude");
    assert_eq!(body["done"], true);
    assert_eq!(body["eval_count"], 3);
}

#[tokio::test]
async fn test_streaming_chat_completions_over_sse() {
    let upstream = MockServer::start().await;
    let sse = concat!(
        "data: {\"id\":\"c\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"str\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"eam\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/chat/completions",
            json!({
                "model": "fast",
                "stream": true,
                "messages": [{"role": "user", "content": "go"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("\"content\":\"str\""));
    assert!(text.contains("\"content\":\"eam\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn test_legacy_completions_served_by_anthropic_backend() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "messages": [{"role": "user", "content": "Once upon"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_2",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": " a time"}],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 2, "output_tokens": 3}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/completions",
            json!({"model": "smart", "prompt": "Once upon", "max_tokens": 3}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["model"], "smart");
    assert_eq!(body["choices"][0]["text"], " a time");
    assert_eq!(body["choices"][0]["finish_reason"], "length");
}

#[tokio::test]
async fn test_legacy_completions_stream() {
    let upstream = MockServer::start().await;
    let sse = concat!(
        "data: {\"id\":\"c\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"tick\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/completions",
            json!({"model": "fast", "prompt": "go", "stream": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("\"object\":\"text_completion\""));
    assert!(text.contains("\"text\":\"tick\""));
    assert!(!text.contains("chat.completion.chunk"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn test_upstream_status_preserved_in_caller_shape() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "invalid x-api-key"}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "smart", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "invalid x-api-key");
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&upstream)
        .await;

    let response = app(&upstream, "")
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "slow", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_header_rules_shape_outgoing_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("x-router", "llm-router"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let response = app(&upstream, "[headers]\nforce = { \"x-router\" = \"llm-router\" }\n")
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "fast", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_body_is_rejected() {
    let upstream = MockServer::start().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app(&upstream, "").oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_models_and_health() {
    let upstream = MockServer::start().await;
    let app = app(&upstream, "");

    let models = app
        .clone()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(models).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["fast", "smart", "slow"]);

    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(health).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections_in_use"], 0);
}
