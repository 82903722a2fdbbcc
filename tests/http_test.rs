use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stagerelay::logging::RELAY_TURN_ID_HEADER;
use stagerelay::server::build_router;
use stagerelay::{AppState, Args};

fn args(base_url: Option<String>) -> Args {
    Args {
        port: 0,
        host: "127.0.0.1".into(),
        provider_name: "deepseek".into(),
        base_url,
        api_key: Some("test-key".into()),
        model: Some("deepseek-chat".into()),
        upstream_timeout_secs: 5,
        connect_timeout_secs: 1,
        max_body_size: 64 * 1024,
        log_dir: "logs".into(),
        log_json: false,
    }
}

fn app(base_url: Option<String>) -> Router {
    let state = AppState::new(reqwest::Client::new(), Arc::new(args(base_url)));
    build_router(Arc::new(state))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// `(event, data)` for every SSE frame; keep-alive comments are skipped.
fn sse_frames(text: &str) -> Vec<(String, Value)> {
    text.split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    event = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data.push_str(v.trim_start());
                }
            }
            Some((event?, serde_json::from_str(&data).ok()?))
        })
        .collect()
}

fn upstream_sse(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": delta}}]})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn create_conversation_returns_id_and_timestamp() {
    for uri in ["/conversations", "/api/chat/conversations"] {
        let response = app(None).oneshot(post(uri, json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(RELAY_TURN_ID_HEADER));

        let body = body_json(response).await;
        assert!(uuid::Uuid::parse_str(body["id"].as_str().unwrap()).is_ok());
        assert!(body["createdAt"].as_str().unwrap().ends_with('Z'));
    }
}

#[tokio::test]
async fn blank_content_is_bad_request_envelope() {
    let response = app(Some("http://127.0.0.1:9".into()))
        .oneshot(post("/conversations/c1/messages", json!({"content": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["type"], "agentToUi/error");
    assert_eq!(body["schemaVersion"], 1);
    assert_eq!(body["source"]["agentName"], "backend");
    assert_eq!(body["payload"]["code"], "bad_request");
    assert_eq!(body["payload"]["message"], "content is required");
}

#[tokio::test]
async fn non_object_body_counts_as_empty_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/conversations/c1/messages")
        .body(Body::from("[1,2,3]"))
        .unwrap();
    let response = app(Some("http://127.0.0.1:9".into()))
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_provider_and_mode_are_rejected() {
    let response = app(Some("http://127.0.0.1:9".into()))
        .oneshot(post(
            "/conversations/c1/messages",
            json!({"content": "x", "provider": "openai"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["payload"]["message"],
        "unsupported provider: openai"
    );

    let response = app(Some("http://127.0.0.1:9".into()))
        .oneshot(post(
            "/conversations/c1/messages",
            json!({"content": "x", "responseMode": "xml"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_provider_config_is_500_with_need_list() {
    let response = app(None)
        .oneshot(post("/conversations/c1/messages", json!({"content": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_json(response).await;
    assert_eq!(body["payload"]["code"], "missing_config");
    assert_eq!(body["payload"]["details"]["need"], json!(["PROVIDER_BASE_URL"]));
}

#[tokio::test]
async fn unknown_action_is_not_found() {
    let response = app(None)
        .oneshot(post("/conversations/c1/archive", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_readiness() {
    let response = app(None).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = app(None).oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["need"], json!(["PROVIDER_BASE_URL"]));

    let response = app(Some("http://127.0.0.1:9".into()))
        .oneshot(get("/readyz"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn single_shot_text_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "deepseek-reasoner", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello!"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = app(Some(server.uri()))
        .oneshot(post(
            "/api/chat/conversations/c1/messages",
            json!({"content": "hi", "model": "deepseek-reasoner"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["conversationId"], "c1");
    assert_eq!(body["assistant"]["type"], "agentToUi/text");
    assert_eq!(body["assistant"]["payload"]["text"], "Hello!");
    assert_eq!(body["assistant"]["source"]["agentName"], "deepseek-reasoner");
}

#[tokio::test]
async fn single_shot_bad_json_is_502() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "{\"envelopes\": ["}}]
        })))
        .mount(&server)
        .await;

    let response = app(Some(server.uri()))
        .oneshot(post(
            "/conversations/c1/messages",
            json!({"content": "hi", "responseMode": "agentToUi-json"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    assert_eq!(body["payload"]["code"], "bad_json");
    assert_eq!(body["payload"]["details"]["raw"], "{\"envelopes\": [");
    assert_eq!(body["payload"]["details"]["provider"], "deepseek");
    assert_eq!(body["payload"]["details"]["responseMode"], "agentToUi-json");
}

#[tokio::test]
async fn stream_validation_error_is_one_message_then_done() {
    let response = app(None)
        .oneshot(post("/conversations/c1/messages:stream", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let frames = sse_frames(&body_text(response).await);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0, "msg");
    assert_eq!(frames[0].1["payload"]["code"], "bad_request");
    assert_eq!(frames[1], ("done".to_string(), json!({})));
}

#[tokio::test]
async fn stream_turn_relays_envelopes_over_sse() {
    let server = MockServer::start().await;
    let a = r#"{"schemaVersion":1,"type":"agentToUi/chatMessage","id":"a","createdAt":"2026-01-01T00:00:00Z","payload":{"content":"Adding a title"}}"#;
    let b = r#"{"schemaVersion":1,"type":"agentToUi/componentTemplate","id":"b","createdAt":"2026-01-01T00:00:01Z","payload":{"intent":"insert","template":{}}}"#;
    let a_line = format!("{}\n", a);
    let b_head = &b[..40];
    let b_tail = format!("{}\n", &b[40..]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            upstream_sse(&[a_line.as_str(), b_head, b_tail.as_str()]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let response = app(Some(server.uri()))
        .oneshot(post(
            "/conversations/c1/messages:stream",
            json!({"content": "insert a title"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let frames = sse_frames(&body_text(response).await);
    let described: Vec<String> = frames
        .iter()
        .map(|(event, data)| match event.as_str() {
            "done" => "done".to_string(),
            _ if data["type"] == "agentToUi/taskStatus" => {
                format!("status:{}", data["payload"]["phase"].as_str().unwrap())
            }
            _ => format!("{}:{}", data["type"].as_str().unwrap(), data["id"].as_str().unwrap()),
        })
        .collect();

    assert_eq!(
        described,
        vec![
            "status:started",
            "status:streaming",
            "status:writing",
            "agentToUi/chatMessage:a",
            "status:template",
            "agentToUi/componentTemplate:b",
            "status:done",
            "done",
        ]
    );
}

#[tokio::test]
async fn stream_upstream_failure_reports_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let response = app(Some(server.uri()))
        .oneshot(post(
            "/conversations/c1/messages:stream",
            json!({"content": "hi", "responseMode": "text"}),
        ))
        .await
        .unwrap();

    let frames = sse_frames(&body_text(response).await);
    let last_two: Vec<&str> = frames[frames.len() - 2..]
        .iter()
        .map(|(event, _)| event.as_str())
        .collect();
    assert_eq!(last_two, vec!["msg", "done"]);
    let error = &frames[frames.len() - 2].1;
    assert_eq!(error["payload"]["code"], "upstream_error");
    assert!(error["payload"]["message"].as_str().unwrap().contains("overloaded"));
    assert_eq!(error["payload"]["details"]["status"], 503);
}
