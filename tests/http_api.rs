use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use slotserve::inference::mock;
use slotserve::server::{create_router, AppState};
use tower::ServiceExt;

/// Cells taken by the first "Hi" prompt: template bytes plus BOS.
const HI_PROMPT_CELLS: u32 = "<|user|>Hi\n<|assistant|>".len() as u32 + 1;

fn test_state(capacity: u32, replies: &[&str]) -> AppState {
    let metrics = mock::metrics();
    let engine = mock::spawn(capacity, replies, metrics.clone()).unwrap();
    AppState::new(engine, metrics)
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    raw_request(uri, serde_json::to_string(&body).unwrap())
}

fn raw_request(uri: &str, body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, String) {
    let resp = create_router(state.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn send_json(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(state, req).await;
    let json = serde_json::from_str(&body).unwrap_or_else(|_| panic!("not JSON: {body}"));
    (status, json)
}

/// `data:` payloads and `event:` names in order, one entry per SSE event
fn sse_events(body: &str) -> Vec<(Option<String>, String)> {
    body.split("\n\n")
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            let mut event = None;
            let mut data = Vec::new();
            for line in chunk.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = Some(name.to_string());
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data.push(value);
                }
            }
            (event, data.join("\n"))
        })
        .collect()
}

// -- Health endpoint --

#[tokio::test]
async fn health_reports_idle_slot_and_model() {
    let state = test_state(512, &["ok"]);
    let (status, json) = send_json(&state, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["slot"]["state"], "idle");
    assert_eq!(json["model"]["context_size"], 512);
    assert!(json["started_at"].is_string());
}

// -- Completions (non-streaming) --

#[tokio::test]
async fn completion_non_streaming() {
    let state = test_state(512, &["Hello back"]);
    let (status, json) = send_json(&state, json_request("/completion", json!({"prompt": "Hello"}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["response"], "Hello back");
    assert_eq!(json["finish_reason"], "stop");
    assert_eq!(json["generated_tokens"], 10);
    assert!(json["prompt_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn root_path_serves_completions_and_keeps_history() {
    let state = test_state(512, &["one", "two"]);

    let (_, first) = send_json(&state, json_request("/", json!({"prompt": "a", "stream": false}))).await;
    let (_, second) = send_json(&state, json_request("/", json!({"prompt": "b"}))).await;

    assert_eq!(first["response"], "one");
    assert_eq!(second["response"], "two");
    // The second prompt only carries the new part of the conversation.
    let delta = "<|user|>b\n<|assistant|>".len() as u64;
    assert_eq!(second["prompt_tokens"].as_u64().unwrap(), delta);
}

#[tokio::test]
async fn missing_prompt_is_rejected() {
    let state = test_state(512, &["unused"]);
    let (status, json) = send_json(&state, json_request("/completion", json!({"stream": true}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        json,
        json!({"error": {"message": "Missing prompt field", "type": 400, "code": 400}})
    );
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let state = test_state(512, &["unused"]);
    let (status, json) = send_json(&state, raw_request("/completion", "{\"prompt\": ")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["message"], "Invalid JSON");
    assert_eq!(json["error"]["code"], 400);
}

#[tokio::test]
async fn prompt_larger_than_context_fails_with_error_body() {
    let state = test_state(8, &["never"]);
    let (status, json) = send_json(&state, json_request("/completion", json!({"prompt": "Hello"}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], 400);
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Context size exceeded"));

    let (_, metrics) = send_json(&state, get("/metrics")).await;
    assert_eq!(metrics["data"]["total_requests"], 1);
    assert_eq!(metrics["data"]["failed_requests"], 1);
    assert_eq!(metrics["data"]["slot_state"], "error");
}

#[tokio::test]
async fn server_recovers_after_oversized_prompt() {
    let state = test_state(64, &["ok"]);

    let (status, _) = send_json(&state, json_request("/completion", json!({"prompt": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);

    let oversized = json!({"prompt": "x".repeat(200)});
    let (status, json) = send_json(&state, json_request("/completion", oversized)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], 400);

    let (status, json) = send_json(&state, json_request("/completion", json!({"prompt": "yo"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["response"], "ok");
    assert_eq!(
        json["prompt_tokens"].as_u64().unwrap(),
        "<|user|>yo\n<|assistant|>".len() as u64
    );

    let (_, health) = send_json(&state, get("/health")).await;
    assert_eq!(health["slot"]["state"], "idle");
}

// -- Completions (streaming) --

#[tokio::test]
async fn streaming_sends_fragments_then_done() {
    let state = test_state(512, &["abc"]);
    let req = json_request("/completion", json!({"prompt": "Hi", "stream": true}));
    let resp = create_router(state.clone()).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let events = sse_events(&String::from_utf8(body.to_vec()).unwrap());
    let expected: Vec<(Option<String>, String)> = ["a", "b", "c", "[DONE]"]
        .iter()
        .map(|d| (None, d.to_string()))
        .collect();
    assert_eq!(events, expected);
}

#[tokio::test]
async fn streaming_context_exhaustion_ends_with_error_event() {
    let state = test_state(HI_PROMPT_CELLS + 2, &["abcdef"]);
    let (status, body) = send(
        &state,
        json_request("/completion", json!({"prompt": "Hi", "stream": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let data: Vec<&str> = events.iter().map(|(_, d)| d.as_str()).collect();
    assert_eq!(&data[..3], &["a", "b", "c"]);

    let (event, message) = events.last().unwrap();
    assert_eq!(event.as_deref(), Some("error"));
    assert!(message.starts_with("Context size exceeded"));
    assert!(!body.contains("[DONE]"));
}

// -- Metrics --

#[tokio::test]
async fn metrics_report_completed_requests() {
    let state = test_state(512, &["four"]);
    let (_, fresh) = send_json(&state, get("/metrics")).await;
    assert_eq!(fresh["status"], "success");
    assert_eq!(fresh["data"]["total_requests"], 0);
    assert_eq!(fresh["data"]["success_rate"], 0.0);

    send(&state, json_request("/completion", json!({"prompt": "Hi"}))).await;

    let (status, json) = send_json(&state, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let data = &json["data"];
    assert_eq!(data["total_requests"], 1);
    assert_eq!(data["failed_requests"], 0);
    assert_eq!(data["success_rate"], 1.0);
    assert_eq!(data["total_generated_tokens"], 4);
    assert_eq!(data["total_prompt_tokens"], HI_PROMPT_CELLS);
    assert_eq!(data["total_decode_calls"], 4);
    assert_eq!(data["kv_cache_used_cells"], HI_PROMPT_CELLS + 4);
    assert_eq!(data["slot_state"], "idle");
    assert!(data["uptime_seconds"].as_f64().unwrap() >= 0.0);
}

// -- CORS --

#[tokio::test]
async fn cors_preflight_is_allowed() {
    let state = test_state(512, &["unused"]);
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/completion")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let resp = create_router(state).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
