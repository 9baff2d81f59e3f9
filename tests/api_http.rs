// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot; upstreams
// are a wiremock server.
//
// Covered:
// - GET /health
// - POST /collect (200, 400 bad mode, 409 busy, 422 nothing collected)
// - POST /collect/cancel when idle
// - GET /collect/status: per-source progress and the last run
// - GET /latest before and after a run

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value as Json};
use tower::ServiceExt as _; // for `oneshot`
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crypto_pulse::api::{self, AppState};
use crypto_pulse::ingest::fetcher::{RateLimitPolicy, RateLimitedFetcher};
use crypto_pulse::ingest::providers::{RedditCollector, RedditSettings};
use crypto_pulse::ingest::scheduler::CollectStatus;
use crypto_pulse::ingest::types::{SourceKind, SourceUnits};
use crypto_pulse::orchestrator::{FanOutOrchestrator, OrchestratorConfig};
use crypto_pulse::pipeline::{ModesConfig, Pipeline};
use crypto_pulse::reduce::{ContextReducer, ReductionConfig};
use crypto_pulse::summarizer::DisabledSummarizer;
use crypto_pulse::windows::{default_windows, WindowSet};

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

/// Pipeline with a Reddit collector pointed at `server`; no market client.
/// Progress ticks feed the state's status cell, as in the binary.
fn test_state(server: &MockServer) -> AppState {
    let status = CollectStatus::new();
    let fetcher = RateLimitedFetcher::with_client(reqwest::Client::new(), RateLimitPolicy::unthrottled("reddit"));
    let orchestrator = FanOutOrchestrator::new(OrchestratorConfig::default()).with_collector(Arc::new(
        RedditCollector::new(
            Arc::new(fetcher),
            RedditSettings {
                base_url: server.uri(),
                ..RedditSettings::default()
            },
        ),
    ))
    .with_progress(status.progress_fn());
    let pipeline = Pipeline::new(
        orchestrator,
        ContextReducer::new(ReductionConfig::default(), Arc::new(DisabledSummarizer)),
        WindowSet::new(default_windows()).unwrap(),
        ModesConfig::default(),
    );
    let units = SourceUnits::from([(SourceKind::Reddit, vec!["CryptoCurrency".to_string()])]);
    AppState::new(Arc::new(pipeline), units).with_status(status)
}

async fn mount_fresh_listing(server: &MockServer) {
    let created = chrono::Utc::now().timestamp() - 3_600;
    Mock::given(method("GET"))
        .and(path("/r/CryptoCurrency/hot.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "Listing",
            "data": { "after": null, "children": [
                { "kind": "t3", "data": { "title": "BTC reclaims 70k", "score": 120, "created_utc": created } }
            ]}
        })))
        .mount(server)
        .await;
}

fn post_json(uri: &str, body: Json) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Json) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::String(String::from_utf8_lossy(&bytes).into()));
    (status, v)
}

#[tokio::test]
async fn health_ok() {
    let server = MockServer::start().await;
    let app = api::router(test_state(&server));

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Json::String("OK".into()));
}

#[tokio::test]
async fn collect_then_latest() {
    let server = MockServer::start().await;
    mount_fresh_listing(&server).await;
    let app = api::router(test_state(&server));

    let (status, _) = send(&app, get("/latest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, post_json("/collect", json!({ "mode": "simple" }))).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["mode"], "simple");
    assert_eq!(body["context"]["kind"], "items");
    assert_eq!(body["context"]["items"][0]["text"], "BTC reclaims 70k");
    assert_eq!(body["stats"]["per_source"]["reddit"], 1);
    assert_eq!(body["market_context"], "MARKET CONTEXT: Data Unavailable.");

    let (status, latest) = send(&app, get("/latest")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest, body);
}

#[tokio::test]
async fn collect_rejects_unknown_mode() {
    let server = MockServer::start().await;
    let app = api::router(test_state(&server));

    let (status, body) = send(&app, post_json("/collect", json!({ "mode": "moonshot" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("moonshot"));

    let (status, _) = send(&app, post_json("/collect", json!({ "mode": "single_coin" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn collect_with_nothing_usable_is_422() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let app = api::router(test_state(&server));

    let (status, body) = send(&app, post_json("/collect", json!({ "mode": "hourly" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("no usable data"));

    // explicit empty list skips the source entirely
    let (status, _) = send(&app, post_json("/collect", json!({ "subreddits": [] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app, get("/latest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn one_run_at_a_time() {
    let server = MockServer::start().await;
    let state = test_state(&server);
    let app = api::router(state.clone());

    let (status, _) = send(&app, post_json("/collect/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let ticket = state.slot.try_begin().unwrap();
    let (status, _) = send(&app, post_json("/collect", json!({ "mode": "simple" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, post_json("/collect/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancelled"], true);
    assert!(ticket.abort().is_cancelled());
}

#[tokio::test]
async fn status_reports_progress_and_last_run() {
    let server = MockServer::start().await;
    mount_fresh_listing(&server).await;
    let app = api::router(test_state(&server));

    let (status, body) = send(&app, get("/collect/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["busy"], false);
    assert_eq!(body["progress"], json!({}));
    assert_eq!(body["last_run"], Json::Null);

    let (status, _) = send(&app, post_json("/collect", json!({ "mode": "simple" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, get("/collect/status")).await;
    assert_eq!(body["busy"], false);
    assert_eq!(body["progress"]["reddit"]["current"], 1);
    assert_eq!(body["progress"]["reddit"]["total"], 1);
    let last = &body["last_run"];
    assert_eq!(last["kept"], 1);
    assert_eq!(last["cancelled"], false);
    assert_eq!(last["warnings"], json!([]));
    assert!(last["finished_at"].is_string());
    assert!(last.get("error").is_none());
}

#[tokio::test]
async fn status_records_failed_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let app = api::router(test_state(&server));

    let (status, _) = send(&app, post_json("/collect", json!({ "mode": "hourly" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, body) = send(&app, get("/collect/status")).await;
    assert_eq!(body["progress"]["reddit"]["current"], 1);
    assert_eq!(body["last_run"]["kept"], 0);
    assert!(body["last_run"]["error"].as_str().unwrap().contains("no usable data"));
}
