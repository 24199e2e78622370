//! HTTP boundary tests: routing, error bodies, and SSE framing.

mod common;

use std::sync::Arc;

use actix_web::{test, web, App};

use common::{bind, BatchMode, MockDriver};
use manifold::config::Config;
use manifold::core::registry::DriverRegistry;
use manifold::server::{routes, AppState};
use manifold::storage::Store;

async fn app_state(registry: Arc<DriverRegistry>) -> web::Data<AppState> {
    let store = Store::open_in_memory().await.unwrap();
    web::Data::new(AppState::new(Arc::new(Config::default()), registry, store))
}

#[actix_web::test]
async fn ping_answers() {
    let registry = Arc::new(DriverRegistry::new(Arc::new(Config::default())));
    let app = test::init_service(
        App::new()
            .app_data(app_state(registry).await)
            .configure(routes::configure),
    )
    .await;
    let resp = test::call_service(&app, test::TestRequest::get().uri("/v1/ping").to_request()).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn unknown_model_maps_to_invalid_request() {
    let registry = Arc::new(DriverRegistry::new(Arc::new(Config::default())));
    let app = test::init_service(
        App::new()
            .app_data(app_state(registry).await)
            .configure(routes::configure),
    )
    .await;
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(serde_json::json!({
            "model": "nonesuch",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("not found"));
}

#[actix_web::test]
async fn models_lists_configured_union() {
    let config: Config = serde_yaml::from_str(
        r#"
providers:
  - driver: openai
    name: openai
    models:
      - name: gpt-4o-mini
        alias: [mini]
  - driver: anthropic
    name: anthropic
    models:
      - name: claude-3-5-haiku
"#,
    )
    .unwrap();
    let config = Arc::new(config);
    let registry = Arc::new(DriverRegistry::new(config.clone()));
    let store = Store::open_in_memory().await.unwrap();
    let state = web::Data::new(AppState::new(config, registry, store));
    let app = test::init_service(App::new().app_data(state).configure(routes::configure)).await;

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/v1/models").to_request()).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["gpt-4o-mini", "claude-3-5-haiku"]);
    assert_eq!(body["data"][0]["parent"], "mini");
}

#[actix_web::test]
async fn streaming_chat_frames_as_sse() {
    let registry = Arc::new(DriverRegistry::new(Arc::new(Config::default())));
    let mock = MockDriver::new(BatchMode::Refuse);
    bind(&registry, "streamer", false, &mock, false);
    let app = test::init_service(
        App::new()
            .app_data(app_state(registry).await)
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(serde_json::json!({
            "model": "streamer",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = test::read_body(resp).await;
    let body = std::str::from_utf8(&body).unwrap();

    let frames: Vec<&str> = body
        .split("\n\n")
        .filter(|f| !f.trim().is_empty())
        .collect();
    assert!(frames.iter().all(|f| f.starts_with("data: ")));
    assert!(body.ends_with("data: [DONE]\n"));

    // two content chunks and a usage trailer precede the stop sentinel
    let chunks: Vec<serde_json::Value> = frames
        .iter()
        .filter(|f| !f.contains("[DONE]"))
        .map(|f| serde_json::from_str(f.trim_start_matches("data: ").trim()).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "pong");
    assert!(chunks.iter().any(|c| c["usage"]["total_tokens"].as_u64() == Some(8)));
    assert!(chunks
        .iter()
        .any(|c| c["choices"][0]["finish_reason"].as_str() == Some("stop")));
}

#[actix_web::test]
async fn wrong_upload_purpose_is_not_implemented() {
    let registry = Arc::new(DriverRegistry::new(Arc::new(Config::default())));
    let app = test::init_service(
        App::new()
            .app_data(app_state(registry).await)
            .configure(routes::configure),
    )
    .await;

    let boundary = "----batchboundary";
    let payload = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"purpose\"\r\n\r\nfine-tune\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"b.jsonl\"\r\n\r\n{{}}\r\n\
         --{boundary}--\r\n"
    );
    let req = test::TestRequest::post()
        .uri("/v1/files")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        ))
        .set_payload(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_IMPLEMENTED);
}
