mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{FakeShop, ScriptedReasoner, ShopProvider, orchestrator, wait_finished};
use persona_pilot::face::{AppState, router};
use persona_pilot::{JobId, Orchestrator};

fn app() -> (Router, Orchestrator) {
    let pilot = orchestrator(ScriptedReasoner::shopper(), ShopProvider::new(FakeShop::new()));
    let app = router(AppState {
        orchestrator: pilot.clone(),
    });
    (app, pilot)
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

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn submit(app: &Router) -> JobId {
    let response = app
        .clone()
        .oneshot(post(
            "/api/jobs",
            json!({"url": "https://shop.test/", "goal": "find a winter jacket", "max_steps": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    body["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_and_index() {
    let (app, _) = app();

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&bytes).contains("/api/jobs"));
}

#[tokio::test]
async fn submit_returns_created_job_id() {
    let (app, pilot) = app();
    let id = submit(&app).await;
    assert!(pilot.get(id).is_ok());
    wait_finished(&pilot.get(id).unwrap()).await;
}

#[tokio::test]
async fn submit_rejects_bad_address() {
    let (app, _) = app();
    let response = app
        .oneshot(post("/api/jobs", json!({"url": "mailto:someone", "goal": "find boots"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("http(s)"));
}

#[tokio::test]
async fn control_and_snapshot_round_trip() {
    let (app, pilot) = app();
    let id = submit(&app).await;
    wait_finished(&pilot.get(id).unwrap()).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/api/jobs/{}/control", id), json!({"command": "pause"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"job_id": id.to_string(), "status": "completed"})
    );

    let response = app.clone().oneshot(get(&format!("/api/jobs/{}", id))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["status"], "completed");
    assert_eq!(snapshot["goal"], "find a winter jacket");
    assert_eq!(snapshot["steps"].as_array().unwrap().len(), 3);
    assert_eq!(snapshot["context"]["search_submitted"], true);

    let response = app.oneshot(get("/api/jobs")).await.unwrap();
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["step_count"], 3);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let (app, _) = app();
    let missing = uuid::Uuid::new_v4();

    for request in [
        post(&format!("/api/jobs/{}/control", missing), json!({"command": "stop"})),
        get(&format!("/api/jobs/{}", missing)),
        get(&format!("/api/jobs/{}/events", missing)),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn unknown_control_command_is_rejected() {
    let (app, pilot) = app();
    let id = submit(&app).await;
    let response = app
        .oneshot(post(&format!("/api/jobs/{}/control", id), json!({"command": "rewind"})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    wait_finished(&pilot.get(id).unwrap()).await;
}

#[tokio::test]
async fn events_stream_starts_with_history() {
    let (app, pilot) = app();
    let id = submit(&app).await;
    wait_finished(&pilot.get(id).unwrap()).await;

    let response = app
        .oneshot(get(&format!("/api/jobs/{}/events", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let chunk = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(chunk.starts_with("event: history\n"), "{}", chunk);
    assert!(chunk.contains("\"status\":\"completed\""));
}

#[tokio::test]
async fn personas_are_listed() {
    let (app, _) = app();
    let response = app.oneshot(get("/api/personas")).await.unwrap();
    let names: Vec<String> = body_json(response)
        .await
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"default".to_string()));
    assert!(names.contains(&"senior".to_string()));
}
