mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{app, rig, wait_for_cycles};
use gridpilot::api::{create_router, AppState};
use gridpilot::coordinator::ControllerMode;
use gridpilot::{EmergencyReason, GracefulShutdown, ShutdownSignal};
use serde_json::{json, Value};
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-operator", "dana");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
    builder.body(body).unwrap()
}

#[tokio::test]
async fn query_endpoints_serve_controller_state() {
    let rig = rig(&app(ControllerMode::Alert));
    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));
    wait_for_cycles(&handle, 1).await;
    let router = create_router(AppState::new(handle, Some(TOKEN.to_string())));

    let (status, health) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mode"], "alert");
    assert_eq!(health["components"][0]["name"], "control_loop");

    let (status, risk) = send(&router, get("/api/risk")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(risk["level"], "normal");

    let (status, active) = send(&router, get("/api/levels/active")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active, json!([]));

    let (status, _) = send(&router, get("/api/scores/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = send(&router, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(stats["cycles"].as_u64().unwrap() >= 1);

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}

#[tokio::test]
async fn control_endpoints_require_the_admin_token() {
    let rig = rig(&app(ControllerMode::Alert));
    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));
    let router = create_router(AppState::new(handle, Some(TOKEN.to_string())));
    let body = json!({ "mode": "autonomous", "reason": "market open" });

    let (status, _) = send(&router, post("/api/mode", None, Some(body.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&router, post("/api/mode", Some("wrong"), Some(body.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, resp) = send(&router, post("/api/mode", Some(TOKEN), Some(body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["previous"], "alert");
    assert_eq!(resp["current"], "autonomous");

    let (_, records) = send(&router, get("/api/decisions?limit=1")).await;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["outcome"]["outcome"], "mode_changed");
    let reason = records[0]["outcome"]["reason"].as_str().unwrap();
    assert!(reason.contains("dana: market open"));

    let missing = format!("/api/pending/{}/confirm", uuid::Uuid::new_v4());
    let (status, _) = send(&router, post(&missing, Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, report) = send(&router, post("/api/cycle", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["mode"], "autonomous");

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}

#[tokio::test]
async fn emergency_shows_in_health_until_reset_while_disabled() {
    let rig = rig(&app(ControllerMode::Autonomous));
    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let emergency = rig.emergency.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));
    let router = create_router(AppState::new(handle, None));

    emergency
        .trigger(EmergencyReason::Manual("desk halt".into()))
        .await;
    let (status, health) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "emergency");
    assert_eq!(health["emergency"]["active"], true);

    // Reset needs disabled mode first.
    let (status, _) = send(&router, post("/api/emergency/reset", None, None)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let disable = json!({ "mode": "disabled" });
    let (status, _) = send(&router, post("/api/mode", None, Some(disable))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, resp) = send(&router, post("/api/emergency/reset", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["message"], "emergency latch cleared by dana");

    let (status, health) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["emergency"]["active"], false);
    assert_eq!(health["mode"], "disabled");

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}
