//! Integration tests for the stagegate HTTP API.
//!
//! Uses axum-test to drive the router without binding a socket.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::{TestRequest, TestServer};
use serde_json::{Value, json};
use stagegate::api::{AppState, ErrorBody, HealthResponse, create_router};
use stagegate::config::Config;
use stagegate_core::MemoryStore;
use std::sync::Arc;

const LEAD: &str = "lead-key-0001";
const FRAME_OP: &str = "frame-key-0002";

const TEST_CONFIG: &str = r#"
[server]
rate_limit = 0

[token]
secret = "integration-test-secret-0123456789abcdef"

[[stages]]
index = 0
name = "KB"

[[stages]]
index = 1
name = "Frame"

[[stages]]
index = 2
name = "Foam"
allows_parallel_work = true

[[stages]]
index = 3
name = "Sew"

[[stages]]
index = 4
name = "Assemble"

[[requirements]]
stage = "Frame"
material = "Plywood"
quantity = 5
unit = "sheet"

[[requirements]]
stage = "Foam"
material = "Foam-35"
quantity = 10
unit = "sheet"

[[stock]]
material = "Plywood"
quantity = 5

[[stock]]
material = "Foam-35"
quantity = 6

[[operators]]
id = "lead"
api_key = "lead-key-0001"
can_generate_checkpoint = true
can_confirm = true
can_return_orders = true

[[operators]]
id = "frame-op"
api_key = "frame-key-0002"
can_confirm = true
stage = "Frame"
"#;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn create_test_server() -> TestServer {
    let config = Config::parse(TEST_CONFIG).unwrap();
    let runtime = config.build(Arc::new(MemoryStore::new())).unwrap();
    let state = AppState::new(runtime.engine, runtime.stock, runtime.operators);
    TestServer::new(create_router(state, &config.server)).unwrap()
}

fn as_operator(request: TestRequest, key: &str) -> TestRequest {
    request.add_header(
        header::AUTHORIZATION,
        format!("Bearer {key}").parse::<HeaderValue>().unwrap(),
    )
}

async fn register(server: &TestServer, order: u64, stage: &str) {
    as_operator(server.post("/orders"), LEAD)
        .json(&json!({ "order_id": order, "stage": stage }))
        .await
        .assert_status_ok();
}

async fn handoff(server: &TestServer, order: u64, target: &str) -> axum_test::TestResponse {
    as_operator(server.post(&format!("/orders/{order}/handoff")), LEAD)
        .json(&json!({ "target_stage": target }))
        .await
}

async fn confirm(server: &TestServer, key: &str, token: &str) -> axum_test::TestResponse {
    as_operator(server.post("/checkpoints/confirm"), key)
        .json(&json!({ "token": token }))
        .await
}

// =============================================================================
// HEALTH / AUTH
// =============================================================================

#[tokio::test]
async fn test_health_needs_no_key() {
    let server = create_test_server();
    let response = server.get("/health").await;
    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let server = create_test_server();
    let response = server.get("/stages").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: ErrorBody = response.json();
    assert!(!body.success);
    assert_eq!(body.code, "unauthenticated");
}

#[tokio::test]
async fn test_wrong_key_is_unauthorized() {
    let server = create_test_server();
    let response = as_operator(server.get("/stages"), "lead-key-000").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_stages_lists_pipeline() {
    let server = create_test_server();
    let response = as_operator(server.get("/stages"), FRAME_OP).await;
    response.assert_status_ok();
    let body: Value = response.json();
    let names: Vec<&str> = body["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["KB", "Frame", "Foam", "Sew", "Assemble"]);
    assert_eq!(body["stages"][2]["allows_parallel_work"], true);
}

// =============================================================================
// CHECKPOINT FLOW
// =============================================================================

#[tokio::test]
async fn test_handoff_confirm_and_replay() {
    let server = create_test_server();
    register(&server, 1, "KB").await;

    let issued = handoff(&server, 1, "Frame").await;
    issued.assert_status_ok();
    let issued: Value = issued.json();
    assert_eq!(issued["success"], true);
    assert_eq!(issued["outcome"], "issued");
    let raw = issued["raw"].as_str().unwrap().to_string();

    let confirmed = confirm(&server, FRAME_OP, &raw).await;
    confirmed.assert_status_ok();
    let confirmed: Value = confirmed.json();
    assert_eq!(confirmed["outcome"], "confirmed");
    assert_eq!(confirmed["position"], json!({ "at_stage": { "stage": 1 } }));

    let replay = confirm(&server, FRAME_OP, &raw).await;
    assert_eq!(replay.status_code(), StatusCode::CONFLICT);
    let body: ErrorBody = replay.json();
    assert_eq!(body.code, "token_already_consumed");

    let transfers: Value = as_operator(server.get("/orders/1/transfers"), LEAD).await.json();
    let statuses: Vec<&str> = transfers["transfers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, ["pending", "confirmed"]);
}

#[tokio::test]
async fn test_scan_code_confirms() {
    let server = create_test_server();
    register(&server, 7, "KB").await;
    let issued: Value = handoff(&server, 7, "Frame").await.json();
    let scan_code = issued["scan_code"].as_str().unwrap().to_string();

    confirm(&server, LEAD, &scan_code).await.assert_status_ok();
}

#[tokio::test]
async fn test_verify_does_not_consume() {
    let server = create_test_server();
    register(&server, 2, "KB").await;
    let issued: Value = handoff(&server, 2, "Frame").await.json();
    let raw = issued["raw"].as_str().unwrap().to_string();

    let verified = as_operator(server.post("/checkpoints/verify"), FRAME_OP)
        .json(&json!({ "token": raw }))
        .await;
    verified.assert_status_ok();
    let verified: Value = verified.json();
    assert_eq!(verified["state"], "active");
    assert_eq!(verified["order_id"], 2);

    confirm(&server, FRAME_OP, &raw).await.assert_status_ok();
}

#[tokio::test]
async fn test_tampered_token_rejected() {
    let server = create_test_server();
    register(&server, 3, "KB").await;
    let issued: Value = handoff(&server, 3, "Frame").await.json();
    let forged = issued["raw"]
        .as_str()
        .unwrap()
        .replace("\"orderId\":3", "\"orderId\":4");

    let response = confirm(&server, LEAD, &forged).await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "tampered_token");
}

#[tokio::test]
async fn test_station_cannot_confirm_other_stage() {
    let server = create_test_server();
    register(&server, 4, "Foam").await;
    let issued: Value = handoff(&server, 4, "Sew").await.json();
    let raw = issued["raw"].as_str().unwrap().to_string();

    let response = confirm(&server, FRAME_OP, &raw).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "stage_restricted");
}

#[tokio::test]
async fn test_station_cannot_request_handoff() {
    let server = create_test_server();
    register(&server, 5, "KB").await;
    let response = as_operator(server.post("/orders/5/handoff"), FRAME_OP)
        .json(&json!({ "target_stage": "Frame" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "unauthorized");
}

// =============================================================================
// MATERIAL GATE
// =============================================================================

#[tokio::test]
async fn test_shortage_returns_conflict_with_report() {
    let server = create_test_server();
    register(&server, 10, "Frame").await;

    let response = handoff(&server, 10, "Foam").await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "blocked");
    assert_eq!(body["outcome"], "blocked");
    assert_eq!(body["shortages"][0]["material_name"], "Foam-35");
    assert_eq!(body["shortages"][0]["missing"], "4");

    let order: Value = as_operator(server.get("/orders/10"), LEAD).await.json();
    assert_eq!(order["position"], json!({ "at_stage": { "stage": 1 } }));
    assert_eq!(order["active_token"], Value::Null);
}

#[tokio::test]
async fn test_order_materials_change_the_gate() {
    let server = create_test_server();
    register(&server, 15, "Frame").await;

    let response = as_operator(server.put("/orders/15/materials"), LEAD)
        .json(&json!({ "materials": [{ "material": "foam 35", "quantity": "3.5" }] }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["materials"]["Foam-35"], "3.5");

    handoff(&server, 15, "Foam").await.assert_status_ok();
}

#[tokio::test]
async fn test_order_materials_rejects_bad_lines() {
    let server = create_test_server();
    register(&server, 16, "Frame").await;

    let unknown = as_operator(server.put("/orders/16/materials"), LEAD)
        .json(&json!({ "materials": [{ "material": "Velvet", "quantity": 1 }] }))
        .await;
    assert_eq!(unknown.status_code(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = unknown.json();
    assert_eq!(body.code, "invalid_field");

    let negative = as_operator(server.put("/orders/16/materials"), LEAD)
        .json(&json!({ "materials": [{ "material": "Foam-35", "quantity": -2 }] }))
        .await;
    assert_eq!(negative.status_code(), StatusCode::BAD_REQUEST);

    let station = as_operator(server.put("/orders/16/materials"), FRAME_OP)
        .json(&json!({ "materials": [] }))
        .await;
    assert_eq!(station.status_code(), StatusCode::FORBIDDEN);

    let missing = as_operator(server.put("/orders/999/materials"), LEAD)
        .json(&json!({ "materials": [] }))
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    // The order still needs the stage's 10 sheets.
    let blocked = handoff(&server, 16, "Foam").await;
    assert_eq!(blocked.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_blocks_listing_and_resolution() {
    let server = create_test_server();
    register(&server, 11, "Frame").await;
    let _ = handoff(&server, 11, "Foam").await;

    let listed: Value = as_operator(server.get("/blocks?order_id=11"), LEAD).await.json();
    let blocks = listed["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 1);
    let id = blocks[0]["id"].as_u64().unwrap();

    let resolved = as_operator(server.post(&format!("/blocks/{id}/resolve")), LEAD)
        .json(&json!({ "notes": "delivery arrived" }))
        .await;
    resolved.assert_status_ok();
    let resolved: Value = resolved.json();
    assert_eq!(resolved["block"]["status"], "resolved");

    let again = as_operator(server.post(&format!("/blocks/{id}/ignore")), LEAD)
        .json(&json!({}))
        .await;
    assert_eq!(again.status_code(), StatusCode::CONFLICT);

    let active: Value = as_operator(server.get("/blocks?order_id=11"), LEAD).await.json();
    assert!(active["blocks"].as_array().unwrap().is_empty());
    let all: Value = as_operator(server.get("/blocks?order_id=11&status=all"), LEAD).await.json();
    assert_eq!(all["blocks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bad_block_status_filter() {
    let server = create_test_server();
    let response = as_operator(server.get("/blocks?status=closed"), LEAD).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// READY / REWORK / SHIP
// =============================================================================

#[tokio::test]
async fn test_ready_then_ship_twice() {
    let server = create_test_server();
    register(&server, 20, "Assemble").await;

    let ready = as_operator(server.post("/orders/20/ready"), LEAD)
        .json(&json!({ "notes": "final check done" }))
        .await;
    ready.assert_status_ok();
    let ready: Value = ready.json();
    assert_eq!(ready["outcome"], "ready_to_ship");

    let shipped: Value = as_operator(server.post("/orders/20/ship"), LEAD).await.json();
    assert_eq!(shipped["outcome"], "shipped");

    let again = as_operator(server.post("/orders/20/ship"), LEAD).await;
    again.assert_status_ok();
    let again: Value = again.json();
    assert_eq!(again["outcome"], "already_shipped");
}

#[tokio::test]
async fn test_rework_moves_back() {
    let server = create_test_server();
    register(&server, 21, "Sew").await;

    let response = as_operator(server.post("/orders/21/rework"), LEAD)
        .json(&json!({ "from_stage": "Sew", "to_stage": "Foam", "reason": "wrong density" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["position"], json!({ "at_stage": { "stage": 2 } }));
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let server = create_test_server();
    let response = as_operator(server.get("/orders/999"), LEAD).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "unknown_order");
}

#[tokio::test]
async fn test_unknown_stage_name_is_not_found() {
    let server = create_test_server();
    register(&server, 30, "KB").await;
    let response = handoff(&server, 30, "Paint").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
