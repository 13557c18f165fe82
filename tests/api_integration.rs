//! Integration tests for the CAD console API.
//!
//! These tests drive the full request/response cycle through the HTTP API
//! against an in-memory store.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum_test::{TestRequest, TestServer};
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use cad_console::api::{AppState, SESSION_HEADER, router};
use cad_console::roles::{LoginRequest, Role, SessionStore};
use cad_console::storage::Storage;

const SUPERVISOR_KEY: &str = "test-key";

async fn create_state() -> AppState {
    let storage = Storage::new("sqlite::memory:", "T1S1").await.unwrap();
    AppState {
        storage,
        sessions: SessionStore::new(Some(SUPERVISOR_KEY.to_string())),
    }
}

async fn create_test_server() -> TestServer {
    TestServer::new(router(create_state().await)).unwrap()
}

fn with_session(request: TestRequest, token: &str) -> TestRequest {
    request.add_header(
        HeaderName::from_static(SESSION_HEADER),
        HeaderValue::from_str(token).unwrap(),
    )
}

async fn login(server: &TestServer, identifier: &str, role: &str) -> String {
    let mut body = json!({ "identifier": identifier, "role": role });
    if role == "supervisor" {
        body["credential"] = json!(SUPERVISOR_KEY);
    }

    let response = server.post("/session").json(&body).await;
    response.assert_status(StatusCode::CREATED);

    let body: Value = response.json();
    body["token"].as_str().unwrap().to_string()
}

async fn create_call(server: &TestServer, token: &str, call_type: &str) -> Value {
    let response = with_session(server.post("/incidents"), token)
        .json(&json!({
            "type": call_type,
            "location": "5th & Main",
            "priority": "high"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

async fn dashboard(server: &TestServer, token: &str) -> Value {
    let response = with_session(server.get("/dashboard"), token).await;
    response.assert_status_ok();
    response.json()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_unit_login_starts_shift() {
    let server = create_test_server().await;

    let response = server
        .post("/session")
        .json(&json!({ "identifier": "12", "role": "unit" }))
        .await;
    response.assert_status(StatusCode::CREATED);

    let body: Value = response.json();
    assert_eq!(body["dashboard"], "unit");
    assert_eq!(body["serverId"], "T1S1");
    let capabilities = body["capabilities"].as_array().unwrap();
    assert!(capabilities.contains(&json!("complete_call")));
    assert!(!capabilities.contains(&json!("assign_unit")));

    let dispatch = login(&server, "Alex", "dispatch").await;
    let view = dashboard(&server, &dispatch).await;
    assert_eq!(view["kind"], "dispatch");
    assert_eq!(view["units"][0]["unitNumber"], "12");
    assert_eq!(view["units"][0]["status"], "available");
    assert_eq!(view["availableUnits"], json!(["12"]));
}

#[tokio::test]
async fn test_supervisor_login_checks_credential() {
    let server = create_test_server().await;

    server
        .post("/session")
        .json(&json!({ "identifier": "Sgt", "role": "supervisor" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post("/session")
        .json(&json!({ "identifier": "Sgt", "role": "supervisor", "credential": "supervisor" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let token = login(&server, "Sgt", "supervisor").await;
    let view = dashboard(&server, &token).await;
    assert_eq!(view["kind"], "supervisor");
    assert!(view["overview"]["shift"].is_string());
}

#[tokio::test]
async fn test_requests_without_session_rejected() {
    let server = create_test_server().await;

    server
        .get("/dashboard")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    with_session(server.get("/dashboard"), "not-a-token")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dispatch_workflow() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;

    // 1. Dispatch opens two calls
    let first = create_call(&server, &dispatch, "Burglary").await;
    assert_eq!(first["status"], "pending");
    assert_eq!(first["respondingCode"], 2);
    let second = create_call(&server, &dispatch, "Noise Complaint").await;
    let first_id = first["id"].as_str().unwrap();
    let second_id = second["id"].as_str().unwrap();

    // 2. The unit may not assign itself
    with_session(server.post(&format!("/incidents/{first_id}/assign")), &unit)
        .json(&json!({ "unit": "12" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    // 3. Dispatch assigns the unit
    let response = with_session(server.post(&format!("/incidents/{first_id}/assign")), &dispatch)
        .json(&json!({ "unit": "12" }))
        .await;
    response.assert_status_ok();
    let assigned: Value = response.json();
    assert_eq!(assigned["status"], "dispatched");
    assert_eq!(assigned["assignedUnits"], json!(["12"]));

    // 4. A second dispatched call for the same unit is refused
    with_session(server.post(&format!("/incidents/{second_id}/assign")), &dispatch)
        .json(&json!({ "unit": "12" }))
        .await
        .assert_status(StatusCode::CONFLICT);

    // 5. The unit sees its active call
    let view = dashboard(&server, &unit).await;
    assert_eq!(view["kind"], "unit");
    assert_eq!(view["activeIncident"]["id"], first_id);
    assert_eq!(view["unit"]["status"], "busy");

    // 6. The unit completes the call
    let response = with_session(server.post(&format!("/incidents/{first_id}/complete")), &unit).await;
    response.assert_status_ok();
    let resolved: Value = response.json();
    assert_eq!(resolved["status"], "resolved");

    let view = dashboard(&server, &dispatch).await;
    assert_eq!(view["recentlyResolved"].as_array().unwrap().len(), 1);
    assert_eq!(view["pending"].as_array().unwrap().len(), 1);
    assert_eq!(view["availableUnits"], json!(["12"]));

    let view = dashboard(&server, &unit).await;
    assert!(view["activeIncident"].is_null());
    assert_eq!(view["pastCalls"][0]["id"], first_id);
}

#[tokio::test]
async fn test_pending_call_cannot_be_closed() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let call = create_call(&server, &dispatch, "Alarm").await;
    let id = call["id"].as_str().unwrap();

    with_session(server.post(&format!("/incidents/{id}/close")), &dispatch)
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_pending_call_can_be_removed() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;
    let prank = create_call(&server, &dispatch, "Prank").await;
    let duplicate = create_call(&server, &dispatch, "Duplicate").await;
    let prank_id = prank["id"].as_str().unwrap();
    let duplicate_id = duplicate["id"].as_str().unwrap();

    with_session(server.post(&format!("/incidents/{duplicate_id}/assign")), &dispatch)
        .json(&json!({ "unit": "12" }))
        .await
        .assert_status_ok();

    with_session(server.delete(&format!("/incidents/{prank_id}")), &unit)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    with_session(server.delete(&format!("/incidents/{prank_id}")), &dispatch)
        .await
        .assert_status(StatusCode::NO_CONTENT);
    with_session(server.delete(&format!("/incidents/{duplicate_id}")), &dispatch)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let view = dashboard(&server, &dispatch).await;
    assert!(view["pending"].as_array().unwrap().is_empty());
    assert!(view["active"].as_array().unwrap().is_empty());
    assert_eq!(view["availableUnits"], json!(["12"]));

    with_session(server.delete(&format!("/incidents/{prank_id}")), &dispatch)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resolved_call_rejects_changes() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;
    let call = create_call(&server, &unit, "Traffic Stop").await;
    let id = call["id"].as_str().unwrap();

    with_session(server.post(&format!("/incidents/{id}/complete")), &unit)
        .await
        .assert_status_ok();

    with_session(server.post(&format!("/incidents/{id}/code-red")), &dispatch)
        .await
        .assert_status(StatusCode::CONFLICT);
    with_session(server.post(&format!("/incidents/{id}/responding-code")), &dispatch)
        .json(&json!({ "code": 3 }))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_panic_flags_active_call() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "7", "unit").await;
    login(&server, "8", "unit").await;

    let call = create_call(&server, &unit, "Traffic Stop").await;
    assert_eq!(call["status"], "dispatched");

    with_session(server.post("/units/me/status"), &unit)
        .json(&json!({ "status": "panic" }))
        .await
        .assert_status_ok();

    let view = dashboard(&server, &dispatch).await;
    assert_eq!(view["summary"]["panicCount"], 1);
    assert_eq!(view["units"][0]["unitNumber"], "7");
    assert_eq!(view["units"][0]["activeIncidentId"], call["id"]);
    assert_eq!(view["active"][0]["panicStatus"], true);
    assert_eq!(view["active"][0]["notes"][0]["type"], "panic");
}

#[tokio::test]
async fn test_unknown_status_rejected() {
    let server = create_test_server().await;
    let unit = login(&server, "7", "unit").await;

    let response = with_session(server.post("/units/me/status"), &unit)
        .json(&json!({ "status": "lunch" }))
        .await;

    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn test_responding_code_bounds() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let call = create_call(&server, &dispatch, "Fire").await;
    let id = call["id"].as_str().unwrap();

    with_session(server.post(&format!("/incidents/{id}/responding-code")), &dispatch)
        .json(&json!({ "code": 3 }))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let response = with_session(server.post(&format!("/incidents/{id}/responding-code")), &dispatch)
        .json(&json!({ "code": 5 }))
        .await;
    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn test_bolo_board_expires_at_read_time() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;

    with_session(server.post("/bolos"), &dispatch)
        .json(&json!({
            "type": "vehicle",
            "title": "Grey van",
            "priority": "high"
        }))
        .await
        .assert_status(StatusCode::CREATED);

    with_session(server.post("/bolos"), &dispatch)
        .json(&json!({
            "type": "person",
            "title": "Suspect in red jacket",
            "expiresAt": Utc::now() - Duration::hours(1)
        }))
        .await
        .assert_status(StatusCode::CREATED);

    let response = with_session(server.get("/bolos"), &dispatch).await;
    response.assert_status_ok();

    let board: Value = response.json();
    assert_eq!(board["active"].as_array().unwrap().len(), 1);
    assert_eq!(board["active"][0]["title"], "Grey van");
    assert_eq!(board["expired"].as_array().unwrap().len(), 1);
    // Stored status is untouched.
    assert_eq!(board["expired"][0]["status"], "active");
}

#[tokio::test]
async fn test_radio_channels() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;

    with_session(server.post("/radio/tac1"), &unit)
        .json(&json!({ "message": "10-8" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let response = with_session(server.post("/units/me/channels/tac1"), &unit).await;
    response.assert_status_ok();
    let channels: Value = response.json();
    assert_eq!(channels, json!(["dispatch", "tac1"]));

    let response = with_session(server.post("/radio/tac1"), &unit)
        .json(&json!({ "message": "10-8" }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let sent: Value = response.json();
    assert_eq!(sent["unitNumber"], "12");
    let message_id = sent["id"].as_str().unwrap();

    with_session(server.post("/radio/tac1"), &dispatch)
        .json(&json!({ "message": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    with_session(server.get("/radio/tac9"), &dispatch)
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let response = with_session(server.get("/radio/tac1"), &dispatch).await;
    response.assert_status_ok();
    let messages: Value = response.json();
    assert_eq!(messages.as_array().unwrap().len(), 1);

    with_session(server.delete(&format!("/radio/messages/{message_id}")), &unit)
        .await
        .assert_status(StatusCode::FORBIDDEN);
    with_session(server.delete(&format!("/radio/messages/{message_id}")), &dispatch)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let messages: Value = with_session(server.get("/radio/tac1"), &dispatch).await.json();
    assert!(messages.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_kick_ends_unit_session() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;

    with_session(server.post("/units/12/kick"), &unit)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    with_session(server.post("/units/12/kick"), &dispatch)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    with_session(server.get("/dashboard"), &unit)
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let view = dashboard(&server, &dispatch).await;
    assert!(view["units"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_force_status_supervisor_only() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let supervisor = login(&server, "Sgt", "supervisor").await;
    login(&server, "12", "unit").await;

    with_session(server.post("/units/12/force-status"), &dispatch)
        .json(&json!({ "status": "out_of_service" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let response = with_session(server.post("/units/12/force-status"), &supervisor)
        .json(&json!({ "status": "out_of_service", "reason": "Vehicle damage" }))
        .await;
    response.assert_status_ok();

    let unit: Value = response.json();
    assert_eq!(unit["status"], "out_of_service");
    assert_eq!(unit["lastStatusUpdate"]["by"], "supervisor");
    assert_eq!(unit["lastStatusUpdate"]["reason"], "Vehicle damage");

    with_session(server.post("/units/99/force-status"), &supervisor)
        .json(&json!({ "status": "busy" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_shift_log_and_logout() {
    let server = create_test_server().await;
    let dispatch = login(&server, "Alex", "dispatch").await;
    let unit = login(&server, "12", "unit").await;

    with_session(server.post("/shift-log"), &unit)
        .json(&json!({ "description": "Fuel stop" }))
        .await
        .assert_status(StatusCode::CREATED);
    with_session(server.post("/units/me/break"), &unit)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let log: Value = with_session(server.get("/shift-log"), &unit).await.json();
    let descriptions: Vec<&str> = log
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["description"].as_str().unwrap())
        .collect();
    assert!(descriptions.contains(&"Unit initialized and started shift"));
    assert!(descriptions.contains(&"Fuel stop"));
    assert!(descriptions.contains(&"Break started"));

    with_session(server.get("/shift-log"), &dispatch)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    with_session(server.delete("/session"), &unit)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let view = dashboard(&server, &dispatch).await;
    assert!(view["units"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_dashboard_stream_releases_subscriptions() {
    let state = create_state().await;
    let storage = state.storage.clone();
    let session = tokio_test::assert_ok!(
        state
            .sessions
            .login(
                &LoginRequest {
                    identifier: "Alex".to_string(),
                    role: Role::Dispatch,
                    credential: None,
                },
                Utc::now(),
            )
            .await
    );

    let request = Request::builder()
        .uri("/dashboard/stream")
        .header(SESSION_HEADER, session.token.as_str())
        .body(Body::empty())
        .unwrap();
    let response = router(state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        HeaderValue::from_static("text/event-stream")
    );

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: dashboard"));
    assert!(text.contains("\"kind\":\"dispatch\""));
    assert_eq!(storage.subscriptions().active(), 3);

    // Client disconnects.
    drop(body);

    assert_eq!(storage.subscriptions().acquired(), 3);
    assert_eq!(storage.subscriptions().released(), 3);
}
