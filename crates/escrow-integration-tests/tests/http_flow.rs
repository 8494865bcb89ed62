//! The HTTP surface and the engine agree: state produced over HTTP is the
//! state the engine holds, and the audit endpoint mirrors the trail.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use escrow_api::state::{AppConfig, AppState};
use escrow_core::EscrowId;
use escrow_workflow::{EscrowService, WorkflowConfig};

async fn send(app: &axum::Router, method: &str, uri: &str, actor: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-actor-id", actor);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn scenario_a_over_http_matches_engine_state() {
    let service = Arc::new(EscrowService::new(WorkflowConfig::default()));
    let app = escrow_api::app(AppState::with_service(AppConfig::default(), Arc::clone(&service)));

    let (status, created) = send(
        &app,
        "POST",
        "/v1/escrows",
        "alice",
        Some(json!({
            "title": "Office lease",
            "custodian_name": "Alice",
            "currency": "USD",
            "stakeholders": [{"user_id": "bob", "name": "Bob"}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();

    send(&app, "POST", &format!("/v1/escrows/{id}/fund"), "alice", Some(json!({"total_amount": 100_000}))).await;
    let (_, cond) = send(
        &app,
        "POST",
        &format!("/v1/escrows/{id}/conditions"),
        "alice",
        Some(json!({"description": "Lease signed"})),
    )
    .await;
    let cid = cond["condition_id"].as_str().unwrap().to_string();
    send(
        &app,
        "POST",
        &format!("/v1/escrows/{id}/conditions/{cid}/met"),
        "alice",
        Some(json!({"evidence_ref": "lease.pdf"})),
    )
    .await;

    let (_, req) = send(
        &app,
        "POST",
        &format!("/v1/escrows/{id}/requests"),
        "bob",
        Some(json!({"amount": 40_000, "reason": "First instalment"})),
    )
    .await;
    let rid = req["request_id"].as_str().unwrap().to_string();
    let reviews = format!("/v1/escrows/{id}/requests/{rid}/reviews");
    send(&app, "POST", &reviews, "alice", Some(json!({"decision": "APPROVED"}))).await;
    let (status, outcome) = send(&app, "POST", &reviews, "bob", Some(json!({"decision": "APPROVED"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["request_state"], "APPROVED");

    let escrow_id = EscrowId::from_uuid(id.parse().unwrap());
    let engine = service.get_escrow_state(escrow_id).unwrap();
    assert_eq!(outcome["escrow"]["version"], engine.version());
    assert_eq!(engine.ledger().released_amount().value(), 40_000);
    assert_eq!(engine.ledger().remaining_amount().value(), 60_000);
    assert_eq!(engine.state().as_str(), "FUNDED");

    let (_, audit) = send(&app, "GET", &format!("/v1/escrows/{id}/audit"), "alice", None).await;
    let http_entries = audit["entries"].as_array().unwrap();
    let engine_entries: Vec<_> = service.get_audit_trail(escrow_id, 1).unwrap().iter().collect();
    assert_eq!(http_entries.len(), engine_entries.len());
    for (http, engine) in http_entries.iter().zip(&engine_entries) {
        assert_eq!(http["sequence"], engine.sequence);
        assert_eq!(http["entry_digest"], engine.entry_digest.to_string());
        assert_eq!(http["kind"]["type"], engine.kind.name());
    }
}
