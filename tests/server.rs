//! HTTP surface smoke tests driven through the router with `tower::oneshot`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use straylight::gate::audit::{AuditReporter, AuditStore, SqliteAuditStore};
use straylight::gate::ledger::SessionLedger;
use straylight::gate::pipeline::Gate;
use straylight::gate::policy::{PolicyConfig, PolicyStore};
use straylight::gate::tracker::WorkTracker;
use straylight::server::{router, AppState};
use straylight::token::{mint, random_nonce, TokenClaims, TokenValidator};
use straylight::types::TrustLevel;

const KEY: &[u8] = b"server-test-key";

async fn test_router() -> axum::Router {
    let mut policy = PolicyConfig::default();
    policy.agent_whitelist.insert("cal".to_owned());
    policy.per_agent_blessing.insert("cal".to_owned(), true);
    policy.session_limits.max_work_units_per_session = 5;

    let policy = Arc::new(PolicyStore::new(policy, None));
    let mut keys = HashMap::new();
    keys.insert("core".to_owned(), KEY.to_vec());
    let validator = Arc::new(TokenValidator::new(keys));
    let ledger = Arc::new(SessionLedger::new());
    let store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::open_in_memory()
            .await
            .expect("audit store"),
    );
    let (audit, _writer) = AuditReporter::spawn(store, Arc::clone(&ledger));
    let tracker = Arc::new(WorkTracker::new(
        Arc::clone(&ledger),
        Arc::clone(&policy),
        audit.clone(),
    ));
    let gate = Arc::new(Gate::new(policy, validator, ledger, tracker, audit));
    router(AppState { gate })
}

fn blessed_token(level: TrustLevel) -> String {
    mint(
        KEY,
        &TokenClaims {
            level,
            expires_at: Utc::now() + Duration::seconds(600),
            issuer: "core".to_owned(),
            scoped_agents: vec![],
            nonce: random_nonce(),
        },
    )
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_router().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn admit_then_complete_round_trip() {
    let app = test_router().await;
    let token = blessed_token(TrustLevel::Trusted);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/admit",
            serde_json::json!({
                "session_id": "s1",
                "agent_id": "cal",
                "token": token,
                "requested_work_units": 2,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["decision"], "allow");
    let work_id = body["work_id"].as_str().expect("work_id").to_owned();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/complete",
            serde_json::json!({
                "work_id": work_id,
                "actual_work_units": 2,
                "outcome": "completed",
                "summary": "drafted the reply",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["acknowledged"], true);
    assert_eq!(body["outcome"], "reconciled");

    // A duplicate report acknowledges without double-charging.
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/complete",
            serde_json::json!({
                "work_id": work_id,
                "actual_work_units": 2,
                "outcome": "completed",
            }),
        ))
        .await
        .expect("response");
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "already_terminal");
}

#[tokio::test]
async fn admit_denial_is_a_value_not_an_error() {
    let app = test_router().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/admit",
            serde_json::json!({
                "session_id": "s1",
                "agent_id": "domingo",
                "token": null,
                "requested_work_units": 1,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["decision"], "deny");
    assert_eq!(body["reason"], "AgentNotWhitelisted");
}

#[tokio::test]
async fn unknown_work_completion_is_404() {
    let app = test_router().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/complete",
            serde_json::json!({
                "work_id": uuid::Uuid::new_v4(),
                "actual_work_units": 1,
                "outcome": "completed",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_summary_round_trip_and_404() {
    let app = test_router().await;
    let token = blessed_token(TrustLevel::Trusted);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/admit",
            serde_json::json!({
                "session_id": "s1",
                "agent_id": "cal",
                "token": token,
                "requested_work_units": 3,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/sessions/s1/summary")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["granted_work_units"], 3);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/sessions/ghost/summary")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn policy_update_requires_system_blessed() {
    let app = test_router().await;
    let operator = blessed_token(TrustLevel::Operator);
    let config = PolicyConfig::default();

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/v1/policy",
            serde_json::json!({
                "config": config,
                "updater_token": operator,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let blessed = blessed_token(TrustLevel::SystemBlessed);
    let response = app
        .oneshot(json_request(
            "PUT",
            "/v1/policy",
            serde_json::json!({
                "config": PolicyConfig::default(),
                "updater_token": blessed,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["applied"], true);
    assert_eq!(body["version"], 1);
}

#[tokio::test]
async fn broken_policy_update_is_rejected_with_400() {
    let app = test_router().await;
    let blessed = blessed_token(TrustLevel::SystemBlessed);
    let mut broken = PolicyConfig::default();
    broken.session_limits.session_ttl_secs = 0;

    let response = app
        .oneshot(json_request(
            "PUT",
            "/v1/policy",
            serde_json::json!({
                "config": broken,
                "updater_token": blessed,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
