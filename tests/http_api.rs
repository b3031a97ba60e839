use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use credit_ledger::config::LedgerConfig;
use credit_ledger::credits::webhook::sign;
use credit_ledger::credits::{LedgerServices, MemoryLedgerStore, SIGNATURE_HEADER};
use credit_ledger::routes::app;
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

const SECRET: &[u8] = b"http-secret";
const ADMIN_TOKEN: &str = "operator-token";

fn test_app() -> Router {
    app(LedgerServices::new(
        Arc::new(MemoryLedgerStore::new()),
        LedgerConfig::default(),
        SECRET,
        Some(ADMIN_TOKEN.to_string()),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    };
    (status, value)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// key: http-tests -> status-mapping,webhook-route,operator-auth
#[tokio::test]
async fn health_responds_ok() {
    let (status, body) = send(&test_app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn opened_account_reports_its_balance() {
    let app = test_app();

    let (status, _) = send(&app, get("/api/accounts/acct/balance")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        json_request("POST", "/api/accounts/acct", json!({ "tier": "starter" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["current_balance"], 100);

    let (status, body) = send(&app, get("/api/accounts/acct/balance")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "starter");
    assert_eq!(body["monthly_allowance"], 100);
    assert!(body["next_reset_at"].is_string());

    let (status, body) = send(
        &app,
        get("/api/accounts/acct/transactions?kind=ALLOCATION&limit=5"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["kind"], "ALLOCATION");

    let (status, body) = send(&app, get("/api/accounts/acct/transactions?limit=-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("history limit"));

    let (status, body) = send(&app, get("/api/accounts/acct/transactions?limit=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn enterprise_balance_renders_unlimited() {
    let app = test_app();
    let (status, body) = send(
        &app,
        json_request("POST", "/api/accounts/big", json!({ "tier": "enterprise" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["current_balance"], "unlimited");
}

#[tokio::test]
async fn webhook_route_verifies_and_deduplicates() {
    let app = test_app();
    let payload = json!({
        "event_id": "evt_http",
        "payload": { "account_id": "acct", "tier": "starter", "allowance_amount": 100 }
    })
    .to_string();
    let signature = sign(SECRET, payload.as_bytes());

    let unsigned = Request::builder()
        .method("POST")
        .uri("/api/webhooks/credits")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = || {
        Request::builder()
            .method("POST")
            .uri("/api/webhooks/credits")
            .header(SIGNATURE_HEADER, signature.as_str())
            .body(Body::from(payload.clone()))
            .unwrap()
    };
    let (status, body) = send(&app, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");
    assert_eq!(body["balance_after"], 100);

    let (status, body) = send(&app, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
    assert_eq!(body["result"]["balance_after"], 100);

    let (_, body) = send(&app, get("/api/accounts/acct/balance")).await;
    assert_eq!(body["current_balance"], 100);
}

#[tokio::test]
async fn adjustments_require_the_operator_token() {
    let app = test_app();
    send(
        &app,
        json_request("POST", "/api/accounts/acct", json!({ "tier": "free" })),
    )
    .await;

    let adjustment = json!({ "amount": -25, "reason": "chargeback" });
    let (status, _) = send(
        &app,
        json_request("POST", "/api/accounts/acct/adjustments", adjustment.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authorized = |body: Value| {
        let mut request = json_request("POST", "/api/accounts/acct/adjustments", body);
        request.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {ADMIN_TOKEN}").parse().unwrap(),
        );
        request
    };

    // free opens with 10; taking 25 would go negative
    let (status, body) = send(&app, authorized(adjustment)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(body["error"].as_str().unwrap().contains("insufficient"));

    let (status, body) = send(
        &app,
        authorized(json!({ "amount": 15, "reason": "goodwill" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transaction"]["kind"], "MANUAL_ADJUSTMENT");
    assert_eq!(body["balance"]["current_balance"], 25);

    let (status, body) = send(&app, get("/api/accounts/acct/reconciliation")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balanced"], true);
}

#[tokio::test]
async fn cost_quotes_reject_unknown_operations() {
    let app = test_app();
    let (status, body) = send(&app, get("/api/operations/ad_generation/cost")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cost"], 2);

    let (status, _) = send(&app, get("/api/operations/video_render/cost")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
