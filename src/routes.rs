use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::credits::{api, LedgerServices};

async fn root() -> &'static str {
    "Credit Ledger API"
}

async fn health() -> &'static str {
    "ok"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/accounts/:account_id", post(api::open_account))
        .route("/api/accounts/:account_id/balance", get(api::get_balance))
        .route(
            "/api/accounts/:account_id/transactions",
            get(api::get_history),
        )
        .route(
            "/api/accounts/:account_id/reconciliation",
            get(api::reconcile),
        )
        .route(
            "/api/accounts/:account_id/adjustments",
            post(api::post_adjustment),
        )
        .route(
            "/api/operations/:operation_kind/cost",
            get(api::quote_operation),
        )
        .route("/api/admin/failed-refunds", get(api::list_failed_refunds))
        .route(
            "/api/admin/failed-refunds/replay",
            post(api::replay_failed_refunds),
        )
        .route("/api/webhooks/credits", post(api::credit_webhook))
}

/// Full application router without the metrics layer.
pub fn app(services: LedgerServices) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(api_routes())
        .layer(Extension(services))
}
