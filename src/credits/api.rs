use axum::{
    extract::{Extension, Path, Query},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

use super::models::{BalanceSnapshot, CreditTransaction, FailedRefund, HistoryFilter, Tier};
use super::transactions::Reconciliation;
use super::webhook::{SignedEvent, WebhookOutcome, SIGNATURE_HEADER};
use super::LedgerServices;

/// key: credits-api -> rest endpoints
pub async fn get_balance(
    Extension(services): Extension<LedgerServices>,
    Path(account_id): Path<String>,
) -> AppResult<Json<BalanceSnapshot>> {
    Ok(Json(services.ledger.get_balance(&account_id).await?))
}

pub async fn get_history(
    Extension(services): Extension<LedgerServices>,
    Path(account_id): Path<String>,
    Query(filter): Query<HistoryFilter>,
) -> AppResult<Json<Vec<CreditTransaction>>> {
    Ok(Json(
        services.transactions.history(&account_id, &filter).await?,
    ))
}

pub async fn reconcile(
    Extension(services): Extension<LedgerServices>,
    Path(account_id): Path<String>,
) -> AppResult<Json<Reconciliation>> {
    Ok(Json(services.transactions.reconcile(&account_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub tier: Tier,
}

pub async fn open_account(
    Extension(services): Extension<LedgerServices>,
    Path(account_id): Path<String>,
    Json(payload): Json<OpenAccountRequest>,
) -> AppResult<(StatusCode, Json<BalanceSnapshot>)> {
    let balance = services
        .ledger
        .open_account(&account_id, payload.tier, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(balance.snapshot())))
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct AdjustmentResponse {
    pub transaction: CreditTransaction,
    pub balance: BalanceSnapshot,
}

pub async fn post_adjustment(
    Extension(services): Extension<LedgerServices>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<AdjustmentRequest>,
) -> AppResult<Json<AdjustmentResponse>> {
    require_admin(&services, &headers)?;
    if payload.reason.trim().is_empty() {
        return Err(AppError::BadRequest("adjustment reason is required".into()));
    }
    let mutation = services
        .ledger
        .adjust(&account_id, payload.amount, payload.reason.trim(), Utc::now())
        .await?;
    Ok(Json(AdjustmentResponse {
        balance: mutation.balance.snapshot(),
        transaction: mutation.transaction,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FailedRefundQuery {
    pub limit: Option<i64>,
}

pub async fn list_failed_refunds(
    Extension(services): Extension<LedgerServices>,
    headers: HeaderMap,
    Query(query): Query<FailedRefundQuery>,
) -> AppResult<Json<Vec<FailedRefund>>> {
    require_admin(&services, &headers)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(services.gateway.failed_refunds(limit).await?))
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub replayed: usize,
}

pub async fn replay_failed_refunds(
    Extension(services): Extension<LedgerServices>,
    headers: HeaderMap,
    Query(query): Query<FailedRefundQuery>,
) -> AppResult<Json<ReplayResponse>> {
    require_admin(&services, &headers)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let replayed = services.gateway.replay_failed_refunds(limit).await?;
    Ok(Json(ReplayResponse { replayed }))
}

#[derive(Debug, Serialize)]
pub struct CostQuote {
    pub operation_kind: String,
    pub cost: i64,
}

pub async fn quote_operation(
    Extension(services): Extension<LedgerServices>,
    Path(operation_kind): Path<String>,
) -> AppResult<Json<CostQuote>> {
    let cost = services.gateway.cost_of(&operation_kind)?;
    Ok(Json(CostQuote {
        operation_kind,
        cost,
    }))
}

/// Provider callback. Applied and duplicate deliveries both answer 200.
pub async fn credit_webhook(
    Extension(services): Extension<LedgerServices>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let event = SignedEvent { signature, body };
    Ok(Json(services.webhooks.handle(&event, Utc::now()).await?))
}

fn require_admin(services: &LedgerServices, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = services.admin_token.as_deref() else {
        return Err(AppError::Unauthorized);
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;
    if tokens_match(expected, provided) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

/// Compares fixed-length digests so the comparison time does not depend on
/// where the tokens differ.
fn tokens_match(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (left, right)| acc | (left ^ right))
        == 0
}
