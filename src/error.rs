use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// key: credits-errors -> ledger taxonomy
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits for account {account_id}: required {required}, available {available}")]
    InsufficientCredits {
        account_id: String,
        required: i64,
        available: i64,
    },
    #[error("storage conflict for account {account_id}: {reason}")]
    StorageConflict { account_id: String, reason: String },
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("unknown operation kind `{0}`")]
    UnknownOperation(String),
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: &'static str },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub(crate) fn unknown_account(account_id: &str) -> Self {
        LedgerError::StorageConflict {
            account_id: account_id.to_string(),
            reason: "no balance row for account".to_string(),
        }
    }
}

/// A credit that would push a balance past `i64::MAX`. Stores surface it as a
/// failed write so the balance row and audit trail stay untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("credit balance for account {account_id} would overflow")]
pub struct BalanceOverflow {
    pub account_id: String,
}

impl BalanceOverflow {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
        }
    }
}

impl From<BalanceOverflow> for sqlx::Error {
    fn from(err: BalanceOverflow) -> Self {
        sqlx::Error::Protocol(err.to_string())
    }
}

/// key: credits-webhook-validation -> boundary rejections
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing webhook signature")]
    MissingSignature,
    #[error("malformed webhook signature")]
    MalformedSignature,
    #[error("webhook signature mismatch")]
    SignatureMismatch,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// key: credits-gateway-errors
/// `E` is the protected work's own failure type.
#[derive(Debug, Error)]
pub enum GatewayError<E> {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("operation {operation_id} failed and was refunded: {failure}")]
    WorkFailed { operation_id: Uuid, failure: E },
    #[error("operation {operation_id} panicked and was refunded")]
    WorkPanicked { operation_id: Uuid },
    #[error("refund of {cost} credits for operation {operation_id} on account {account_id} failed after `{failure}`: {refund_error}")]
    RefundFailed {
        account_id: String,
        operation_id: Uuid,
        cost: i64,
        failure: String,
        refund_error: LedgerError,
    },
}

impl<E> GatewayError<E> {
    pub fn is_insufficient_credits(&self) -> bool {
        matches!(
            self,
            GatewayError::Ledger(LedgerError::InsufficientCredits { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Webhook(WebhookError::Validation(
                ValidationError::MalformedPayload(_) | ValidationError::InvalidPayload(_),
            )) => StatusCode::BAD_REQUEST,
            AppError::Webhook(WebhookError::Validation(_)) => StatusCode::UNAUTHORIZED,
            AppError::Webhook(WebhookError::Ledger(err)) | AppError::Ledger(err) => {
                ledger_status(err)
            }
        };
        if status.is_server_error() {
            tracing::error!(error = ?self);
        } else {
            tracing::warn!(error = %self, status = status.as_u16());
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::StorageConflict { .. } => StatusCode::CONFLICT,
        LedgerError::UnknownOperation(_) | LedgerError::InvalidAmount { .. } => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type AppResult<T> = Result<T, AppError>;
pub type LedgerResult<T> = Result<T, LedgerError>;
