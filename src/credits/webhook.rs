use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use crate::config::TierCatalog;
use crate::error::{ValidationError, WebhookError};

use super::idempotency::IdempotencyStore;
use super::models::{AllocationGrant, Tier};
use super::store::EventOutcome;

pub const SIGNATURE_HEADER: &str = "x-credit-signature";
const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Raw delivery as received: the signature header and the exact body bytes.
#[derive(Clone, Debug)]
pub struct SignedEvent {
    pub signature: Option<String>,
    pub body: Bytes,
}

/// key: credits-webhook-event -> provider allocation payload
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationEvent {
    pub event_id: String,
    pub payload: AllocationPayload,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationPayload {
    pub account_id: String,
    pub tier: Tier,
    pub allowance_amount: i64,
    #[serde(default)]
    pub bonus_amount: i64,
    #[serde(default)]
    pub bonus_expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        event_id: String,
        account_id: String,
        amount: i64,
        balance_after: i64,
    },
    Duplicate {
        event_id: String,
        first_seen_at: DateTime<Utc>,
        result: Value,
    },
}

/// `sha256=<hex>` signature for `body`, the format providers send.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against the HMAC of `body`.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), ValidationError> {
    let signature = signature.ok_or(ValidationError::MissingSignature)?;
    let encoded = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(ValidationError::MalformedSignature)?;
    let provided = hex::decode(encoded).map_err(|_| ValidationError::MalformedSignature)?;
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| ValidationError::SignatureMismatch)
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC can use any key length")
}

/// key: credits-webhook-ingester -> exactly-once allocations
#[derive(Clone)]
pub struct WebhookIngester {
    secret: Arc<[u8]>,
    idempotency: IdempotencyStore,
    tiers: Arc<TierCatalog>,
}

impl WebhookIngester {
    pub fn new(secret: impl AsRef<[u8]>, idempotency: IdempotencyStore, tiers: TierCatalog) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
            idempotency,
            tiers: Arc::new(tiers),
        }
    }

    /// Verifies, deduplicates and applies one delivery. Nothing is read or
    /// written before the signature checks out.
    pub async fn handle(
        &self,
        event: &SignedEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        if let Err(err) = verify_signature(&self.secret, &event.body, event.signature.as_deref()) {
            warn!(error = %err, "rejected provider webhook");
            return Err(err.into());
        }

        let parsed: AllocationEvent = serde_json::from_slice(&event.body)
            .map_err(ValidationError::MalformedPayload)?;
        let grant = self.grant_for(&parsed)?;
        let payload = &parsed.payload;

        match self
            .idempotency
            .check_and_record(&parsed.event_id, &payload.account_id, &grant, now)
            .await?
        {
            EventOutcome::Applied { mutation, .. } => {
                info!(
                    event_id = %parsed.event_id,
                    account_id = %payload.account_id,
                    tier = payload.tier.as_str(),
                    amount = mutation.transaction.amount,
                    balance = mutation.balance.current_balance,
                    "provider allocation applied"
                );
                Ok(WebhookOutcome::Applied {
                    event_id: parsed.event_id,
                    account_id: mutation.balance.account_id,
                    amount: mutation.transaction.amount,
                    balance_after: mutation.transaction.balance_after,
                })
            }
            EventOutcome::Duplicate(record) => Ok(WebhookOutcome::Duplicate {
                event_id: record.event_id,
                first_seen_at: record.first_seen_at,
                result: record.result_snapshot,
            }),
        }
    }

    fn grant_for(&self, event: &AllocationEvent) -> Result<AllocationGrant, ValidationError> {
        let payload = &event.payload;
        if event.event_id.trim().is_empty() {
            return Err(ValidationError::InvalidPayload("event_id is empty".into()));
        }
        if payload.account_id.trim().is_empty() {
            return Err(ValidationError::InvalidPayload("account_id is empty".into()));
        }
        if payload.allowance_amount < 0 || payload.bonus_amount < 0 {
            return Err(ValidationError::InvalidPayload(
                "allowance and bonus must be non-negative".into(),
            ));
        }
        let Some(amount) = payload.allowance_amount.checked_add(payload.bonus_amount) else {
            return Err(ValidationError::InvalidPayload(
                "allocation amount overflows".into(),
            ));
        };
        if amount == 0 {
            return Err(ValidationError::InvalidPayload(
                "allocation amount must be positive".into(),
            ));
        }

        let entitlement = self.tiers.entitlement(payload.tier);
        Ok(AllocationGrant {
            tier: payload.tier,
            is_unlimited: entitlement.unlimited,
            monthly_allowance: payload.allowance_amount,
            rollover_cap: entitlement.rollover_cap,
            bonus_credits: payload.bonus_amount,
            bonus_expires_at: payload.bonus_expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip_verifies() {
        let body = br#"{"event_id":"evt"}"#;
        let signature = sign(b"secret", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature(b"secret", body, Some(&signature)).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = sign(b"secret", b"original");
        let err = verify_signature(b"secret", b"tampered", Some(&signature)).unwrap_err();
        assert!(matches!(err, ValidationError::SignatureMismatch));
    }

    #[test]
    fn missing_and_malformed_signatures_are_distinguished() {
        assert!(matches!(
            verify_signature(b"secret", b"body", None),
            Err(ValidationError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature(b"secret", b"body", Some("md5=abc")),
            Err(ValidationError::MalformedSignature)
        ));
        assert!(matches!(
            verify_signature(b"secret", b"body", Some("sha256=zz")),
            Err(ValidationError::MalformedSignature)
        ));
    }
}
