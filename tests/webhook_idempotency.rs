use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use credit_ledger::config::{LedgerConfig, TierCatalog};
use credit_ledger::credits::webhook::sign;
use credit_ledger::credits::{
    IdempotencyStore, LedgerServices, MemoryLedgerStore, SignedEvent, WebhookIngester,
    WebhookOutcome,
};
use credit_ledger::error::{LedgerError, ValidationError, WebhookError};
use serde_json::json;

const SECRET: &[u8] = b"provider-secret";

fn services() -> LedgerServices {
    LedgerServices::new(
        Arc::new(MemoryLedgerStore::new()),
        LedgerConfig::default(),
        SECRET,
        None,
    )
}

fn signed(body: serde_json::Value) -> SignedEvent {
    let body = Bytes::from(body.to_string());
    SignedEvent {
        signature: Some(sign(SECRET, &body)),
        body,
    }
}

fn renewal(event_id: &str) -> SignedEvent {
    signed(json!({
        "event_id": event_id,
        "payload": {
            "account_id": "acct",
            "tier": "pro",
            "allowance_amount": 500,
            "bonus_amount": 25,
        }
    }))
}

// key: webhook-tests -> exactly-once,replay,signature-gate
#[tokio::test]
async fn replayed_event_applies_once() {
    let services = services();
    let event = renewal("evt_001");

    let first = services.webhooks.handle(&event, Utc::now()).await.unwrap();
    let WebhookOutcome::Applied { amount, balance_after, .. } = first else {
        panic!("first delivery should apply");
    };
    assert_eq!(amount, 525);
    assert_eq!(balance_after, 525);

    let second = services.webhooks.handle(&event, Utc::now()).await.unwrap();
    let WebhookOutcome::Duplicate { event_id, result, .. } = second else {
        panic!("second delivery should be a duplicate");
    };
    assert_eq!(event_id, "evt_001");
    assert_eq!(result["balance_after"], 525);

    let balance = services.ledger.balance("acct").await.unwrap();
    assert_eq!(balance.current_balance, 525);
    assert_eq!(balance.bonus_credits, 25);
    assert_eq!(balance.monthly_allowance, 500);
    let reconciliation = services.transactions.reconcile("acct").await.unwrap();
    assert_eq!(reconciliation.transaction_count, 1);
    assert!(reconciliation.balanced);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_deliveries_apply_once() {
    let services = services();
    let event = renewal("evt_concurrent");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let webhooks = services.webhooks.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            webhooks.handle(&event, Utc::now()).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if let WebhookOutcome::Applied { .. } = handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(
        services.ledger.balance("acct").await.unwrap().current_balance,
        525
    );
}

#[tokio::test]
async fn distinct_events_each_apply() {
    let services = services();
    services
        .webhooks
        .handle(&renewal("evt_a"), Utc::now())
        .await
        .unwrap();
    services
        .webhooks
        .handle(&renewal("evt_b"), Utc::now())
        .await
        .unwrap();

    assert_eq!(
        services.ledger.balance("acct").await.unwrap().current_balance,
        1050
    );
}

#[tokio::test]
async fn unsigned_or_forged_deliveries_change_nothing() {
    let services = services();
    let mut event = renewal("evt_forged");
    event.signature = Some(sign(b"wrong-secret", &event.body));

    let err = services
        .webhooks
        .handle(&event, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Validation(ValidationError::SignatureMismatch)
    ));

    event.signature = None;
    let err = services
        .webhooks
        .handle(&event, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Validation(ValidationError::MissingSignature)
    ));

    assert!(services.ledger.balance("acct").await.is_err());
    assert!(services
        .idempotency
        .lookup("evt_forged")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn invalid_payloads_are_rejected_after_verification() {
    let services = services();
    let event = signed(json!({
        "event_id": "evt_negative",
        "payload": { "account_id": "acct", "tier": "starter", "allowance_amount": -5 }
    }));

    let err = services
        .webhooks
        .handle(&event, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Validation(ValidationError::InvalidPayload(_))
    ));

    let garbage = signed(json!({ "unexpected": true }));
    let err = services
        .webhooks
        .handle(&garbage, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Validation(ValidationError::MalformedPayload(_))
    ));
}

#[tokio::test]
async fn overflowing_allocations_are_refused() {
    let services = services();
    let oversized = signed(json!({
        "event_id": "evt_oversized",
        "payload": {
            "account_id": "acct",
            "tier": "pro",
            "allowance_amount": i64::MAX,
            "bonus_amount": 2,
        }
    }));

    let err = services
        .webhooks
        .handle(&oversized, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Validation(ValidationError::InvalidPayload(_))
    ));
    assert!(services.ledger.balance("acct").await.is_err());
    assert!(services
        .idempotency
        .lookup("evt_oversized")
        .await
        .unwrap()
        .is_none());

    let near_max = signed(json!({
        "event_id": "evt_near_max",
        "payload": { "account_id": "acct", "tier": "pro", "allowance_amount": i64::MAX - 10 }
    }));
    services
        .webhooks
        .handle(&near_max, Utc::now())
        .await
        .unwrap();

    let err = services
        .webhooks
        .handle(&renewal("evt_tips_over"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Ledger(LedgerError::Database(_))));

    let balance = services.ledger.balance("acct").await.unwrap();
    assert_eq!(balance.current_balance, i64::MAX - 10);
    assert_eq!(balance.bonus_credits, 0);
    assert!(services
        .idempotency
        .lookup("evt_tips_over")
        .await
        .unwrap()
        .is_none());
    let reconciliation = services.transactions.reconcile("acct").await.unwrap();
    assert_eq!(reconciliation.transaction_count, 1);
}

#[tokio::test]
async fn swept_records_no_longer_deduplicate() {
    let store = Arc::new(MemoryLedgerStore::new());
    let idempotency = IdempotencyStore::new(store.clone(), Duration::days(30));
    let webhooks = WebhookIngester::new(SECRET, idempotency.clone(), TierCatalog::default());
    let delivered_at = Utc::now() - Duration::days(31);

    webhooks
        .handle(&renewal("evt_old"), delivered_at)
        .await
        .unwrap();
    assert!(idempotency.lookup("evt_old").await.unwrap().is_some());

    assert_eq!(idempotency.sweep_expired(Utc::now()).await.unwrap(), 1);
    assert!(idempotency.lookup("evt_old").await.unwrap().is_none());
}
