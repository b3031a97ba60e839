use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::error::LedgerResult;

use super::models::{AllocationGrant, IdempotencyRecord, TransactionDraft};
use super::store::{EventOutcome, LedgerStore};

/// key: credits-idempotency -> provider event dedup with TTL
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn LedgerStore>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records `event_id` and applies the allocation as one step. A concurrent
    /// or later delivery of the same id observes the record and is reported
    /// as a duplicate without touching the ledger.
    pub async fn check_and_record(
        &self,
        event_id: &str,
        account_id: &str,
        grant: &AllocationGrant,
        now: DateTime<Utc>,
    ) -> LedgerResult<EventOutcome> {
        let record = IdempotencyRecord {
            event_id: event_id.to_string(),
            first_seen_at: now,
            expires_at: now + self.ttl,
            result_snapshot: Value::Null,
        };
        let draft = TransactionDraft::new(format!("provider event {event_id}"), now);
        let outcome = self
            .store
            .record_event(&record, account_id, grant, &draft)
            .await?;
        if let EventOutcome::Duplicate(existing) = &outcome {
            debug!(
                event_id,
                first_seen_at = %existing.first_seen_at,
                "duplicate provider event short-circuited"
            );
        }
        Ok(outcome)
    }

    pub async fn lookup(&self, event_id: &str) -> LedgerResult<Option<IdempotencyRecord>> {
        Ok(self.store.find_event(event_id).await?)
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let removed = self.store.sweep_events(now).await?;
        if removed > 0 {
            info!(removed, "expired idempotency records swept");
        }
        Ok(removed)
    }

    /// key: credits-idempotency-sweeper -> background expiry
    pub fn spawn_sweeper(self, interval: TokioDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_expired(Utc::now()).await {
                    warn!(?err, "idempotency sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::memory::MemoryLedgerStore;
    use crate::credits::models::Tier;

    fn grant() -> AllocationGrant {
        AllocationGrant {
            tier: Tier::Starter,
            is_unlimited: false,
            monthly_allowance: 100,
            rollover_cap: 50,
            bonus_credits: 0,
            bonus_expires_at: None,
        }
    }

    #[tokio::test]
    async fn second_delivery_is_duplicate_with_original_snapshot() {
        let store = Arc::new(MemoryLedgerStore::new());
        let idempotency = IdempotencyStore::new(store.clone(), Duration::days(30));
        let now = Utc::now();

        let first = idempotency
            .check_and_record("evt_1", "acct", &grant(), now)
            .await
            .unwrap();
        let EventOutcome::Applied { record, .. } = first else {
            panic!("first delivery should apply");
        };
        assert_eq!(record.result_snapshot["balance_after"], 100);

        let second = idempotency
            .check_and_record("evt_1", "acct", &grant(), now)
            .await
            .unwrap();
        let EventOutcome::Duplicate(existing) = second else {
            panic!("second delivery should be a duplicate");
        };
        assert_eq!(existing.result_snapshot, record.result_snapshot);
        assert_eq!(
            store.fetch_balance("acct").await.unwrap().unwrap().current_balance,
            100
        );
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_records() {
        let store = Arc::new(MemoryLedgerStore::new());
        let idempotency = IdempotencyStore::new(store, Duration::days(30));
        let now = Utc::now();
        idempotency
            .check_and_record("old", "acct", &grant(), now - Duration::days(31))
            .await
            .unwrap();
        idempotency
            .check_and_record("fresh", "acct", &grant(), now)
            .await
            .unwrap();

        assert_eq!(idempotency.sweep_expired(now).await.unwrap(), 1);
        assert!(idempotency.lookup("old").await.unwrap().is_none());
        assert!(idempotency.lookup("fresh").await.unwrap().is_some());
        assert_eq!(idempotency.sweep_expired(now).await.unwrap(), 0);
    }
}
