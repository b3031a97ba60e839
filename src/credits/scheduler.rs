use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::error::LedgerResult;

use super::ledger::{AccountLedger, ResetResult};
use super::store::DueAccount;

/// key: credits-entitlement-scheduler -> monthly resets
#[derive(Clone)]
pub struct EntitlementScheduler {
    ledger: AccountLedger,
    batch_size: i64,
}

impl EntitlementScheduler {
    pub fn new(ledger: AccountLedger, batch_size: i64) -> Self {
        Self {
            ledger,
            batch_size: batch_size.max(1),
        }
    }

    /// Resets every account whose `last_reset_at + 1 month <= now`. Per-account
    /// failures are logged and left for the next run; re-running is safe
    /// because each reset is idempotent per boundary.
    ///
    /// The scan walks a `(last_reset_at, account_id)` cursor; an account is
    /// fetched at most once per run.
    pub async fn run_due_resets(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let mut applied = 0;
        let mut failed = 0;
        let mut cursor: Option<DueAccount> = None;
        loop {
            let due = self
                .ledger
                .store()
                .accounts_due_for_reset(now, cursor.as_ref(), self.batch_size)
                .await?;
            let batch_len = due.len();

            for account in &due {
                let account_id = account.account_id.as_str();
                match self.reset_account(account_id, now).await {
                    Ok(ResetResult::Applied(_)) => applied += 1,
                    Ok(ResetResult::AlreadyReset(_)) => {
                        debug!(account_id, "account reset concurrently")
                    }
                    Err(err) => {
                        failed += 1;
                        warn!(?err, account_id, "entitlement reset failed")
                    }
                }
            }

            cursor = due.into_iter().last();
            if cursor.is_none() || batch_len < self.batch_size as usize {
                break;
            }
        }

        if applied > 0 || failed > 0 {
            info!(applied, failed, "entitlement resets applied");
        }
        Ok(applied)
    }

    async fn reset_account(&self, account_id: &str, now: DateTime<Utc>) -> LedgerResult<ResetResult> {
        let balance = self.ledger.balance(account_id).await?;
        self.ledger
            .reset(account_id, balance.monthly_allowance, now)
            .await
    }

    pub fn spawn(self, interval: TokioDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_due_resets(Utc::now()).await {
                    warn!(?err, "entitlement reset tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use crate::config::TierCatalog;
    use crate::credits::memory::MemoryLedgerStore;
    use crate::credits::models::{Tier, TransactionDraft};
    use crate::credits::testing::FaultyStore;

    #[tokio::test]
    async fn resets_only_due_accounts_across_batches() {
        let ledger = AccountLedger::new(Arc::new(MemoryLedgerStore::new()), TierCatalog::default());
        let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for index in 0..5 {
            ledger
                .open_account(&format!("due-{index}"), Tier::Starter, anchor)
                .await
                .unwrap();
        }
        ledger
            .open_account("fresh", Tier::Starter, anchor + Duration::days(20))
            .await
            .unwrap();

        let scheduler = EntitlementScheduler::new(ledger.clone(), 2);
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(scheduler.run_due_resets(now).await.unwrap(), 5);
        assert_eq!(scheduler.run_due_resets(now).await.unwrap(), 0);

        // starter: min(100, 50) + 100
        assert_eq!(ledger.balance("due-0").await.unwrap().current_balance, 150);
        assert_eq!(ledger.balance("fresh").await.unwrap().current_balance, 100);
    }

    #[tokio::test]
    async fn failing_accounts_do_not_block_later_batches() {
        let store = Arc::new(FaultyStore::failing_resets_for("poison-"));
        let ledger = AccountLedger::new(store, TierCatalog::default());
        let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for account_id in ["poison-0", "poison-1"] {
            ledger
                .open_account(account_id, Tier::Starter, anchor)
                .await
                .unwrap();
        }
        ledger
            .open_account("healthy", Tier::Starter, anchor + Duration::days(1))
            .await
            .unwrap();

        let scheduler = EntitlementScheduler::new(ledger.clone(), 2);
        let now = Utc.with_ymd_and_hms(2026, 2, 5, 0, 0, 0).unwrap();
        assert_eq!(scheduler.run_due_resets(now).await.unwrap(), 1);
        assert_eq!(scheduler.run_due_resets(now).await.unwrap(), 0);

        assert_eq!(ledger.balance("healthy").await.unwrap().current_balance, 150);
        assert_eq!(ledger.balance("poison-0").await.unwrap().current_balance, 100);
    }

    #[tokio::test]
    async fn reset_uses_current_monthly_allowance() {
        let ledger = AccountLedger::new(Arc::new(MemoryLedgerStore::new()), TierCatalog::default());
        let anchor = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        ledger.open_account("acct", Tier::Pro, anchor).await.unwrap();
        let draft = TransactionDraft::new("usage", anchor + Duration::days(3));
        ledger.consume("acct", 450, &draft).await.unwrap();

        let scheduler = EntitlementScheduler::new(ledger.clone(), 10);
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        scheduler.run_due_resets(now).await.unwrap();

        let balance = ledger.balance("acct").await.unwrap();
        assert_eq!(balance.current_balance, 550);
        assert_eq!(balance.last_reset_at, now);
    }
}
