use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::memory::MemoryLedgerStore;
use super::models::{
    AllocationGrant, CreditBalance, CreditTransaction, FailedRefund, HistoryFilter,
    IdempotencyRecord, NewAccount, TransactionDraft, TransactionKind,
};
use super::store::{
    DebitOutcome, DueAccount, EventOutcome, LedgerMutation, LedgerStore, ResetOutcome,
};

/// Memory store with switchable write failures.
#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryLedgerStore,
    pub fail_credits: AtomicBool,
    /// Resets of accounts whose id starts with this prefix fail.
    pub failing_reset_prefix: Option<String>,
}

impl FaultyStore {
    pub fn failing_resets_for(prefix: &str) -> Self {
        Self {
            failing_reset_prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn open_account(&self, account: &NewAccount) -> sqlx::Result<CreditBalance> {
        self.inner.open_account(account).await
    }

    async fn fetch_balance(&self, account_id: &str) -> sqlx::Result<Option<CreditBalance>> {
        self.inner.fetch_balance(account_id).await
    }

    async fn consume(
        &self,
        account_id: &str,
        cost: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        self.inner.consume(account_id, cost, draft).await
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        self.inner.credit(account_id, amount, kind, draft).await
    }

    async fn adjust(
        &self,
        account_id: &str,
        amount: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        self.inner.adjust(account_id, amount, draft).await
    }

    async fn reset(
        &self,
        account_id: &str,
        new_allowance: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<ResetOutcome> {
        if let Some(prefix) = &self.failing_reset_prefix {
            if account_id.starts_with(prefix.as_str()) {
                return Err(sqlx::Error::PoolTimedOut);
            }
        }
        self.inner.reset(account_id, new_allowance, draft).await
    }

    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueAccount>,
        limit: i64,
    ) -> sqlx::Result<Vec<DueAccount>> {
        self.inner.accounts_due_for_reset(now, after, limit).await
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> sqlx::Result<()> {
        self.inner.append_transaction(transaction).await
    }

    async fn history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> sqlx::Result<Vec<CreditTransaction>> {
        self.inner.history(account_id, filter).await
    }

    async fn record_event(
        &self,
        record: &IdempotencyRecord,
        account_id: &str,
        grant: &AllocationGrant,
        draft: &TransactionDraft,
    ) -> sqlx::Result<EventOutcome> {
        self.inner.record_event(record, account_id, grant, draft).await
    }

    async fn find_event(&self, event_id: &str) -> sqlx::Result<Option<IdempotencyRecord>> {
        self.inner.find_event(event_id).await
    }

    async fn sweep_events(&self, now: DateTime<Utc>) -> sqlx::Result<u64> {
        self.inner.sweep_events(now).await
    }

    async fn record_failed_refund(&self, failure: &FailedRefund) -> sqlx::Result<()> {
        self.inner.record_failed_refund(failure).await
    }

    async fn pending_failed_refunds(&self, limit: i64) -> sqlx::Result<Vec<FailedRefund>> {
        self.inner.pending_failed_refunds(limit).await
    }

    async fn resolve_failed_refund(
        &self,
        id: Uuid,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        self.inner.resolve_failed_refund(id, draft).await
    }
}
