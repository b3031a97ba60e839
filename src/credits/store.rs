use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    AllocationGrant, CreditBalance, CreditTransaction, FailedRefund, HistoryFilter,
    IdempotencyRecord, NewAccount, TransactionDraft, TransactionKind,
};

/// A committed balance mutation and the audit entry written with it.
#[derive(Clone, Debug)]
pub struct LedgerMutation {
    pub balance: CreditBalance,
    pub transaction: CreditTransaction,
}

#[derive(Clone, Debug)]
pub enum DebitOutcome {
    Applied(LedgerMutation),
    Insufficient { available: i64 },
    UnknownAccount,
}

#[derive(Clone, Debug)]
pub enum ResetOutcome {
    Applied(LedgerMutation),
    AlreadyReset(CreditBalance),
    UnknownAccount,
}

/// An account past its reset boundary. Ordered by `(last_reset_at,
/// account_id)`, which is also the scan cursor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueAccount {
    pub last_reset_at: DateTime<Utc>,
    pub account_id: String,
}

#[derive(Clone, Debug)]
pub enum EventOutcome {
    Applied {
        mutation: LedgerMutation,
        record: IdempotencyRecord,
    },
    Duplicate(IdempotencyRecord),
}

/// key: credits-store -> storage seam
///
/// Every method that changes a balance commits the balance row and its
/// `CreditTransaction` as one atomic unit. Implementations must enforce the
/// non-negative balance with a conditional write, never by reading first and
/// writing later.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts the balance row unless one exists; returns the stored row either way.
    async fn open_account(&self, account: &NewAccount) -> sqlx::Result<CreditBalance>;

    async fn fetch_balance(&self, account_id: &str) -> sqlx::Result<Option<CreditBalance>>;

    /// Decrement-if-sufficient. Unlimited accounts are charged zero but still
    /// accrue `total_consumed_lifetime`.
    async fn consume(
        &self,
        account_id: &str,
        cost: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome>;

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>>;

    /// Signed manual adjustment; a negative amount only applies while the
    /// result stays non-negative.
    async fn adjust(
        &self,
        account_id: &str,
        amount: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome>;

    /// Applies the monthly reset for the boundary at or before `draft.at`.
    async fn reset(
        &self,
        account_id: &str,
        new_allowance: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<ResetOutcome>;

    /// Up to `limit` due accounts ordered after `after`, oldest anchor first.
    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueAccount>,
        limit: i64,
    ) -> sqlx::Result<Vec<DueAccount>>;

    async fn append_transaction(&self, transaction: &CreditTransaction) -> sqlx::Result<()>;

    async fn history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> sqlx::Result<Vec<CreditTransaction>>;

    /// Insert-if-absent of the event record fused with the allocation it
    /// guards. Duplicates leave the ledger untouched.
    async fn record_event(
        &self,
        record: &IdempotencyRecord,
        account_id: &str,
        grant: &AllocationGrant,
        draft: &TransactionDraft,
    ) -> sqlx::Result<EventOutcome>;

    async fn find_event(&self, event_id: &str) -> sqlx::Result<Option<IdempotencyRecord>>;

    async fn sweep_events(&self, now: DateTime<Utc>) -> sqlx::Result<u64>;

    async fn record_failed_refund(&self, failure: &FailedRefund) -> sqlx::Result<()>;

    async fn pending_failed_refunds(&self, limit: i64) -> sqlx::Result<Vec<FailedRefund>>;

    /// Credits the refund and marks the dead letter resolved in one unit.
    /// Returns `None` if it was already resolved or the account is gone.
    async fn resolve_failed_refund(
        &self,
        id: Uuid,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>>;
}

/// Result snapshot stored on the idempotency record of an applied event.
pub(crate) fn allocation_snapshot(mutation: &LedgerMutation) -> serde_json::Value {
    serde_json::json!({
        "account_id": mutation.balance.account_id,
        "transaction_id": mutation.transaction.transaction_id,
        "amount": mutation.transaction.amount,
        "balance_after": mutation.transaction.balance_after,
        "tier": mutation.balance.tier,
    })
}
