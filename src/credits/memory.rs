use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use crate::error::BalanceOverflow;

use super::models::{
    AllocationGrant, CreditBalance, CreditTransaction, FailedRefund, HistoryFilter,
    IdempotencyRecord, NewAccount, TransactionDraft, TransactionKind,
};
use super::store::{
    allocation_snapshot, DebitOutcome, DueAccount, EventOutcome, LedgerMutation, LedgerStore,
    ResetOutcome,
};

struct AccountEntry {
    balance: CreditBalance,
    transactions: Vec<CreditTransaction>,
}

impl AccountEntry {
    fn commit(
        &mut self,
        kind: TransactionKind,
        amount: i64,
        draft: &TransactionDraft,
    ) -> LedgerMutation {
        self.balance.updated_at = draft.at;
        let transaction = CreditTransaction::new(
            &self.balance.account_id,
            kind,
            amount,
            self.balance.current_balance,
            draft,
        );
        self.transactions.push(transaction.clone());
        LedgerMutation {
            balance: self.balance.clone(),
            transaction,
        }
    }

    fn checked_balance(&self, amount: i64) -> Result<i64, BalanceOverflow> {
        self.balance
            .current_balance
            .checked_add(amount)
            .ok_or_else(|| BalanceOverflow::new(&self.balance.account_id))
    }

    fn credit(
        &mut self,
        amount: i64,
        kind: TransactionKind,
        draft: &TransactionDraft,
    ) -> Result<LedgerMutation, BalanceOverflow> {
        self.balance.current_balance = self.checked_balance(amount)?;
        if kind == TransactionKind::Refund {
            self.balance.total_consumed_lifetime =
                self.balance.total_consumed_lifetime.saturating_sub(amount).max(0);
        }
        Ok(self.commit(kind, amount, draft))
    }
}

/// key: credits-memory-store -> in-process backend
///
/// Each atomic unit runs under the owning account's shard lock, so a balance
/// change and its transaction are never observed apart. Accounts in other
/// shards proceed independently.
#[derive(Default)]
pub struct MemoryLedgerStore {
    accounts: DashMap<String, AccountEntry>,
    events: DashMap<String, IdempotencyRecord>,
    failed_refunds: DashMap<Uuid, FailedRefund>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(
        &self,
        account_id: &str,
        grant: &AllocationGrant,
        draft: &TransactionDraft,
    ) -> Result<LedgerMutation, BalanceOverflow> {
        let amount = grant
            .amount()
            .ok_or_else(|| BalanceOverflow::new(account_id))?;
        let mut entry = self
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountEntry {
                balance: CreditBalance {
                    account_id: account_id.to_string(),
                    tier: grant.tier,
                    is_unlimited: grant.is_unlimited,
                    current_balance: 0,
                    monthly_allowance: grant.monthly_allowance,
                    bonus_credits: 0,
                    bonus_expires_at: None,
                    rollover_cap: grant.rollover_cap,
                    total_consumed_lifetime: 0,
                    last_reset_at: draft.at,
                    created_at: draft.at,
                    updated_at: draft.at,
                },
                transactions: Vec::new(),
            });
        let account = entry.value_mut();
        account.checked_balance(amount)?;
        account.balance.tier = grant.tier;
        account.balance.is_unlimited = grant.is_unlimited;
        account.balance.monthly_allowance = grant.monthly_allowance;
        account.balance.rollover_cap = grant.rollover_cap;
        account.balance.last_reset_at = draft.at;
        if grant.bonus_credits > 0 {
            account.balance.bonus_credits = grant.bonus_credits;
            account.balance.bonus_expires_at = grant.bonus_expires_at;
        }
        account.credit(amount, TransactionKind::Allocation, draft)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn open_account(&self, account: &NewAccount) -> sqlx::Result<CreditBalance> {
        let entry = self
            .accounts
            .entry(account.account_id.clone())
            .or_insert_with(|| {
                let mut created = AccountEntry {
                    balance: CreditBalance {
                        account_id: account.account_id.clone(),
                        tier: account.tier,
                        is_unlimited: account.entitlement.unlimited,
                        current_balance: account.entitlement.monthly_allowance,
                        monthly_allowance: account.entitlement.monthly_allowance,
                        bonus_credits: 0,
                        bonus_expires_at: None,
                        rollover_cap: account.entitlement.rollover_cap,
                        total_consumed_lifetime: 0,
                        last_reset_at: account.opened_at,
                        created_at: account.opened_at,
                        updated_at: account.opened_at,
                    },
                    transactions: Vec::new(),
                };
                let draft = TransactionDraft::new("opening allowance", account.opened_at);
                created.commit(
                    TransactionKind::Allocation,
                    account.entitlement.monthly_allowance,
                    &draft,
                );
                created
            });
        Ok(entry.balance.clone())
    }

    async fn fetch_balance(&self, account_id: &str) -> sqlx::Result<Option<CreditBalance>> {
        Ok(self
            .accounts
            .get(account_id)
            .map(|entry| entry.balance.clone()))
    }

    async fn consume(
        &self,
        account_id: &str,
        cost: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(DebitOutcome::UnknownAccount);
        };
        let account = entry.value_mut();
        let charged = if account.balance.is_unlimited { 0 } else { cost };
        if account.balance.current_balance < charged {
            return Ok(DebitOutcome::Insufficient {
                available: account.balance.current_balance,
            });
        }
        account.balance.current_balance -= charged;
        account.balance.total_consumed_lifetime =
            account.balance.total_consumed_lifetime.saturating_add(cost);
        Ok(DebitOutcome::Applied(account.commit(
            TransactionKind::Consume,
            -charged,
            draft,
        )))
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(None);
        };
        Ok(Some(entry.value_mut().credit(amount, kind, draft)?))
    }

    async fn adjust(
        &self,
        account_id: &str,
        amount: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(DebitOutcome::UnknownAccount);
        };
        let account = entry.value_mut();
        let adjusted = account.checked_balance(amount)?;
        if adjusted < 0 {
            return Ok(DebitOutcome::Insufficient {
                available: account.balance.current_balance,
            });
        }
        account.balance.current_balance = adjusted;
        Ok(DebitOutcome::Applied(account.commit(
            TransactionKind::ManualAdjustment,
            amount,
            draft,
        )))
    }

    async fn reset(
        &self,
        account_id: &str,
        new_allowance: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<ResetOutcome> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(ResetOutcome::UnknownAccount);
        };
        let account = entry.value_mut();
        let Some(plan) = account.balance.plan_reset(new_allowance, draft.at)? else {
            return Ok(ResetOutcome::AlreadyReset(account.balance.clone()));
        };
        account.balance.current_balance = plan.new_balance;
        account.balance.monthly_allowance = new_allowance;
        account.balance.last_reset_at = plan.boundary;
        if plan.bonus_credits == 0 {
            account.balance.bonus_credits = 0;
            account.balance.bonus_expires_at = None;
        }
        Ok(ResetOutcome::Applied(account.commit(
            TransactionKind::Reset,
            plan.delta,
            draft,
        )))
    }

    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueAccount>,
        limit: i64,
    ) -> sqlx::Result<Vec<DueAccount>> {
        let mut due: Vec<DueAccount> = self
            .accounts
            .iter()
            .filter(|entry| entry.balance.is_due_for_reset(now))
            .map(|entry| DueAccount {
                last_reset_at: entry.balance.last_reset_at,
                account_id: entry.key().clone(),
            })
            .filter(|account| after.map_or(true, |cursor| account > cursor))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> sqlx::Result<()> {
        let mut entry = self
            .accounts
            .get_mut(&transaction.account_id)
            .ok_or(sqlx::Error::RowNotFound)?;
        entry.transactions.push(transaction.clone());
        Ok(())
    }

    async fn history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> sqlx::Result<Vec<CreditTransaction>> {
        let Some(entry) = self.accounts.get(account_id) else {
            return Ok(Vec::new());
        };
        let mut transactions: Vec<CreditTransaction> = entry
            .transactions
            .iter()
            .filter(|transaction| filter.matches(transaction))
            .cloned()
            .collect();
        drop(entry);
        transactions.sort_by_key(|transaction| transaction.created_at);
        if let Some(limit) = filter.limit {
            transactions.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(transactions)
    }

    async fn record_event(
        &self,
        record: &IdempotencyRecord,
        account_id: &str,
        grant: &AllocationGrant,
        draft: &TransactionDraft,
    ) -> sqlx::Result<EventOutcome> {
        match self.events.entry(record.event_id.clone()) {
            Entry::Occupied(existing) => Ok(EventOutcome::Duplicate(existing.get().clone())),
            Entry::Vacant(slot) => {
                let mutation = self.allocate(account_id, grant, draft)?;
                let mut stored = record.clone();
                stored.result_snapshot = allocation_snapshot(&mutation);
                slot.insert(stored.clone());
                Ok(EventOutcome::Applied {
                    mutation,
                    record: stored,
                })
            }
        }
    }

    async fn find_event(&self, event_id: &str) -> sqlx::Result<Option<IdempotencyRecord>> {
        Ok(self.events.get(event_id).map(|record| record.clone()))
    }

    async fn sweep_events(&self, now: DateTime<Utc>) -> sqlx::Result<u64> {
        let mut removed = 0u64;
        self.events.retain(|_, record| {
            let keep = record.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn record_failed_refund(&self, failure: &FailedRefund) -> sqlx::Result<()> {
        self.failed_refunds.insert(failure.id, failure.clone());
        Ok(())
    }

    async fn pending_failed_refunds(&self, limit: i64) -> sqlx::Result<Vec<FailedRefund>> {
        let mut pending: Vec<FailedRefund> = self
            .failed_refunds
            .iter()
            .filter(|failure| failure.resolved_at.is_none())
            .map(|failure| failure.clone())
            .collect();
        pending.sort_by_key(|failure| failure.recorded_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn resolve_failed_refund(
        &self,
        id: Uuid,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        let Some(mut failure) = self.failed_refunds.get_mut(&id) else {
            return Ok(None);
        };
        if failure.resolved_at.is_some() {
            return Ok(None);
        }
        let Some(mut account) = self.accounts.get_mut(&failure.account_id) else {
            return Ok(None);
        };
        let draft = draft.clone().for_operation(failure.operation_id);
        let mutation = account
            .value_mut()
            .credit(failure.cost, TransactionKind::Refund, &draft)?;
        failure.resolved_at = Some(draft.at);
        Ok(Some(mutation))
    }
}
