use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TierCatalog;
use crate::error::{LedgerError, LedgerResult};

use super::models::{BalanceSnapshot, CreditBalance, NewAccount, Tier, TransactionDraft, TransactionKind};
use super::store::{DebitOutcome, LedgerMutation, LedgerStore, ResetOutcome};

#[derive(Clone, Debug)]
pub enum ResetResult {
    Applied(LedgerMutation),
    AlreadyReset(CreditBalance),
}

impl ResetResult {
    pub fn balance(&self) -> &CreditBalance {
        match self {
            ResetResult::Applied(mutation) => &mutation.balance,
            ResetResult::AlreadyReset(balance) => balance,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ResetResult::Applied(_))
    }
}

/// key: credits-ledger -> sole writer of balances
#[derive(Clone)]
pub struct AccountLedger {
    store: Arc<dyn LedgerStore>,
    tiers: Arc<TierCatalog>,
}

impl AccountLedger {
    pub fn new(store: Arc<dyn LedgerStore>, tiers: TierCatalog) -> Self {
        Self {
            store,
            tiers: Arc::new(tiers),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn tiers(&self) -> &TierCatalog {
        &self.tiers
    }

    /// Provisions the balance row with the tier's opening allowance. Opening an
    /// existing account returns it unchanged.
    pub async fn open_account(
        &self,
        account_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> LedgerResult<CreditBalance> {
        let account = NewAccount {
            account_id: account_id.to_string(),
            tier,
            entitlement: self.tiers.entitlement(tier),
            opened_at: now,
        };
        let balance = self.store.open_account(&account).await?;
        info!(
            account_id,
            tier = tier.as_str(),
            balance = balance.current_balance,
            "credit account opened"
        );
        Ok(balance)
    }

    /// Atomic decrement-if-sufficient. A rejection has no side effects and is
    /// never retried here.
    pub async fn consume(
        &self,
        account_id: &str,
        cost: i64,
        draft: &TransactionDraft,
    ) -> LedgerResult<LedgerMutation> {
        if cost < 0 {
            return Err(LedgerError::InvalidAmount {
                amount: cost,
                reason: "cost must be non-negative",
            });
        }

        match self.store.consume(account_id, cost, draft).await? {
            DebitOutcome::Applied(mutation) => {
                debug!(
                    account_id,
                    cost,
                    balance = mutation.balance.current_balance,
                    operation_id = ?draft.related_operation_id,
                    "credits consumed"
                );
                Ok(mutation)
            }
            DebitOutcome::Insufficient { available } => {
                debug!(account_id, cost, available, "consume rejected");
                Err(LedgerError::InsufficientCredits {
                    account_id: account_id.to_string(),
                    required: cost,
                    available,
                })
            }
            DebitOutcome::UnknownAccount => Err(LedgerError::unknown_account(account_id)),
        }
    }

    /// Unconditional increment for refunds, allocations and positive manual
    /// adjustments.
    pub async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        related_operation_id: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<LedgerMutation> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "credit amount must be positive",
            });
        }
        if matches!(kind, TransactionKind::Consume | TransactionKind::Reset) {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "credits cannot be recorded as CONSUME or RESET",
            });
        }

        let mut draft = TransactionDraft::new(reason, now);
        draft.related_operation_id = related_operation_id;
        let mutation = self
            .store
            .credit(account_id, amount, kind, &draft)
            .await?
            .ok_or_else(|| LedgerError::unknown_account(account_id))?;
        debug!(
            account_id,
            amount,
            kind = kind.as_str(),
            balance = mutation.balance.current_balance,
            "credits added"
        );
        Ok(mutation)
    }

    /// Operator correction. Negative amounts never take the balance below zero.
    pub async fn adjust(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<LedgerMutation> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "adjustment must be non-zero",
            });
        }

        let draft = TransactionDraft::new(reason, now);
        match self.store.adjust(account_id, amount, &draft).await? {
            DebitOutcome::Applied(mutation) => {
                info!(
                    account_id,
                    amount,
                    reason,
                    balance = mutation.balance.current_balance,
                    "manual credit adjustment applied"
                );
                Ok(mutation)
            }
            DebitOutcome::Insufficient { available } => Err(LedgerError::InsufficientCredits {
                account_id: account_id.to_string(),
                required: -amount,
                available,
            }),
            DebitOutcome::UnknownAccount => Err(LedgerError::unknown_account(account_id)),
        }
    }

    /// Applies rollover + allowance + unexpired bonus for the boundary at or
    /// before `now`. Re-running for an applied boundary is a no-op.
    pub async fn reset(
        &self,
        account_id: &str,
        new_allowance: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<ResetResult> {
        if new_allowance < 0 {
            return Err(LedgerError::InvalidAmount {
                amount: new_allowance,
                reason: "allowance must be non-negative",
            });
        }

        let draft = TransactionDraft::new("monthly entitlement reset", now);
        match self.store.reset(account_id, new_allowance, &draft).await? {
            ResetOutcome::Applied(mutation) => {
                info!(
                    account_id,
                    allowance = new_allowance,
                    delta = mutation.transaction.amount,
                    balance = mutation.balance.current_balance,
                    "entitlement reset applied"
                );
                Ok(ResetResult::Applied(mutation))
            }
            ResetOutcome::AlreadyReset(balance) => {
                debug!(account_id, last_reset_at = %balance.last_reset_at, "reset already applied");
                Ok(ResetResult::AlreadyReset(balance))
            }
            ResetOutcome::UnknownAccount => Err(LedgerError::unknown_account(account_id)),
        }
    }

    pub async fn balance(&self, account_id: &str) -> LedgerResult<CreditBalance> {
        self.store
            .fetch_balance(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn get_balance(&self, account_id: &str) -> LedgerResult<BalanceSnapshot> {
        Ok(self.balance(account_id).await?.snapshot())
    }
}
