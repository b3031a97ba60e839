use std::sync::Arc;

use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};

use super::models::{CreditTransaction, HistoryFilter};
use super::store::LedgerStore;

/// key: credits-transaction-log -> append-only audit trail
///
/// Balance-changing operations append through the store inside their own
/// atomic unit; `append` is the raw durable write used for imports and
/// zero-amount annotations.
#[derive(Clone)]
pub struct TransactionLog {
    store: Arc<dyn LedgerStore>,
}

/// Outcome of comparing an account's audit trail with its stored balance.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub account_id: String,
    pub transaction_count: usize,
    pub transaction_sum: i64,
    pub current_balance: i64,
    pub balanced: bool,
}

impl TransactionLog {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, transaction: &CreditTransaction) -> LedgerResult<()> {
        self.store.append_transaction(transaction).await?;
        Ok(())
    }

    /// Ordered by `created_at`, insertion order on ties.
    pub async fn history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> LedgerResult<Vec<CreditTransaction>> {
        if let Some(limit) = filter.limit.filter(|limit| *limit < 0) {
            return Err(LedgerError::InvalidAmount {
                amount: limit,
                reason: "history limit must be non-negative",
            });
        }
        Ok(self.store.history(account_id, filter).await?)
    }

    /// Sums every transaction for the account and checks it against the
    /// current balance. Opening allowances are recorded as transactions, so a
    /// consistent account sums exactly to its balance.
    pub async fn reconcile(&self, account_id: &str) -> LedgerResult<Reconciliation> {
        let balance = self
            .store
            .fetch_balance(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        let transactions = self
            .store
            .history(account_id, &HistoryFilter::default())
            .await?;
        let transaction_sum: i64 = transactions.iter().map(|transaction| transaction.amount).sum();
        Ok(Reconciliation {
            account_id: account_id.to_string(),
            transaction_count: transactions.len(),
            transaction_sum,
            current_balance: balance.current_balance,
            balanced: transaction_sum == balance.current_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::memory::MemoryLedgerStore;
    use crate::credits::models::{TransactionDraft, TransactionKind};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn history_filters_by_kind_and_range() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = crate::credits::AccountLedger::new(store.clone(), Default::default());
        let opened = Utc::now() - Duration::days(2);
        ledger
            .open_account("acct", crate::credits::Tier::Starter, opened)
            .await
            .unwrap();
        let draft = TransactionDraft::new("analysis", Utc::now());
        ledger.consume("acct", 3, &draft).await.unwrap();
        ledger
            .credit("acct", 3, TransactionKind::Refund, None, "engine failed", Utc::now())
            .await
            .unwrap();

        let log = TransactionLog::new(store);
        let all = log.history("acct", &HistoryFilter::default()).await.unwrap();
        let kinds: Vec<_> = all.iter().map(|transaction| transaction.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransactionKind::Allocation,
                TransactionKind::Consume,
                TransactionKind::Refund
            ]
        );

        let refunds = log
            .history(
                "acct",
                &HistoryFilter {
                    kind: Some(TransactionKind::Refund),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 3);

        let recent = log
            .history(
                "acct",
                &HistoryFilter {
                    start: Some(Utc::now() - Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);

        let reconciliation = log.reconcile("acct").await.unwrap();
        assert!(reconciliation.balanced);
        assert_eq!(reconciliation.current_balance, 100);
    }

    #[tokio::test]
    async fn append_requires_known_account() {
        let store = Arc::new(MemoryLedgerStore::new());
        let log = TransactionLog::new(store);
        let transaction = CreditTransaction::new(
            "ghost",
            TransactionKind::ManualAdjustment,
            0,
            0,
            &TransactionDraft::new("annotation", Utc::now()),
        );
        assert!(log.append(&transaction).await.is_err());
    }
}
