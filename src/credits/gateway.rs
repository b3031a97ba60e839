use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OperationCostTable;
use crate::error::{GatewayError, LedgerError, LedgerResult};

use super::ledger::AccountLedger;
use super::models::{FailedRefund, TransactionDraft, TransactionKind};

/// Handed to the protected work so it can correlate its own records.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub operation_id: Uuid,
    pub account_id: String,
    pub operation_kind: String,
    pub cost: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OperationReceipt {
    pub operation_id: Uuid,
    pub operation_kind: String,
    pub cost: i64,
    pub balance_after: i64,
}

/// Successful work output together with what it cost.
#[derive(Debug)]
pub struct Charged<T> {
    pub receipt: OperationReceipt,
    pub output: T,
}

#[derive(Clone, Debug)]
struct PendingRefund {
    account_id: String,
    operation_id: Uuid,
    operation_kind: String,
    charged: i64,
}

/// Refunds on drop unless disarmed, so a cancelled `execute` still pays back.
struct RefundGuard {
    gateway: ConsumptionGateway,
    pending: Option<PendingRefund>,
}

impl RefundGuard {
    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for RefundGuard {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        warn!(
            account_id = %pending.account_id,
            operation_id = %pending.operation_id,
            cost = pending.charged,
            "operation cancelled in flight; refunding"
        );
        match Handle::try_current() {
            Ok(handle) => {
                let gateway = self.gateway.clone();
                handle.spawn(async move {
                    let _ = gateway.refund(&pending, "operation cancelled").await;
                });
            }
            Err(_) => error!(
                account_id = %pending.account_id,
                operation_id = %pending.operation_id,
                operation_kind = %pending.operation_kind,
                cost = pending.charged,
                "operation cancelled outside a tokio runtime; refund needs manual replay"
            ),
        }
    }
}

/// key: credits-gateway -> pay first, refund on failure
#[derive(Clone)]
pub struct ConsumptionGateway {
    ledger: AccountLedger,
    costs: Arc<OperationCostTable>,
}

impl ConsumptionGateway {
    pub fn new(ledger: AccountLedger, costs: OperationCostTable) -> Self {
        Self {
            ledger,
            costs: Arc::new(costs),
        }
    }

    pub fn cost_of(&self, operation_kind: &str) -> LedgerResult<i64> {
        self.costs
            .cost(operation_kind)
            .ok_or_else(|| LedgerError::UnknownOperation(operation_kind.to_string()))
    }

    /// Charges the operation's cost, then runs `work`. Rejected charges never
    /// run `work`; failed, panicking or cancelled work is refunded before the
    /// failure propagates.
    pub async fn execute<F, Fut, T, E>(
        &self,
        account_id: &str,
        operation_kind: &str,
        work: F,
    ) -> Result<Charged<T>, GatewayError<E>>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let cost = self.cost_of(operation_kind)?;
        let operation_id = Uuid::new_v4();
        let draft = TransactionDraft::new(format!("{operation_kind} operation"), Utc::now())
            .for_operation(operation_id);
        let mutation = self.ledger.consume(account_id, cost, &draft).await?;

        let pending = PendingRefund {
            account_id: account_id.to_string(),
            operation_id,
            operation_kind: operation_kind.to_string(),
            charged: -mutation.transaction.amount,
        };
        let receipt = OperationReceipt {
            operation_id,
            operation_kind: operation_kind.to_string(),
            cost: pending.charged,
            balance_after: mutation.balance.current_balance,
        };
        let context = OperationContext {
            operation_id,
            account_id: account_id.to_string(),
            operation_kind: operation_kind.to_string(),
            cost,
        };

        let mut guard = RefundGuard {
            gateway: self.clone(),
            pending: Some(pending.clone()),
        };
        let outcome = AssertUnwindSafe(async move { work(context).await })
            .catch_unwind()
            .await;
        guard.disarm();

        match outcome {
            Ok(Ok(output)) => Ok(Charged { receipt, output }),
            Ok(Err(failure)) => {
                self.refund_or_escalate(&pending, failure.to_string())
                    .await?;
                Err(GatewayError::WorkFailed {
                    operation_id,
                    failure,
                })
            }
            Err(_) => {
                self.refund_or_escalate(&pending, "operation panicked".to_string())
                    .await?;
                Err(GatewayError::WorkPanicked { operation_id })
            }
        }
    }

    async fn refund_or_escalate<E>(
        &self,
        pending: &PendingRefund,
        failure: String,
    ) -> Result<(), GatewayError<E>> {
        self.refund(pending, &failure)
            .await
            .map_err(|refund_error| GatewayError::RefundFailed {
                account_id: pending.account_id.clone(),
                operation_id: pending.operation_id,
                cost: pending.charged,
                failure,
                refund_error,
            })
    }

    async fn refund(&self, pending: &PendingRefund, failure: &str) -> LedgerResult<()> {
        if pending.charged == 0 {
            debug!(
                account_id = %pending.account_id,
                operation_id = %pending.operation_id,
                "nothing charged; no refund needed"
            );
            return Ok(());
        }

        match self
            .ledger
            .credit(
                &pending.account_id,
                pending.charged,
                TransactionKind::Refund,
                Some(pending.operation_id),
                failure,
                Utc::now(),
            )
            .await
        {
            Ok(mutation) => {
                info!(
                    account_id = %pending.account_id,
                    operation_id = %pending.operation_id,
                    cost = pending.charged,
                    balance = mutation.balance.current_balance,
                    failure,
                    "operation failed; credits refunded"
                );
                Ok(())
            }
            Err(refund_error) => {
                self.escalate(pending, failure, &refund_error).await;
                Err(refund_error)
            }
        }
    }

    async fn escalate(&self, pending: &PendingRefund, failure: &str, refund_error: &LedgerError) {
        error!(
            account_id = %pending.account_id,
            operation_id = %pending.operation_id,
            operation_kind = %pending.operation_kind,
            cost = pending.charged,
            failure,
            error = %refund_error,
            "compensating refund failed; recorded for manual replay"
        );
        let record = FailedRefund {
            id: Uuid::new_v4(),
            account_id: pending.account_id.clone(),
            operation_id: pending.operation_id,
            operation_kind: pending.operation_kind.clone(),
            cost: pending.charged,
            failure_reason: failure.to_string(),
            refund_error: refund_error.to_string(),
            recorded_at: Utc::now(),
            resolved_at: None,
        };
        if let Err(err) = self.ledger.store().record_failed_refund(&record).await {
            error!(
                ?err,
                account_id = %pending.account_id,
                operation_id = %pending.operation_id,
                cost = pending.charged,
                failure,
                "could not persist failed refund"
            );
        }
    }

    pub async fn failed_refunds(&self, limit: i64) -> LedgerResult<Vec<FailedRefund>> {
        Ok(self.ledger.store().pending_failed_refunds(limit).await?)
    }

    /// Re-applies recorded refunds that could not be credited at failure time.
    pub async fn replay_failed_refunds(&self, limit: i64) -> LedgerResult<usize> {
        let mut replayed = 0;
        for failure in self.failed_refunds(limit).await? {
            let draft = TransactionDraft::new(
                format!("replayed refund: {}", failure.failure_reason),
                Utc::now(),
            );
            match self
                .ledger
                .store()
                .resolve_failed_refund(failure.id, &draft)
                .await
            {
                Ok(Some(mutation)) => {
                    replayed += 1;
                    info!(
                        account_id = %failure.account_id,
                        operation_id = %failure.operation_id,
                        cost = failure.cost,
                        balance = mutation.balance.current_balance,
                        "failed refund replayed"
                    );
                }
                Ok(None) => warn!(
                    account_id = %failure.account_id,
                    operation_id = %failure.operation_id,
                    "failed refund could not be replayed"
                ),
                Err(err) => warn!(
                    ?err,
                    account_id = %failure.account_id,
                    operation_id = %failure.operation_id,
                    "failed refund replay errored"
                ),
            }
        }
        Ok(replayed)
    }
}
