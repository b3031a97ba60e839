pub mod api;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod scheduler;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod transactions;
pub mod webhook;

use std::sync::Arc;

use crate::config::LedgerConfig;

pub use gateway::{Charged, ConsumptionGateway, OperationContext, OperationReceipt};
pub use idempotency::IdempotencyStore;
pub use ledger::{AccountLedger, ResetResult};
pub use memory::MemoryLedgerStore;
pub use models::{
    AllocationGrant, BalanceSnapshot, CreditBalance, CreditTransaction, DisplayBalance,
    FailedRefund, HistoryFilter, IdempotencyRecord, Tier, TierEntitlement, TransactionDraft,
    TransactionKind,
};
pub use postgres::PgLedgerStore;
pub use scheduler::EntitlementScheduler;
pub use store::{
    DebitOutcome, DueAccount, EventOutcome, LedgerMutation, LedgerStore, ResetOutcome,
};
pub use transactions::{Reconciliation, TransactionLog};
pub use webhook::{SignedEvent, WebhookIngester, WebhookOutcome, SIGNATURE_HEADER};

/// key: credits-services -> components shared with handlers and workers
#[derive(Clone)]
pub struct LedgerServices {
    pub ledger: AccountLedger,
    pub transactions: TransactionLog,
    pub gateway: ConsumptionGateway,
    pub idempotency: IdempotencyStore,
    pub webhooks: WebhookIngester,
    pub admin_token: Option<Arc<str>>,
    reset_batch_size: i64,
}

impl LedgerServices {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: LedgerConfig,
        webhook_secret: impl AsRef<[u8]>,
        admin_token: Option<String>,
    ) -> Self {
        let ledger = AccountLedger::new(store.clone(), config.tiers.clone());
        let idempotency = IdempotencyStore::new(store.clone(), config.idempotency_ttl);
        Self {
            transactions: TransactionLog::new(store),
            gateway: ConsumptionGateway::new(ledger.clone(), config.operation_costs),
            webhooks: WebhookIngester::new(webhook_secret, idempotency.clone(), config.tiers),
            idempotency,
            ledger,
            admin_token: admin_token.map(Arc::from),
            reset_batch_size: config.reset_batch_size,
        }
    }

    pub fn scheduler(&self) -> EntitlementScheduler {
        EntitlementScheduler::new(self.ledger.clone(), self.reset_batch_size)
    }
}
