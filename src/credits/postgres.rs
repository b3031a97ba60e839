use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::BalanceOverflow;

use super::models::{
    AllocationGrant, CreditBalance, CreditTransaction, FailedRefund, HistoryFilter,
    IdempotencyRecord, NewAccount, Tier, TransactionDraft, TransactionKind,
};
use super::store::{
    allocation_snapshot, DebitOutcome, DueAccount, EventOutcome, LedgerMutation, LedgerStore,
    ResetOutcome,
};

/// key: credits-pg-store -> postgres backend
///
/// Balance changes are single conditional `UPDATE ... RETURNING` statements run
/// in the same database transaction as the audit insert.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_balance(&self, account_id: &str) -> sqlx::Result<Option<i64>> {
        sqlx::query_scalar("SELECT current_balance FROM credit_balances WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, FromRow)]
struct BalanceRow {
    account_id: String,
    tier: String,
    is_unlimited: bool,
    current_balance: i64,
    monthly_allowance: i64,
    bonus_credits: i64,
    bonus_expires_at: Option<DateTime<Utc>>,
    rollover_cap: i64,
    total_consumed_lifetime: i64,
    last_reset_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BalanceRow> for CreditBalance {
    type Error = sqlx::Error;

    fn try_from(row: BalanceRow) -> sqlx::Result<Self> {
        let tier = Tier::from_str(&row.tier)
            .ok_or_else(|| decode_error(format!("unknown tier `{}`", row.tier)))?;
        Ok(CreditBalance {
            account_id: row.account_id,
            tier,
            is_unlimited: row.is_unlimited,
            current_balance: row.current_balance,
            monthly_allowance: row.monthly_allowance,
            bonus_credits: row.bonus_credits,
            bonus_expires_at: row.bonus_expires_at,
            rollover_cap: row.rollover_cap,
            total_consumed_lifetime: row.total_consumed_lifetime,
            last_reset_at: row.last_reset_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    account_id: String,
    kind: String,
    amount: i64,
    balance_after: i64,
    related_operation_id: Option<Uuid>,
    reason: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = sqlx::Error;

    fn try_from(row: TransactionRow) -> sqlx::Result<Self> {
        let kind = TransactionKind::from_str(&row.kind)
            .ok_or_else(|| decode_error(format!("unknown transaction kind `{}`", row.kind)))?;
        Ok(CreditTransaction {
            transaction_id: row.transaction_id,
            account_id: row.account_id,
            kind,
            amount: row.amount,
            balance_after: row.balance_after,
            related_operation_id: row.related_operation_id,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    event_id: String,
    first_seen_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    result_snapshot: serde_json::Value,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        IdempotencyRecord {
            event_id: row.event_id,
            first_seen_at: row.first_seen_at,
            expires_at: row.expires_at,
            result_snapshot: row.result_snapshot,
        }
    }
}

#[derive(Debug, FromRow)]
struct FailedRefundRow {
    id: Uuid,
    account_id: String,
    operation_id: Uuid,
    operation_kind: String,
    cost: i64,
    failure_reason: String,
    refund_error: String,
    recorded_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<FailedRefundRow> for FailedRefund {
    fn from(row: FailedRefundRow) -> Self {
        FailedRefund {
            id: row.id,
            account_id: row.account_id,
            operation_id: row.operation_id,
            operation_kind: row.operation_kind,
            cost: row.cost,
            failure_reason: row.failure_reason,
            refund_error: row.refund_error,
            recorded_at: row.recorded_at,
            resolved_at: row.resolved_at,
        }
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

async fn insert_transaction<'e, E>(executor: E, transaction: &CreditTransaction) -> sqlx::Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO credit_transactions (
            transaction_id,
            account_id,
            kind,
            amount,
            balance_after,
            related_operation_id,
            reason,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(transaction.transaction_id)
    .bind(&transaction.account_id)
    .bind(transaction.kind.as_str())
    .bind(transaction.amount)
    .bind(transaction.balance_after)
    .bind(transaction.related_operation_id)
    .bind(&transaction.reason)
    .bind(transaction.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

const CREDIT_SQL: &str = r#"
    UPDATE credit_balances
    SET current_balance = current_balance + $2,
        total_consumed_lifetime = CASE
            WHEN $3 THEN GREATEST(total_consumed_lifetime - $2, 0)
            ELSE total_consumed_lifetime
        END,
        updated_at = $4
    WHERE account_id = $1
    RETURNING *
"#;

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn open_account(&self, account: &NewAccount) -> sqlx::Result<CreditBalance> {
        let mut tx = self.pool.begin().await?;
        let created = sqlx::query_as::<_, BalanceRow>(
            r#"
            INSERT INTO credit_balances (
                account_id,
                tier,
                is_unlimited,
                current_balance,
                monthly_allowance,
                bonus_credits,
                rollover_cap,
                total_consumed_lifetime,
                last_reset_at,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $4, 0, $5, 0, $6, $6, $6)
            ON CONFLICT (account_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&account.account_id)
        .bind(account.tier.as_str())
        .bind(account.entitlement.unlimited)
        .bind(account.entitlement.monthly_allowance)
        .bind(account.entitlement.rollover_cap)
        .bind(account.opened_at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = created else {
            tx.rollback().await?;
            let existing = sqlx::query_as::<_, BalanceRow>(
                "SELECT * FROM credit_balances WHERE account_id = $1",
            )
            .bind(&account.account_id)
            .fetch_one(&self.pool)
            .await?;
            return CreditBalance::try_from(existing);
        };

        let balance = CreditBalance::try_from(row)?;
        let draft = TransactionDraft::new("opening allowance", account.opened_at);
        let transaction = CreditTransaction::new(
            &balance.account_id,
            TransactionKind::Allocation,
            account.entitlement.monthly_allowance,
            balance.current_balance,
            &draft,
        );
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn fetch_balance(&self, account_id: &str) -> sqlx::Result<Option<CreditBalance>> {
        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT * FROM credit_balances WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CreditBalance::try_from).transpose()
    }

    async fn consume(
        &self,
        account_id: &str,
        cost: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            UPDATE credit_balances
            SET current_balance = current_balance - CASE WHEN is_unlimited THEN 0 ELSE $2 END,
                total_consumed_lifetime = total_consumed_lifetime + $2,
                updated_at = $3
            WHERE account_id = $1
              AND (is_unlimited OR current_balance >= $2)
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(cost)
        .bind(draft.at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            // Diagnosis only; the rejection was already decided by the update.
            return Ok(match self.current_balance(account_id).await? {
                Some(available) => DebitOutcome::Insufficient { available },
                None => DebitOutcome::UnknownAccount,
            });
        };

        let balance = CreditBalance::try_from(row)?;
        let charged = if balance.is_unlimited { 0 } else { cost };
        let transaction = CreditTransaction::new(
            account_id,
            TransactionKind::Consume,
            -charged,
            balance.current_balance,
            draft,
        );
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(DebitOutcome::Applied(LedgerMutation {
            balance,
            transaction,
        }))
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, BalanceRow>(CREDIT_SQL)
            .bind(account_id)
            .bind(amount)
            .bind(kind == TransactionKind::Refund)
            .bind(draft.at)
            .fetch_optional(&mut tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let balance = CreditBalance::try_from(row)?;
        let transaction =
            CreditTransaction::new(account_id, kind, amount, balance.current_balance, draft);
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(Some(LedgerMutation {
            balance,
            transaction,
        }))
    }

    async fn adjust(
        &self,
        account_id: &str,
        amount: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<DebitOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            UPDATE credit_balances
            SET current_balance = current_balance + $2,
                updated_at = $3
            WHERE account_id = $1
              AND current_balance + $2 >= 0
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .bind(draft.at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(match self.current_balance(account_id).await? {
                Some(available) => DebitOutcome::Insufficient { available },
                None => DebitOutcome::UnknownAccount,
            });
        };

        let balance = CreditBalance::try_from(row)?;
        let transaction = CreditTransaction::new(
            account_id,
            TransactionKind::ManualAdjustment,
            amount,
            balance.current_balance,
            draft,
        );
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(DebitOutcome::Applied(LedgerMutation {
            balance,
            transaction,
        }))
    }

    async fn reset(
        &self,
        account_id: &str,
        new_allowance: i64,
        draft: &TransactionDraft,
    ) -> sqlx::Result<ResetOutcome> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, BalanceRow>(
            "SELECT * FROM credit_balances WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut tx)
        .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(ResetOutcome::UnknownAccount);
        };
        let current = CreditBalance::try_from(current)?;

        let Some(plan) = current.plan_reset(new_allowance, draft.at)? else {
            tx.rollback().await?;
            return Ok(ResetOutcome::AlreadyReset(current));
        };

        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            UPDATE credit_balances
            SET current_balance = $2,
                monthly_allowance = $3,
                last_reset_at = $4,
                bonus_credits = CASE WHEN $5 THEN 0 ELSE bonus_credits END,
                bonus_expires_at = CASE WHEN $5 THEN NULL ELSE bonus_expires_at END,
                updated_at = $6
            WHERE account_id = $1
              AND last_reset_at = $7
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(plan.new_balance)
        .bind(new_allowance)
        .bind(plan.boundary)
        .bind(plan.bonus_credits == 0)
        .bind(draft.at)
        .bind(current.last_reset_at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(ResetOutcome::AlreadyReset(current));
        };

        let balance = CreditBalance::try_from(row)?;
        let transaction = CreditTransaction::new(
            account_id,
            TransactionKind::Reset,
            plan.delta,
            balance.current_balance,
            draft,
        );
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(ResetOutcome::Applied(LedgerMutation {
            balance,
            transaction,
        }))
    }

    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueAccount>,
        limit: i64,
    ) -> sqlx::Result<Vec<DueAccount>> {
        let rows: Vec<(DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT last_reset_at, account_id
            FROM credit_balances
            WHERE last_reset_at + INTERVAL '1 month' <= $1
              AND ($2::timestamptz IS NULL OR (last_reset_at, account_id) > ($2, $3::text))
            ORDER BY last_reset_at ASC, account_id ASC
            LIMIT $4
            "#,
        )
        .bind(now)
        .bind(after.map(|cursor| cursor.last_reset_at))
        .bind(after.map(|cursor| cursor.account_id.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(last_reset_at, account_id)| DueAccount {
                last_reset_at,
                account_id,
            })
            .collect())
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> sqlx::Result<()> {
        insert_transaction(&self.pool, transaction).await
    }

    async fn history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> sqlx::Result<Vec<CreditTransaction>> {
        let mut builder = QueryBuilder::new(
            "SELECT transaction_id, account_id, kind, amount, balance_after, related_operation_id, reason, created_at \
             FROM credit_transactions ",
        );
        builder.push("WHERE account_id = ");
        builder.push_bind(account_id);

        if let Some(start) = filter.start {
            builder.push(" AND created_at >= ");
            builder.push_bind(start);
        }

        if let Some(end) = filter.end {
            builder.push(" AND created_at <= ");
            builder.push_bind(end);
        }

        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_str());
        }

        builder.push(" ORDER BY created_at ASC, sequence ASC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build_query_as::<TransactionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn record_event(
        &self,
        record: &IdempotencyRecord,
        account_id: &str,
        grant: &AllocationGrant,
        draft: &TransactionDraft,
    ) -> sqlx::Result<EventOutcome> {
        let amount = grant
            .amount()
            .ok_or_else(|| BalanceOverflow::new(account_id))?;
        let mut tx = self.pool.begin().await?;
        // Concurrent deliveries of one event block on the primary key until
        // the first transaction commits or rolls back.
        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_idempotency_records (event_id, first_seen_at, expires_at, result_snapshot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(record.first_seen_at)
        .bind(record.expires_at)
        .bind(&record.result_snapshot)
        .execute(&mut tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let existing = self
                .find_event(&record.event_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            return Ok(EventOutcome::Duplicate(existing));
        }

        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            INSERT INTO credit_balances (
                account_id,
                tier,
                is_unlimited,
                current_balance,
                monthly_allowance,
                bonus_credits,
                bonus_expires_at,
                rollover_cap,
                total_consumed_lifetime,
                last_reset_at,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $9, $9)
            ON CONFLICT (account_id)
            DO UPDATE SET
                tier = EXCLUDED.tier,
                is_unlimited = EXCLUDED.is_unlimited,
                current_balance = credit_balances.current_balance + EXCLUDED.current_balance,
                monthly_allowance = EXCLUDED.monthly_allowance,
                rollover_cap = EXCLUDED.rollover_cap,
                bonus_credits = CASE
                    WHEN EXCLUDED.bonus_credits > 0 THEN EXCLUDED.bonus_credits
                    ELSE credit_balances.bonus_credits
                END,
                bonus_expires_at = CASE
                    WHEN EXCLUDED.bonus_credits > 0 THEN EXCLUDED.bonus_expires_at
                    ELSE credit_balances.bonus_expires_at
                END,
                last_reset_at = EXCLUDED.last_reset_at,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(grant.tier.as_str())
        .bind(grant.is_unlimited)
        .bind(amount)
        .bind(grant.monthly_allowance)
        .bind(grant.bonus_credits)
        .bind(grant.bonus_expires_at)
        .bind(grant.rollover_cap)
        .bind(draft.at)
        .fetch_one(&mut tx)
        .await?;

        let balance = CreditBalance::try_from(row)?;
        let transaction = CreditTransaction::new(
            account_id,
            TransactionKind::Allocation,
            amount,
            balance.current_balance,
            draft,
        );
        insert_transaction(&mut tx, &transaction).await?;

        let mutation = LedgerMutation {
            balance,
            transaction,
        };
        let mut stored = record.clone();
        stored.result_snapshot = allocation_snapshot(&mutation);
        sqlx::query(
            "UPDATE credit_idempotency_records SET result_snapshot = $2 WHERE event_id = $1",
        )
        .bind(&stored.event_id)
        .bind(&stored.result_snapshot)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;

        Ok(EventOutcome::Applied {
            mutation,
            record: stored,
        })
    }

    async fn find_event(&self, event_id: &str) -> sqlx::Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM credit_idempotency_records WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(IdempotencyRecord::from))
    }

    async fn sweep_events(&self, now: DateTime<Utc>) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM credit_idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_failed_refund(&self, failure: &FailedRefund) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_failed_refunds (
                id,
                account_id,
                operation_id,
                operation_kind,
                cost,
                failure_reason,
                refund_error,
                recorded_at,
                resolved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(failure.id)
        .bind(&failure.account_id)
        .bind(failure.operation_id)
        .bind(&failure.operation_kind)
        .bind(failure.cost)
        .bind(&failure.failure_reason)
        .bind(&failure.refund_error)
        .bind(failure.recorded_at)
        .bind(failure.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_failed_refunds(&self, limit: i64) -> sqlx::Result<Vec<FailedRefund>> {
        let rows = sqlx::query_as::<_, FailedRefundRow>(
            r#"
            SELECT * FROM credit_failed_refunds
            WHERE resolved_at IS NULL
            ORDER BY recorded_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FailedRefund::from).collect())
    }

    async fn resolve_failed_refund(
        &self,
        id: Uuid,
        draft: &TransactionDraft,
    ) -> sqlx::Result<Option<LedgerMutation>> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<(String, Uuid, i64)> = sqlx::query_as(
            r#"
            UPDATE credit_failed_refunds
            SET resolved_at = $2
            WHERE id = $1 AND resolved_at IS NULL
            RETURNING account_id, operation_id, cost
            "#,
        )
        .bind(id)
        .bind(draft.at)
        .fetch_optional(&mut tx)
        .await?;
        let Some((account_id, operation_id, cost)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row = sqlx::query_as::<_, BalanceRow>(CREDIT_SQL)
            .bind(&account_id)
            .bind(cost)
            .bind(true)
            .bind(draft.at)
            .fetch_optional(&mut tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let balance = CreditBalance::try_from(row)?;
        let draft = draft.clone().for_operation(operation_id);
        let transaction = CreditTransaction::new(
            &account_id,
            TransactionKind::Refund,
            cost,
            balance.current_balance,
            &draft,
        );
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(Some(LedgerMutation {
            balance,
            transaction,
        }))
    }
}
