use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BalanceOverflow;

/// key: credits-tier -> subscription level
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "starter" => Some(Self::Starter),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

/// Numeric entitlement attached to a tier by the configured catalog.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierEntitlement {
    pub monthly_allowance: i64,
    pub rollover_cap: i64,
    #[serde(default)]
    pub unlimited: bool,
}

/// key: credits-transaction-kind -> audit classification
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Consume,
    Refund,
    Allocation,
    Reset,
    ManualAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Consume => "CONSUME",
            TransactionKind::Refund => "REFUND",
            TransactionKind::Allocation => "ALLOCATION",
            TransactionKind::Reset => "RESET",
            TransactionKind::ManualAdjustment => "MANUAL_ADJUSTMENT",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "CONSUME" => Some(Self::Consume),
            "REFUND" => Some(Self::Refund),
            "ALLOCATION" => Some(Self::Allocation),
            "RESET" => Some(Self::Reset),
            "MANUAL_ADJUSTMENT" => Some(Self::ManualAdjustment),
            _ => None,
        }
    }
}

/// key: credits-balance-model -> one row per account
/// Mutated only through `AccountLedger`; `current_balance` never goes below zero.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditBalance {
    pub account_id: String,
    pub tier: Tier,
    pub is_unlimited: bool,
    pub current_balance: i64,
    pub monthly_allowance: i64,
    pub bonus_credits: i64,
    pub bonus_expires_at: Option<DateTime<Utc>>,
    pub rollover_cap: i64,
    pub total_consumed_lifetime: i64,
    pub last_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    pub fn unexpired_bonus(&self, now: DateTime<Utc>) -> i64 {
        match self.bonus_expires_at {
            Some(expires_at) if expires_at <= now => 0,
            _ => self.bonus_credits,
        }
    }

    pub fn next_reset_at(&self) -> Option<DateTime<Utc>> {
        self.last_reset_at.checked_add_months(Months::new(1))
    }

    pub fn is_due_for_reset(&self, now: DateTime<Utc>) -> bool {
        self.next_reset_at().map(|next| next <= now).unwrap_or(false)
    }

    /// Computes the monthly reset for the latest boundary at or before `now`.
    /// Returns `Ok(None)` when that boundary has already been applied.
    ///
    /// A bonus without an expiry is granted again at every boundary.
    pub fn plan_reset(
        &self,
        new_allowance: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetPlan>, BalanceOverflow> {
        let Some(boundary) = latest_boundary(self.last_reset_at, now) else {
            return Ok(None);
        };
        let rollover = self.current_balance.min(self.rollover_cap).max(0);
        let bonus = self.unexpired_bonus(now);
        let new_balance = rollover
            .checked_add(new_allowance)
            .and_then(|sum| sum.checked_add(bonus))
            .ok_or_else(|| BalanceOverflow::new(&self.account_id))?;
        Ok(Some(ResetPlan {
            boundary,
            rollover,
            bonus_credits: bonus,
            new_balance,
            delta: new_balance - self.current_balance,
        }))
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            account_id: self.account_id.clone(),
            current_balance: if self.is_unlimited {
                DisplayBalance::Unlimited
            } else {
                DisplayBalance::Credits(self.current_balance)
            },
            monthly_allowance: self.monthly_allowance,
            bonus_credits: self.bonus_credits,
            total_used: self.total_consumed_lifetime,
            tier: self.tier,
            last_reset_at: self.last_reset_at,
            next_reset_at: self.next_reset_at(),
        }
    }
}

/// Latest `anchor + n months` (n >= 1) that is not after `now`. Offsets are always taken
/// from the anchor so month-end anchors do not drift.
fn latest_boundary(anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut latest = None;
    let mut months = 1u32;
    while let Some(candidate) = anchor.checked_add_months(Months::new(months)) {
        if candidate > now {
            break;
        }
        latest = Some(candidate);
        months += 1;
    }
    latest
}

/// key: credits-reset-plan -> rollover + allowance + bonus
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetPlan {
    pub boundary: DateTime<Utc>,
    pub rollover: i64,
    pub bonus_credits: i64,
    pub new_balance: i64,
    pub delta: i64,
}

/// Balance as shown to callers; unlimited accounts render as `"unlimited"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayBalance {
    Credits(i64),
    Unlimited,
}

impl Serialize for DisplayBalance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DisplayBalance::Credits(value) => serializer.serialize_i64(*value),
            DisplayBalance::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// key: credits-balance-query -> read model
#[derive(Clone, Debug, Serialize)]
pub struct BalanceSnapshot {
    pub account_id: String,
    pub current_balance: DisplayBalance,
    pub monthly_allowance: i64,
    pub bonus_credits: i64,
    pub total_used: i64,
    pub tier: Tier,
    pub last_reset_at: DateTime<Utc>,
    pub next_reset_at: Option<DateTime<Utc>>,
}

/// key: credits-transaction-model -> immutable audit entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditTransaction {
    pub transaction_id: Uuid,
    pub account_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub related_operation_id: Option<Uuid>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn new(
        account_id: &str,
        kind: TransactionKind,
        amount: i64,
        balance_after: i64,
        draft: &TransactionDraft,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind,
            amount,
            balance_after,
            related_operation_id: draft.related_operation_id,
            reason: draft.reason.clone(),
            created_at: draft.at,
        }
    }
}

/// Caller-supplied context for the transaction a mutation appends.
#[derive(Clone, Debug)]
pub struct TransactionDraft {
    pub related_operation_id: Option<Uuid>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl TransactionDraft {
    pub fn new(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            related_operation_id: None,
            reason: reason.into(),
            at,
        }
    }

    pub fn for_operation(mut self, operation_id: Uuid) -> Self {
        self.related_operation_id = Some(operation_id);
        self
    }
}

/// key: credits-history-filter
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub kind: Option<TransactionKind>,
    pub limit: Option<i64>,
}

impl HistoryFilter {
    pub fn matches(&self, transaction: &CreditTransaction) -> bool {
        if let Some(start) = self.start {
            if transaction.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if transaction.created_at > end {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if transaction.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Provisioning request for a new balance row.
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub account_id: String,
    pub tier: Tier,
    pub entitlement: TierEntitlement,
    pub opened_at: DateTime<Utc>,
}

/// key: credits-allocation-grant -> provider-sourced entitlement sync
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AllocationGrant {
    pub tier: Tier,
    pub is_unlimited: bool,
    pub monthly_allowance: i64,
    pub rollover_cap: i64,
    pub bonus_credits: i64,
    pub bonus_expires_at: Option<DateTime<Utc>>,
}

impl AllocationGrant {
    /// Allowance plus bonus; `None` when the sum does not fit in an `i64`.
    pub fn amount(&self) -> Option<i64> {
        self.monthly_allowance.checked_add(self.bonus_credits)
    }
}

/// key: credits-idempotency-record -> webhook dedup
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub result_snapshot: Value,
}

/// key: credits-failed-refund -> dead letter for manual replay
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedRefund {
    pub id: Uuid,
    pub account_id: String,
    pub operation_id: Uuid,
    pub operation_kind: String,
    pub cost: i64,
    pub failure_reason: String,
    pub refund_error: String,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
