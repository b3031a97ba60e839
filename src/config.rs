use std::collections::HashMap;
use std::fs;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::credits::models::{Tier, TierEntitlement};

/// Postgres connection string. When unset the service runs on the in-memory store.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: credits-config -> shared secret for provider webhook signatures
pub static CREDIT_WEBHOOK_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("CREDIT_WEBHOOK_SECRET", "CREDIT_WEBHOOK_SECRET_FILE"));

/// key: credits-config -> bearer token for operator endpoints
pub static CREDIT_ADMIN_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("CREDIT_ADMIN_TOKEN", "CREDIT_ADMIN_TOKEN_FILE"));

/// key: credits-config -> idempotency record lifetime
pub static CREDIT_IDEMPOTENCY_TTL_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("CREDIT_IDEMPOTENCY_TTL_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// key: credits-config -> expired idempotency sweep cadence
pub static CREDIT_IDEMPOTENCY_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("CREDIT_IDEMPOTENCY_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: credits-config -> entitlement reset scan cadence
pub static CREDIT_RESET_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("CREDIT_RESET_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(900)
});

/// key: credits-config -> accounts reset per scan batch
pub static CREDIT_RESET_BATCH_SIZE: Lazy<i64> = Lazy::new(|| {
    std::env::var("CREDIT_RESET_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(500)
});

/// Operation kind to credit cost, e.g. `{"ad_analysis": 1}` via `CREDIT_OPERATION_COSTS`.
pub static CREDIT_OPERATION_COSTS: Lazy<OperationCostTable> = Lazy::new(|| {
    let value = json_from_env("CREDIT_OPERATION_COSTS", OperationCostTable::default_value());
    OperationCostTable::from_value(value)
        .unwrap_or_else(|err| panic!("invalid CREDIT_OPERATION_COSTS: {err}"))
});

/// Tier to entitlement mapping supplied via `CREDIT_TIER_CATALOG`.
pub static CREDIT_TIER_CATALOG: Lazy<TierCatalog> = Lazy::new(|| {
    let value = json_from_env("CREDIT_TIER_CATALOG", TierCatalog::default_value());
    TierCatalog::from_value(value)
        .unwrap_or_else(|err| panic!("invalid CREDIT_TIER_CATALOG: {err}"))
});

/// key: credits-cost-table -> static operation pricing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationCostTable {
    costs: HashMap<String, i64>,
}

impl OperationCostTable {
    pub fn new(costs: HashMap<String, i64>) -> Result<Self> {
        if let Some((kind, cost)) = costs.iter().find(|(_, cost)| **cost < 0) {
            bail!("operation `{kind}` has negative cost {cost}");
        }
        Ok(Self { costs })
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let costs: HashMap<String, i64> = serde_json::from_value(value)
            .map_err(|err| anyhow!("expected an object of integer costs: {err}"))?;
        Self::new(costs)
    }

    pub fn cost(&self, operation_kind: &str) -> Option<i64> {
        self.costs.get(operation_kind).copied()
    }

    fn default_value() -> Value {
        json!({
            "ad_analysis": 1,
            "ad_generation": 2,
            "competitor_report": 3,
        })
    }
}

impl Default for OperationCostTable {
    fn default() -> Self {
        Self::from_value(Self::default_value()).unwrap_or_else(|_| Self {
            costs: HashMap::new(),
        })
    }
}

/// key: credits-tier-catalog -> allowance and rollover per tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierCatalog {
    tiers: HashMap<Tier, TierEntitlement>,
}

impl TierCatalog {
    pub fn from_value(value: Value) -> Result<Self> {
        let tiers: HashMap<Tier, TierEntitlement> = serde_json::from_value(value)
            .map_err(|err| anyhow!("expected an object keyed by tier: {err}"))?;
        for tier in [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise] {
            let entitlement = tiers
                .get(&tier)
                .ok_or_else(|| anyhow!("tier `{}` missing from catalog", tier.as_str()))?;
            if entitlement.monthly_allowance < 0 || entitlement.rollover_cap < 0 {
                bail!("tier `{}` has a negative allowance or cap", tier.as_str());
            }
        }
        Ok(Self { tiers })
    }

    pub fn entitlement(&self, tier: Tier) -> TierEntitlement {
        self.tiers.get(&tier).copied().unwrap_or(TierEntitlement {
            monthly_allowance: 0,
            rollover_cap: 0,
            unlimited: false,
        })
    }

    fn default_value() -> Value {
        json!({
            "free": { "monthly_allowance": 10, "rollover_cap": 0 },
            "starter": { "monthly_allowance": 100, "rollover_cap": 50 },
            "pro": { "monthly_allowance": 500, "rollover_cap": 250 },
            "enterprise": { "monthly_allowance": 0, "rollover_cap": 0, "unlimited": true },
        })
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::from_value(Self::default_value()).unwrap_or_else(|_| Self {
            tiers: HashMap::new(),
        })
    }
}

/// key: credits-ledger-config -> values handed to services
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub idempotency_ttl: chrono::Duration,
    pub reset_batch_size: i64,
    pub operation_costs: OperationCostTable,
    pub tiers: TierCatalog,
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self {
            idempotency_ttl: chrono::Duration::days(*CREDIT_IDEMPOTENCY_TTL_DAYS),
            reset_batch_size: *CREDIT_RESET_BATCH_SIZE,
            operation_costs: CREDIT_OPERATION_COSTS.clone(),
            tiers: CREDIT_TIER_CATALOG.clone(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: chrono::Duration::days(30),
            reset_batch_size: 500,
            operation_costs: OperationCostTable::default(),
            tiers: TierCatalog::default(),
        }
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}

fn json_from_env(var: &str, default_value: Value) -> Value {
    match std::env::var(var) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                default_value
            } else {
                serde_json::from_str(trimmed)
                    .unwrap_or_else(|err| panic!("failed to parse {var} as JSON: {err}"))
            }
        }
        Err(_) => default_value,
    }
}
