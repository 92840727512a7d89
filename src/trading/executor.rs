//! Follower-side order execution contract.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::info;

use crate::models::Decision;

/// Places follower orders. The engine never retries a call.
#[async_trait]
pub trait DecisionExecutor: Send + Sync {
    async fn execute_decision(&self, decision: &Decision) -> Result<()>;

    /// Account summary with at least `total_equity` and `available_balance`.
    async fn get_account_info(&self) -> Result<Map<String, Value>>;

    async fn get_positions(&self) -> Result<Vec<Map<String, Value>>>;
}

/// Follower equity and free balance as reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowerBalance {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
}

impl FollowerBalance {
    /// Read the balance keys out of `get_account_info`. Values may be JSON
    /// strings or numbers; a missing available balance falls back to equity.
    pub fn from_account_info(info: &Map<String, Value>) -> Result<Self> {
        let total_equity = decimal_field(info, "total_equity")?.context("account info has no total_equity")?;
        let available_balance = decimal_field(info, "available_balance")?.unwrap_or(total_equity);

        Ok(Self {
            total_equity,
            available_balance,
        })
    }
}

fn decimal_field(info: &Map<String, Value>, key: &str) -> Result<Option<Decimal>> {
    match info.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Decimal::from_str(s)
            .map(Some)
            .with_context(|| format!("invalid {} {:?}", key, s)),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .with_context(|| format!("invalid {} {}", key, n)),
        Some(other) => anyhow::bail!("invalid {} {}", key, other),
    }
}

/// Executor that only logs decisions and reports a fixed balance.
pub struct DryRunExecutor {
    total_equity: Decimal,
    available_balance: Decimal,
    executed: AtomicUsize,
}

impl DryRunExecutor {
    pub fn new(total_equity: Decimal) -> Self {
        Self {
            total_equity,
            available_balance: total_equity,
            executed: AtomicUsize::new(0),
        }
    }

    pub fn with_available(mut self, available_balance: Decimal) -> Self {
        self.available_balance = available_balance;
        self
    }

    /// Number of decisions handled so far.
    pub fn executed_count(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DecisionExecutor for DryRunExecutor {
    async fn execute_decision(&self, decision: &Decision) -> Result<()> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        info!(
            follower = %decision.follower_id,
            symbol = %decision.symbol,
            action = decision.action.as_str(),
            size_usd = %decision.size_usd,
            close_ratio = %decision.close_ratio,
            leverage = decision.leverage,
            margin_mode = %decision.margin_mode,
            "[DRY RUN] Would execute decision"
        );
        Ok(())
    }

    async fn get_account_info(&self) -> Result<Map<String, Value>> {
        let mut info = Map::new();
        info.insert("total_equity".to_string(), Value::String(self.total_equity.to_string()));
        info.insert(
            "available_balance".to_string(),
            Value::String(self.available_balance.to_string()),
        );
        Ok(info)
    }

    async fn get_positions(&self) -> Result<Vec<Map<String, Value>>> {
        Ok(Vec::new())
    }
}
