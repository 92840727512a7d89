//! Signals, decisions and advisory warnings produced by the engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountState;
use super::fill::{Fill, PositionSide};
use super::position::{MarginMode, Position, PositionKey};

/// A leader fill enriched with the leader context needed to act on it.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub fill: Fill,
    pub leader_equity: Decimal,
    /// Leader position the fill was matched to
    pub position: Option<Position>,
    /// Mapping the fill was matched to
    pub mapping_id: Option<i64>,
}

impl TradeSignal {
    pub fn new(fill: Fill, state: &AccountState) -> Self {
        Self {
            fill,
            leader_equity: state.total_equity,
            position: None,
            mapping_id: None,
        }
    }
}

/// Normalized order intent for the follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl DecisionAction {
    pub fn open(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => Self::OpenLong,
            PositionSide::Short => Self::OpenShort,
        }
    }

    pub fn close(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => Self::CloseLong,
            PositionSide::Short => Self::CloseShort,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
        }
    }
}

/// What the follower should do in response to one leader fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub follower_id: String,
    pub leader_id: String,
    pub fill_id: String,
    pub symbol: String,
    pub action: DecisionAction,

    /// Order value in quote currency (opens and adds)
    pub size_usd: Decimal,

    pub leverage: u32,
    pub margin_mode: MarginMode,

    /// Fraction of the follower position to close (closes and reduces)
    pub close_ratio: Decimal,

    pub leader_position: PositionKey,
    pub mapping_id: Option<i64>,

    /// Human-readable reason for the decision
    pub rationale: String,

    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_full_close(&self) -> bool {
        !self.action.is_open() && self.close_ratio >= Decimal::ONE
    }
}

/// Kind of advisory warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Copy size raised to the configured minimum
    SizeBoosted,
    /// Copy size above the configured maximum
    HighValue,
    /// Follower equity is zero or negative
    ZeroBalance,
    /// Copy size reduced to what the available balance can margin
    BalanceClamped,
    /// Decision queue full; decision dropped
    QueueFull,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SizeBoosted => "size_boosted",
            Self::HighValue => "high_value",
            Self::ZeroBalance => "zero_balance",
            Self::BalanceClamped => "balance_clamped",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Advisory record; thresholds never block execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
    pub signal_value: Decimal,
    pub copy_value: Decimal,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>, signal_value: Decimal, copy_value: Decimal) -> Self {
        Self {
            kind,
            message: message.into(),
            signal_value,
            copy_value,
            executed: true,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of handing a decision to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }
}

/// Execution result reported back by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub decision_id: Uuid,
    pub follower_id: String,
    pub mapping_id: Option<i64>,
    pub symbol: String,
    pub action: DecisionAction,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn for_decision(decision: &Decision, status: ExecutionStatus, error: Option<String>) -> Self {
        Self {
            decision_id: decision.id,
            follower_id: decision.follower_id.clone(),
            mapping_id: decision.mapping_id,
            symbol: decision.symbol.clone(),
            action: decision.action,
            status,
            error,
            executed_at: Utc::now(),
        }
    }
}
