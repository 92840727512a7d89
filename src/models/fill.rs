//! Fill model representing one executed leader trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// Side of the position a fill applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Economic effect of a fill on the leader's position, as reported by the venue adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillAction {
    /// First fill of a position that did not exist before
    Open,
    /// Increase of an existing position
    Add,
    /// Partial decrease
    Reduce,
    /// Decrease to zero
    Close,
}

impl FillAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillAction::Open => "open",
            FillAction::Add => "add",
            FillAction::Reduce => "reduce",
            FillAction::Close => "close",
        }
    }

    /// Whether the fill grows the position.
    pub fn is_increase(&self) -> bool {
        matches!(self, FillAction::Open | FillAction::Add)
    }

    /// Actions whose classification depends on an up-to-date leader size.
    pub fn needs_fresh_state(&self) -> bool {
        matches!(self, FillAction::Open | FillAction::Add | FillAction::Close)
    }
}

/// One executed leader trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Venue trade identifier, unique per leader
    pub id: String,

    /// Normalized symbol (e.g. "BTCUSDT")
    pub symbol: String,

    /// Order direction
    pub side: TradeSide,

    /// Position side the fill applies to
    pub position_side: PositionSide,

    /// Economic action reported by the venue
    pub action: FillAction,

    /// Execution price
    pub price: Decimal,

    /// Executed size in venue units (contracts or coins)
    pub size: Decimal,

    /// Quote-currency value of the fill
    pub notional: Decimal,

    /// When the fill happened
    pub timestamp: DateTime<Utc>,

    /// Realized P&L reported with the fill
    #[serde(default)]
    pub realized_pnl: Decimal,
}

impl Fill {
    /// True when the leader had no position on this side before the fill.
    pub fn is_fresh_open(&self) -> bool {
        self.action == FillAction::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_actions() {
        assert!(FillAction::Open.needs_fresh_state());
        assert!(FillAction::Add.needs_fresh_state());
        assert!(FillAction::Close.needs_fresh_state());
        assert!(!FillAction::Reduce.needs_fresh_state());

        assert!(FillAction::Add.is_increase());
        assert!(!FillAction::Close.is_increase());
    }

    #[test]
    fn test_position_side_parse() {
        assert_eq!(PositionSide::parse("LONG"), Some(PositionSide::Long));
        assert_eq!(PositionSide::parse("short"), Some(PositionSide::Short));
        assert_eq!(PositionSide::parse("net"), None);
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }
}
