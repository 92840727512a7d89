//! Leader account snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fill::PositionSide;
use super::position::{Position, PositionKey};

/// Point-in-time view of a leader account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    /// Total account equity in quote currency
    pub total_equity: Decimal,

    /// Balance free for new margin
    pub available_balance: Decimal,

    /// Open positions keyed by identity
    pub positions: HashMap<PositionKey, Position>,

    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl AccountState {
    /// Build a snapshot from a list of positions, dropping empty ones.
    pub fn new(total_equity: Decimal, available_balance: Decimal, positions: Vec<Position>) -> Self {
        let positions = positions
            .into_iter()
            .filter(|p| p.size > Decimal::ZERO)
            .map(|p| (p.key(), p))
            .collect();

        Self {
            total_equity,
            available_balance,
            positions,
            captured_at: Utc::now(),
        }
    }

    pub fn position(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    /// Current leader size for a position, zero when it is gone.
    pub fn size_of(&self, key: &PositionKey) -> Decimal {
        self.positions
            .get(key)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    /// Positions of one symbol and side, largest first.
    pub fn positions_for(&self, symbol: &str, side: PositionSide) -> Vec<&Position> {
        let mut matching: Vec<&Position> = self
            .positions
            .values()
            .filter(|p| p.matches(symbol, side))
            .collect();
        matching.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.key().to_string().cmp(&b.key().to_string())));
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarginMode;
    use rust_decimal_macros::dec;

    fn pos(symbol: &str, side: PositionSide, size: Decimal, mode: MarginMode) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: dec!(100),
            mark_price: dec!(100),
            leverage: 5,
            margin_mode: mode,
            notional: size * dec!(100),
            pos_id: None,
        }
    }

    #[test]
    fn test_empty_positions_dropped() {
        let state = AccountState::new(
            dec!(1000),
            dec!(800),
            vec![
                pos("SOLUSDT", PositionSide::Long, dec!(2), MarginMode::Cross),
                pos("ETHUSDT", PositionSide::Long, Decimal::ZERO, MarginMode::Cross),
            ],
        );

        assert_eq!(state.positions.len(), 1);
        let key = PositionKey::composite("ETHUSDT", PositionSide::Long, MarginMode::Cross);
        assert_eq!(state.size_of(&key), Decimal::ZERO);
    }

    #[test]
    fn test_positions_for_symbol_side() {
        let state = AccountState::new(
            dec!(1000),
            dec!(800),
            vec![
                pos("SOLUSDT", PositionSide::Long, dec!(2), MarginMode::Cross),
                pos("SOLUSDT", PositionSide::Long, dec!(5), MarginMode::Isolated),
                pos("SOLUSDT", PositionSide::Short, dec!(1), MarginMode::Cross),
            ],
        );

        let longs = state.positions_for("SOLUSDT", PositionSide::Long);
        assert_eq!(longs.len(), 2);
        assert_eq!(longs[0].size, dec!(5));
    }
}
