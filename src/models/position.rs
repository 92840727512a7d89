//! Position model and the typed identity used to key leader positions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fill::PositionSide;

/// Collateral mode of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cross" => Some(Self::Cross),
            "isolated" => Some(Self::Isolated),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a leader position.
///
/// Venues that expose a position id use it directly. Venues without one get a
/// deterministic composite of symbol, side and margin mode; such ids are
/// virtual and come back when the leader reopens the same position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PositionKey {
    Native(String),
    Composite {
        symbol: String,
        side: PositionSide,
        margin_mode: MarginMode,
    },
}

impl PositionKey {
    pub fn composite(symbol: impl Into<String>, side: PositionSide, margin_mode: MarginMode) -> Self {
        Self::Composite {
            symbol: symbol.into(),
            side,
            margin_mode,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, PositionKey::Composite { .. })
    }

    /// Parse the stored string form back into a key.
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.split('_').collect();
        if let [symbol, side, mode] = parts.as_slice() {
            if let (Some(side), Some(margin_mode)) = (PositionSide::parse(side), MarginMode::parse(mode)) {
                if !symbol.is_empty() {
                    return Self::composite(*symbol, side, margin_mode);
                }
            }
        }
        Self::Native(s.to_string())
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionKey::Native(id) => f.write_str(id),
            PositionKey::Composite {
                symbol,
                side,
                margin_mode,
            } => write!(f, "{}_{}_{}", symbol, side, margin_mode),
        }
    }
}

impl From<PositionKey> for String {
    fn from(key: PositionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PositionKey {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(PositionKey::parse(&s))
    }
}

/// An open leader exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Normalized symbol (e.g. "BTCUSDT")
    pub symbol: String,

    /// Long or short
    pub side: PositionSide,

    /// Absolute size in venue units
    pub size: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    /// Current mark price
    #[serde(default)]
    pub mark_price: Decimal,

    /// Leverage multiplier
    pub leverage: u32,

    /// Cross or isolated collateral
    pub margin_mode: MarginMode,

    /// Quote-currency value at mark
    #[serde(default)]
    pub notional: Decimal,

    /// Venue-native identifier, when the venue has one
    #[serde(default)]
    pub pos_id: Option<String>,
}

impl Position {
    /// Identity of this position: native id if present, composite otherwise.
    pub fn key(&self) -> PositionKey {
        match &self.pos_id {
            Some(id) if !id.is_empty() => PositionKey::Native(id.clone()),
            _ => PositionKey::composite(self.symbol.clone(), self.side, self.margin_mode),
        }
    }

    pub fn matches(&self, symbol: &str, side: PositionSide) -> bool {
        self.symbol == symbol && self.side == side
    }
}
