//! Persistent link between a leader position and the follower's copy.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fill::PositionSide;
use super::position::{MarginMode, Position, PositionKey};

/// Lifecycle state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    /// Leader position existed before tracking began; never followed
    Ignored,
    /// Opened after tracking began and copied
    Active,
    /// Fully exited; terminal
    Closed,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Ignored => "ignored",
            MappingStatus::Active => "active",
            MappingStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignored" => Some(Self::Ignored),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one leader position as seen by one follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMapping {
    /// Store-assigned id (0 until saved)
    pub id: i64,
    pub follower_id: String,
    pub leader_id: String,
    pub leader_position: PositionKey,
    pub symbol: String,
    pub side: PositionSide,
    pub margin_mode: MarginMode,
    pub status: MappingStatus,
    pub open_price: Decimal,
    pub open_size: Decimal,
    /// Most recently recorded leader size, used to detect deltas
    pub last_known_size: Decimal,
    pub add_count: u32,
    pub reduce_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionMapping {
    fn from_position(
        follower_id: &str,
        leader_id: &str,
        position: &Position,
        status: MappingStatus,
        open_price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            follower_id: follower_id.to_string(),
            leader_id: leader_id.to_string(),
            leader_position: position.key(),
            symbol: position.symbol.clone(),
            side: position.side,
            margin_mode: position.margin_mode,
            status,
            open_price,
            open_size: position.size,
            last_known_size: position.size,
            add_count: 0,
            reduce_count: 0,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Mapping for a leader position found open when tracking started.
    pub fn ignored(follower_id: &str, leader_id: &str, position: &Position) -> Self {
        Self::from_position(follower_id, leader_id, position, MappingStatus::Ignored, position.entry_price)
    }

    /// Mapping for a leader position opened after tracking started.
    pub fn active(follower_id: &str, leader_id: &str, position: &Position, open_price: Decimal) -> Self {
        Self::from_position(follower_id, leader_id, position, MappingStatus::Active, open_price)
    }

    pub fn is_active(&self) -> bool {
        self.status == MappingStatus::Active
    }
}
