//! Contract of the durable leader-position mapping store.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{ExecutionRecord, Position, PositionKey, PositionMapping, PositionSide};

/// Durable "leader position → follower copy" records.
///
/// Mappings are never deleted. A closed row is kept when the same virtual id
/// is opened again; the new open gets a fresh row. `get_mapping` always
/// returns the most recent row for an id.
#[async_trait]
pub trait PositionMappingStore: Send + Sync {
    /// Persist an active mapping and return its id. An `ignored` row for the
    /// same leader position is promoted in place; otherwise a new row is added.
    async fn save_mapping(&self, mapping: &PositionMapping) -> Result<i64>;

    /// Latest mapping for a leader position.
    async fn get_mapping(&self, follower_id: &str, leader_position: &PositionKey) -> Result<Option<PositionMapping>>;

    /// Active mappings of one symbol and side.
    async fn find_active_by_symbol_side(
        &self,
        follower_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Vec<PositionMapping>>;

    async fn increment_add_count(&self, mapping_id: i64) -> Result<()>;

    async fn increment_reduce_count(&self, mapping_id: i64) -> Result<()>;

    /// Mark a mapping closed. Terminal.
    async fn close_mapping(&self, mapping_id: i64) -> Result<()>;

    /// Record a leader position that must never be followed. No-op when the
    /// position already has an ignored or active mapping.
    async fn save_ignored_position(&self, follower_id: &str, leader_id: &str, position: &Position) -> Result<()>;

    async fn update_last_known_size(&self, mapping_id: i64, size: Decimal) -> Result<()>;

    /// Every mapping of a follower, newest first.
    async fn list_mappings(&self, follower_id: &str) -> Result<Vec<PositionMapping>>;

    /// Store the executor's outcome for a decision.
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;
}
