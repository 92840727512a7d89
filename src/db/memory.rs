//! In-process mapping store, used for dry runs and tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::models::{
    ExecutionRecord, MappingStatus, Position, PositionKey, PositionMapping, PositionSide,
};

use super::store::PositionMappingStore;

#[derive(Default)]
struct Tables {
    mappings: Vec<PositionMapping>,
    executions: Vec<ExecutionRecord>,
    next_id: i64,
}

/// Mapping store held in memory; contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded execution outcomes, oldest first.
    #[cfg(test)]
    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.tables.read().await.executions.clone()
    }

    async fn update(&self, mapping_id: i64, apply: impl FnOnce(&mut PositionMapping)) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Some(mapping) = tables.mappings.iter_mut().find(|m| m.id == mapping_id) else {
            bail!("mapping {} not found", mapping_id);
        };
        apply(mapping);
        mapping.updated_at = Utc::now();
        Ok(())
    }
}

fn latest<'a>(
    mappings: &'a mut [PositionMapping],
    follower_id: &str,
    key: &PositionKey,
) -> Option<&'a mut PositionMapping> {
    mappings
        .iter_mut()
        .filter(|m| m.follower_id == follower_id && &m.leader_position == key)
        .max_by_key(|m| m.id)
}

#[async_trait]
impl PositionMappingStore for MemoryStore {
    async fn save_mapping(&self, mapping: &PositionMapping) -> Result<i64> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = latest(&mut tables.mappings, &mapping.follower_id, &mapping.leader_position) {
            if existing.status == MappingStatus::Ignored {
                let id = existing.id;
                *existing = PositionMapping {
                    id,
                    created_at: existing.created_at,
                    updated_at: Utc::now(),
                    ..mapping.clone()
                };
                return Ok(id);
            }
        }

        tables.next_id += 1;
        let id = tables.next_id;
        tables.mappings.push(PositionMapping { id, ..mapping.clone() });
        Ok(id)
    }

    async fn get_mapping(&self, follower_id: &str, leader_position: &PositionKey) -> Result<Option<PositionMapping>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .iter()
            .filter(|m| m.follower_id == follower_id && &m.leader_position == leader_position)
            .max_by_key(|m| m.id)
            .cloned())
    }

    async fn find_active_by_symbol_side(
        &self,
        follower_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Vec<PositionMapping>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .iter()
            .filter(|m| m.follower_id == follower_id && m.symbol == symbol && m.side == side && m.is_active())
            .cloned()
            .collect())
    }

    async fn increment_add_count(&self, mapping_id: i64) -> Result<()> {
        self.update(mapping_id, |m| m.add_count += 1).await
    }

    async fn increment_reduce_count(&self, mapping_id: i64) -> Result<()> {
        self.update(mapping_id, |m| m.reduce_count += 1).await
    }

    async fn close_mapping(&self, mapping_id: i64) -> Result<()> {
        self.update(mapping_id, |m| {
            m.status = MappingStatus::Closed;
            m.closed_at = Some(Utc::now());
        })
        .await
    }

    async fn save_ignored_position(&self, follower_id: &str, leader_id: &str, position: &Position) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = position.key();
        let has_open = tables.mappings.iter().any(|m| {
            m.follower_id == follower_id && m.leader_position == key && m.status != MappingStatus::Closed
        });
        if has_open {
            return Ok(());
        }

        tables.next_id += 1;
        let id = tables.next_id;
        tables.mappings.push(PositionMapping {
            id,
            ..PositionMapping::ignored(follower_id, leader_id, position)
        });
        Ok(())
    }

    async fn update_last_known_size(&self, mapping_id: i64, size: Decimal) -> Result<()> {
        self.update(mapping_id, |m| m.last_known_size = size).await
    }

    async fn list_mappings(&self, follower_id: &str) -> Result<Vec<PositionMapping>> {
        let tables = self.tables.read().await;
        let mut mappings: Vec<PositionMapping> = tables
            .mappings
            .iter()
            .filter(|m| m.follower_id == follower_id)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(mappings)
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.tables.write().await.executions.push(record.clone());
        Ok(())
    }
}
