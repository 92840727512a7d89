//! Mapping persistence.
//!
//! Stores everything needed to resume after restart:
//! - Leader position mappings and their lifecycle state
//! - Execution outcomes reported for each decision
//!
//! Sizes and prices are stored as decimal strings so that `last_known_size`
//! comparisons stay exact across restarts.

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::PositionMappingStore;

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    ExecutionRecord, MappingStatus, MarginMode, Position, PositionKey, PositionMapping, PositionSide,
};

/// SQLite-backed mapping store.
pub struct Database {
    pool: SqlitePool,
}

/// Stored mapping row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMapping {
    pub id: i64,
    pub follower_id: String,
    pub leader_id: String,
    pub leader_position_id: String,
    pub symbol: String,
    pub side: String,
    pub margin_mode: String,
    pub status: String,
    pub open_price: String,
    pub open_size: String,
    pub last_known_size: String,
    pub add_count: i64,
    pub reduce_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StoredMapping> for PositionMapping {
    type Error = anyhow::Error;

    fn try_from(row: StoredMapping) -> Result<Self> {
        let decimal = |field: &str, value: &str| {
            Decimal::from_str(value).with_context(|| format!("Invalid {} {:?} in mapping {}", field, value, row.id))
        };

        Ok(PositionMapping {
            id: row.id,
            follower_id: row.follower_id.clone(),
            leader_id: row.leader_id.clone(),
            leader_position: PositionKey::parse(&row.leader_position_id),
            symbol: row.symbol.clone(),
            side: PositionSide::parse(&row.side).ok_or_else(|| anyhow!("Invalid side {:?}", row.side))?,
            margin_mode: MarginMode::parse(&row.margin_mode)
                .ok_or_else(|| anyhow!("Invalid margin mode {:?}", row.margin_mode))?,
            status: MappingStatus::parse(&row.status).ok_or_else(|| anyhow!("Invalid status {:?}", row.status))?,
            open_price: decimal("open_price", &row.open_price)?,
            open_size: decimal("open_size", &row.open_size)?,
            last_known_size: decimal("last_known_size", &row.last_known_size)?,
            add_count: row.add_count.try_into().unwrap_or(0),
            reduce_count: row.reduce_count.try_into().unwrap_or(0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            closed_at: row.closed_at,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database on a single connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                follower_id TEXT NOT NULL,
                leader_id TEXT NOT NULL,
                leader_position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                margin_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                open_price TEXT NOT NULL DEFAULT '0',
                open_size TEXT NOT NULL DEFAULT '0',
                last_known_size TEXT NOT NULL DEFAULT '0',
                add_count INTEGER NOT NULL DEFAULT 0,
                reduce_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decision_executions (
                decision_id TEXT PRIMARY KEY,
                follower_id TEXT NOT NULL,
                mapping_id INTEGER,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                executed_at TEXT NOT NULL,
                FOREIGN KEY (mapping_id) REFERENCES position_mappings(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mappings_position ON position_mappings(follower_id, leader_position_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mappings_symbol_side ON position_mappings(follower_id, symbol, side, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_follower ON decision_executions(follower_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn latest_row(&self, follower_id: &str, leader_position_id: &str) -> Result<Option<StoredMapping>> {
        sqlx::query_as::<_, StoredMapping>(
            r#"
            SELECT * FROM position_mappings
            WHERE follower_id = ? AND leader_position_id = ?
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(follower_id)
        .bind(leader_position_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch mapping")
    }

    async fn insert_mapping(&self, mapping: &PositionMapping) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO position_mappings (
                follower_id, leader_id, leader_position_id, symbol, side, margin_mode, status,
                open_price, open_size, last_known_size, add_count, reduce_count, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&mapping.follower_id)
        .bind(&mapping.leader_id)
        .bind(mapping.leader_position.to_string())
        .bind(&mapping.symbol)
        .bind(mapping.side.as_str())
        .bind(mapping.margin_mode.as_str())
        .bind(mapping.status.as_str())
        .bind(mapping.open_price.to_string())
        .bind(mapping.open_size.to_string())
        .bind(mapping.last_known_size.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert mapping")?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Number of recorded executions with the given status for a follower.
    pub async fn count_executions(&self, follower_id: &str, status: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM decision_executions WHERE follower_id = ? AND status = ?")
                .bind(follower_id)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[async_trait]
impl PositionMappingStore for Database {
    async fn save_mapping(&self, mapping: &PositionMapping) -> Result<i64> {
        let existing = self
            .latest_row(&mapping.follower_id, &mapping.leader_position.to_string())
            .await?;

        match existing {
            Some(row) if row.status == MappingStatus::Ignored.as_str() => {
                sqlx::query(
                    r#"
                    UPDATE position_mappings SET
                        leader_id = ?,
                        symbol = ?,
                        side = ?,
                        margin_mode = ?,
                        status = ?,
                        open_price = ?,
                        open_size = ?,
                        last_known_size = ?,
                        add_count = 0,
                        reduce_count = 0,
                        updated_at = ?,
                        closed_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(&mapping.leader_id)
                .bind(&mapping.symbol)
                .bind(mapping.side.as_str())
                .bind(mapping.margin_mode.as_str())
                .bind(mapping.status.as_str())
                .bind(mapping.open_price.to_string())
                .bind(mapping.open_size.to_string())
                .bind(mapping.last_known_size.to_string())
                .bind(Utc::now())
                .bind(row.id)
                .execute(&self.pool)
                .await
                .context("Failed to promote ignored mapping")?;

                Ok(row.id)
            }
            _ => self.insert_mapping(mapping).await,
        }
    }

    async fn get_mapping(&self, follower_id: &str, leader_position: &PositionKey) -> Result<Option<PositionMapping>> {
        self.latest_row(follower_id, &leader_position.to_string())
            .await?
            .map(PositionMapping::try_from)
            .transpose()
    }

    async fn find_active_by_symbol_side(
        &self,
        follower_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Vec<PositionMapping>> {
        let rows = sqlx::query_as::<_, StoredMapping>(
            r#"
            SELECT * FROM position_mappings
            WHERE follower_id = ? AND symbol = ? AND side = ? AND status = 'active'
            ORDER BY id
            "#,
        )
        .bind(follower_id)
        .bind(symbol)
        .bind(side.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active mappings")?;

        rows.into_iter().map(PositionMapping::try_from).collect()
    }

    async fn increment_add_count(&self, mapping_id: i64) -> Result<()> {
        sqlx::query("UPDATE position_mappings SET add_count = add_count + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_reduce_count(&self, mapping_id: i64) -> Result<()> {
        sqlx::query("UPDATE position_mappings SET reduce_count = reduce_count + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_mapping(&self, mapping_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE position_mappings SET status = 'closed', closed_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_ignored_position(&self, follower_id: &str, leader_id: &str, position: &Position) -> Result<()> {
        let key = position.key().to_string();
        if let Some(row) = self.latest_row(follower_id, &key).await? {
            if row.status != MappingStatus::Closed.as_str() {
                return Ok(());
            }
        }

        self.insert_mapping(&PositionMapping::ignored(follower_id, leader_id, position))
            .await?;
        Ok(())
    }

    async fn update_last_known_size(&self, mapping_id: i64, size: Decimal) -> Result<()> {
        sqlx::query("UPDATE position_mappings SET last_known_size = ?, updated_at = ? WHERE id = ?")
            .bind(size.to_string())
            .bind(Utc::now())
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_mappings(&self, follower_id: &str) -> Result<Vec<PositionMapping>> {
        let rows = sqlx::query_as::<_, StoredMapping>(
            "SELECT * FROM position_mappings WHERE follower_id = ? ORDER BY id DESC",
        )
        .bind(follower_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list mappings")?;

        rows.into_iter().map(PositionMapping::try_from).collect()
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO decision_executions
                (decision_id, follower_id, mapping_id, symbol, action, status, error_message, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.decision_id.to_string())
        .bind(&record.follower_id)
        .bind(record.mapping_id)
        .bind(&record.symbol)
        .bind(record.action.as_str())
        .bind(record.status.as_str())
        .bind(record.error.as_deref())
        .bind(record.executed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record execution")?;

        Ok(())
    }
}
