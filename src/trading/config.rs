//! Engine and follower configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{MarginMode, Venue};

/// How leader activity is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    #[default]
    Polling,
    Streaming,
}

/// Tunables shared by every engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between fill polls, in seconds
    pub fill_poll_secs: u64,

    /// Interval between full leader state refreshes, in seconds
    pub state_refresh_secs: u64,

    /// How long a processed fill id is remembered, in seconds
    pub dedup_ttl_secs: u64,

    /// Seen-set size above which expired entries are pruned
    pub dedup_prune_threshold: usize,

    /// Remaining size fraction below which a reduce counts as a close
    pub near_zero_close_ratio: Decimal,

    /// Reduce ratio at or above which a reduce is promoted to a close
    pub promote_close_ratio: Decimal,

    /// Leverage used when neither the leader nor config provides one
    pub default_leverage: u32,

    pub default_margin_mode: MarginMode,

    /// Capacity of each follower's decision queue
    pub decision_queue_capacity: usize,

    /// Number of warnings kept per engine
    pub warning_log_capacity: usize,

    /// Delay before reconnecting a dropped stream, in seconds
    pub reconnect_delay_secs: u64,

    /// Interval between stream keepalive pings, in seconds
    pub keepalive_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fill_poll_secs: 3,
            state_refresh_secs: 30,
            dedup_ttl_secs: 3600,
            dedup_prune_threshold: 1000,
            near_zero_close_ratio: dec!(0.05),
            promote_close_ratio: dec!(0.95),
            default_leverage: 10,
            default_margin_mode: MarginMode::Cross,
            decision_queue_capacity: 100,
            warning_log_capacity: 100,
            reconnect_delay_secs: 5,
            keepalive_secs: 50,
        }
    }
}

impl EngineConfig {
    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_secs(self.fill_poll_secs.max(1))
    }

    pub fn state_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.state_refresh_secs.max(1))
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

fn default_copy_ratio() -> Decimal {
    Decimal::ONE
}

fn default_min_copy_size() -> Decimal {
    dec!(12)
}

fn default_true() -> bool {
    true
}

/// Per-follower copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Follower account id
    pub follower_id: String,

    /// Venue the leader trades on
    pub venue: Venue,

    /// Leader identifier on that venue (wallet address or account label)
    pub leader_id: String,

    #[serde(default)]
    pub feed: FeedKind,

    /// Multiplier applied on top of the equity ratio
    #[serde(default = "default_copy_ratio")]
    pub copy_ratio: Decimal,

    /// Copy the leader's leverage instead of the default
    #[serde(default = "default_true")]
    pub sync_leverage: bool,

    /// Copy the leader's margin mode instead of the default
    #[serde(default = "default_true")]
    pub sync_margin_mode: bool,

    /// Advisory minimum order value; smaller orders are raised to it
    #[serde(default = "default_min_copy_size")]
    pub min_copy_size: Decimal,

    /// Advisory maximum order value; larger orders only warn
    #[serde(default)]
    pub max_copy_size: Option<Decimal>,

    /// Leverage used when `sync_leverage` is off
    #[serde(default)]
    pub leverage: Option<u32>,

    /// Margin mode used when `sync_margin_mode` is off
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
}

impl CopyConfig {
    pub fn new(follower_id: impl Into<String>, venue: Venue, leader_id: impl Into<String>) -> Self {
        Self {
            follower_id: follower_id.into(),
            venue,
            leader_id: leader_id.into(),
            feed: FeedKind::default(),
            copy_ratio: default_copy_ratio(),
            sync_leverage: true,
            sync_margin_mode: true,
            min_copy_size: default_min_copy_size(),
            max_copy_size: None,
            leverage: None,
            margin_mode: None,
        }
    }

    /// Check for settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.follower_id.is_empty(), "follower_id must not be empty");
        anyhow::ensure!(!self.leader_id.is_empty(), "leader_id must not be empty for {}", self.follower_id);
        anyhow::ensure!(
            self.copy_ratio > Decimal::ZERO,
            "copy_ratio must be positive for {}",
            self.follower_id
        );
        if let Some(max) = self.max_copy_size {
            anyhow::ensure!(
                max >= self.min_copy_size,
                "max_copy_size below min_copy_size for {}",
                self.follower_id
            );
        }
        if self.feed == FeedKind::Streaming {
            anyhow::ensure!(
                self.venue == Venue::Hyperliquid,
                "streaming feed is only available for hyperliquid ({})",
                self.follower_id
            );
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub followers: Vec<CopyConfig>,
}

impl AppConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(raw).context("Failed to parse config")?;

        let mut seen = std::collections::HashSet::new();
        for follower in &config.followers {
            follower.validate()?;
            anyhow::ensure!(
                seen.insert(follower.follower_id.as_str()),
                "duplicate follower_id {}",
                follower.follower_id
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_json(
            r#"{ "followers": [ { "follower_id": "f1", "venue": "okx", "leader_id": "lead" } ] }"#,
        )
        .unwrap();

        assert_eq!(config.engine.fill_poll_secs, 3);
        assert_eq!(config.engine.decision_queue_capacity, 100);
        assert_eq!(config.engine.promote_close_ratio, dec!(0.95));

        let follower = &config.followers[0];
        assert_eq!(follower.feed, FeedKind::Polling);
        assert_eq!(follower.copy_ratio, Decimal::ONE);
        assert_eq!(follower.min_copy_size, dec!(12));
        assert!(follower.sync_leverage);
        assert!(follower.max_copy_size.is_none());
    }

    #[test]
    fn test_partial_engine_section() {
        let config = AppConfig::from_json(r#"{ "engine": { "fill_poll_secs": 1 } }"#).unwrap();
        assert_eq!(config.engine.fill_poll_secs, 1);
        assert_eq!(config.engine.state_refresh_secs, 30);
        assert!(config.followers.is_empty());
    }

    #[test]
    fn test_rejects_invalid_followers() {
        let streaming_okx = r#"{ "followers": [
            { "follower_id": "f1", "venue": "okx", "leader_id": "lead", "feed": "streaming" }
        ] }"#;
        assert!(AppConfig::from_json(streaming_okx).is_err());

        let duplicate = r#"{ "followers": [
            { "follower_id": "f1", "venue": "okx", "leader_id": "a" },
            { "follower_id": "f1", "venue": "hyperliquid", "leader_id": "b" }
        ] }"#;
        assert!(AppConfig::from_json(duplicate).is_err());
    }
}
