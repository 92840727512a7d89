//! Leader data source contract shared by the polling and streaming adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{AccountState, Fill, Venue};

/// Failure fetching or decoding leader data.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("venue error {code}: {msg}")]
    Venue { code: String, msg: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("missing credentials: {0}")]
    Credentials(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Parse(e.to_string())
    }
}

/// Fetches a leader's fills and account snapshots.
#[async_trait]
pub trait LeaderDataSource: Send + Sync {
    /// Venue the leader trades on.
    fn venue(&self) -> Venue;

    /// Fills executed at or after `since`, in any order.
    async fn get_fills(&self, leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError>;

    /// Current account snapshot.
    async fn get_account_state(&self, leader_id: &str) -> Result<AccountState, ProviderError>;
}

/// Event pushed from a streaming subscription into an engine's input queue.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A live fill; the source refreshed its snapshot before sending it
    Fill(Fill),
    Connected,
    Disconnected(String),
}

/// A data source able to push fills over a persistent subscription.
pub trait StreamingSource: LeaderDataSource {
    /// Start the subscription workers for one leader.
    ///
    /// Events are delivered in venue order on `events`. Workers run until
    /// `cancel` fires, reconnecting after transport failures.
    fn subscribe(
        &self,
        leader_id: &str,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}
