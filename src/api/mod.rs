//! Leader venue adapters for OKX and Hyperliquid, polling and streaming.

mod hyperliquid_client;
mod hyperliquid_stream;
mod okx_client;
mod source;
mod types;

pub use hyperliquid_client::HyperliquidClient;
pub use hyperliquid_stream::HyperliquidStream;
pub use okx_client::{OkxClient, OkxCredentials};
pub use source::{FeedEvent, LeaderDataSource, ProviderError, StreamingSource};
