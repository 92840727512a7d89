//! Trading logic: fill matching, copy sizing, signal engines and dispatch.

mod config;
mod dedup;
mod dispatcher;
mod error;
mod executor;
mod manager;
mod matcher;
mod position_sizer;
mod signal_engine;

pub use config::{AppConfig, CopyConfig, EngineConfig, FeedKind};
pub use dispatcher::DecisionDispatcher;
pub use error::EngineError;
pub use executor::{DecisionExecutor, DryRunExecutor};
pub use manager::EngineManager;
pub use signal_engine::{LeaderFeed, SignalEngine};
