//! Data models for fills, positions, snapshots, mappings and decisions.

mod account;
mod fill;
mod mapping;
mod position;
mod signal;
mod venue;

pub use account::AccountState;
pub use fill::{Fill, FillAction, PositionSide, TradeSide};
pub use mapping::{MappingStatus, PositionMapping};
pub use position::{MarginMode, Position, PositionKey};
pub use signal::{
    Decision, DecisionAction, ExecutionRecord, ExecutionStatus, TradeSignal, Warning, WarningKind,
};
pub use venue::{normalize_symbol, Venue};
