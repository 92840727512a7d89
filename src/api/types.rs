//! Wire types for the OKX v5 REST API and the Hyperliquid info/WebSocket API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ==================== OKX ====================

/// Standard OKX response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct OkxEnvelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Fill from /api/v5/trade/fills. OKX encodes numbers as strings, often empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxFill {
    pub inst_id: String,
    pub trade_id: String,
    /// Pagination cursor; fills come back newest first
    #[serde(default)]
    pub bill_id: String,
    pub side: String,
    #[serde(default)]
    pub pos_side: String,
    pub fill_px: String,
    pub fill_sz: String,
    pub ts: String,
    #[serde(default)]
    pub fill_pnl: String,
}

/// Position from /api/v5/account/positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxPosition {
    pub pos_id: String,
    pub inst_id: String,
    #[serde(default)]
    pub pos_side: String,
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub mark_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(default)]
    pub mgn_mode: String,
    #[serde(default)]
    pub notional_usd: String,
}

/// Account summary from /api/v5/account/balance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxBalance {
    #[serde(default)]
    pub total_eq: String,
    #[serde(default)]
    pub details: Vec<OkxBalanceDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxBalanceDetail {
    pub ccy: String,
    #[serde(default)]
    pub avail_bal: String,
    #[serde(default)]
    pub avail_eq: String,
}

/// Instrument from /api/v5/public/instruments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxInstrument {
    pub inst_id: String,
    pub ct_val: String,
    #[serde(default)]
    pub ct_type: String,
}

// ==================== Hyperliquid ====================

/// Request body for POST /info.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlInfoRequest<'a> {
    #[serde(rename = "type")]
    pub request_type: &'a str,
    pub user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

/// Fill from `userFillsByTime` and the `userFills` stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlFill {
    pub coin: String,
    pub px: Decimal,
    pub sz: Decimal,
    /// "B" for buy, "A" for sell
    pub side: String,
    pub time: i64,
    #[serde(default)]
    pub start_position: Decimal,
    /// "Open Long", "Close Short", "Long > Short", ...
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub closed_pnl: Decimal,
    pub tid: u64,
}

/// Response of `clearinghouseState`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlClearinghouseState {
    pub margin_summary: HlMarginSummary,
    #[serde(default)]
    pub withdrawable: Decimal,
    #[serde(default)]
    pub asset_positions: Vec<HlAssetPosition>,
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlMarginSummary {
    pub account_value: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlAssetPosition {
    pub position: HlPosition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlPosition {
    pub coin: String,
    /// Signed size: positive long, negative short
    pub szi: Decimal,
    #[serde(default)]
    pub entry_px: Option<Decimal>,
    #[serde(default)]
    pub position_value: Decimal,
    pub leverage: HlLeverage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlLeverage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u32,
}

/// Envelope of every WebSocket message.
#[derive(Debug, Clone, Deserialize)]
pub struct HlWsMessage {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of the `userFills` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlUserFills {
    #[serde(default)]
    pub is_snapshot: bool,
    #[serde(default)]
    pub fills: Vec<HlFill>,
}
