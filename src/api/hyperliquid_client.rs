//! Hyperliquid info API client (polling mode).
//!
//! Hyperliquid nets positions per coin and exposes no position id, so every
//! position is keyed by the composite (symbol, side, margin mode) identity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::models::{
    normalize_symbol, AccountState, Fill, FillAction, MarginMode, Position, PositionSide, TradeSide, Venue,
};

use super::source::{LeaderDataSource, ProviderError};
use super::types::*;

pub(crate) const HL_API_BASE: &str = "https://api.hyperliquid.xyz";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Hyperliquid `/info` endpoint.
#[derive(Clone)]
pub struct HyperliquidClient {
    client: Client,
    base_url: String,
}

impl HyperliquidClient {
    /// Create a new client; `HYPERLIQUID_API_URL` overrides the endpoint.
    pub fn new() -> Result<Self, ProviderError> {
        let base_url = std::env::var("HYPERLIQUID_API_URL").unwrap_or_else(|_| HL_API_BASE.to_string());
        Self::with_base_url(base_url)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    async fn info<T: DeserializeOwned>(&self, request: &HlInfoRequest<'_>) -> Result<T, ProviderError> {
        let url = format!("{}/info", self.base_url);
        debug!(url = %url, request_type = request.request_type, "Hyperliquid request");

        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// Fetch the clearinghouse state and convert it into a snapshot.
    pub async fn fetch_state(&self, user: &str) -> Result<AccountState, ProviderError> {
        let request = HlInfoRequest {
            request_type: "clearinghouseState",
            user,
            start_time: None,
        };
        let raw: HlClearinghouseState = self.info(&request).await?;
        Ok(convert_state(raw))
    }
}

#[async_trait]
impl LeaderDataSource for HyperliquidClient {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
    }

    async fn get_fills(&self, leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError> {
        let request = HlInfoRequest {
            request_type: "userFillsByTime",
            user: leader_id,
            start_time: Some(since.timestamp_millis()),
        };
        let raw: Vec<HlFill> = self.info(&request).await?;

        Ok(raw.into_iter().flat_map(convert_fill).collect())
    }

    async fn get_account_state(&self, leader_id: &str) -> Result<AccountState, ProviderError> {
        self.fetch_state(leader_id).await
    }
}

/// Convert a clearinghouse state into a snapshot keyed by composite identity.
pub(crate) fn convert_state(raw: HlClearinghouseState) -> AccountState {
    let positions = raw
        .asset_positions
        .into_iter()
        .filter_map(|ap| convert_position(ap.position))
        .collect();

    let mut state = AccountState::new(raw.margin_summary.account_value, raw.withdrawable, positions);
    if let Some(captured) = Utc.timestamp_millis_opt(raw.time).single().filter(|_| raw.time > 0) {
        state.captured_at = captured;
    }
    state
}

fn convert_position(raw: HlPosition) -> Option<Position> {
    if raw.szi.is_zero() {
        return None;
    }

    let size = raw.szi.abs();
    let side = if raw.szi > Decimal::ZERO {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    Some(Position {
        symbol: normalize_symbol(&raw.coin),
        side,
        size,
        entry_price: raw.entry_px.unwrap_or(Decimal::ZERO),
        mark_price: raw.position_value / size,
        leverage: raw.leverage.value,
        margin_mode: MarginMode::parse(&raw.leverage.kind).unwrap_or_default(),
        notional: raw.position_value,
        pos_id: None,
    })
}

/// Convert one venue fill into normalized fills.
///
/// A position flip ("Long > Short") becomes two fills: the close of the old
/// side followed by the open of the new one.
pub(crate) fn convert_fill(raw: HlFill) -> Vec<Fill> {
    let side = match raw.side.as_str() {
        "B" => TradeSide::Buy,
        "A" => TradeSide::Sell,
        other => {
            debug!(side = %other, tid = raw.tid, "Skipping fill with unknown side");
            return Vec::new();
        }
    };
    let Some(timestamp) = Utc.timestamp_millis_opt(raw.time).single() else {
        return Vec::new();
    };

    let start = raw.start_position.abs();
    let build = |id: String, position_side: PositionSide, action: FillAction, size: Decimal, pnl: Decimal| Fill {
        id,
        symbol: normalize_symbol(&raw.coin),
        side,
        position_side,
        action,
        price: raw.px,
        size,
        notional: raw.px * size,
        timestamp,
        realized_pnl: pnl,
    };
    let id = raw.tid.to_string();

    match raw.dir.as_str() {
        "Open Long" | "Open Short" => {
            let position_side = if raw.dir == "Open Long" {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            let action = if start.is_zero() { FillAction::Open } else { FillAction::Add };
            vec![build(id, position_side, action, raw.sz, Decimal::ZERO)]
        }
        "Close Long" | "Close Short" => {
            let position_side = if raw.dir == "Close Long" {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            let action = if start - raw.sz <= Decimal::ZERO {
                FillAction::Close
            } else {
                FillAction::Reduce
            };
            vec![build(id, position_side, action, raw.sz, raw.closed_pnl)]
        }
        "Long > Short" | "Short > Long" => {
            let closing = if raw.dir == "Long > Short" {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            let opened = raw.sz - start;
            let mut fills = vec![build(format!("{}-close", id), closing, FillAction::Close, start, raw.closed_pnl)];
            if opened > Decimal::ZERO {
                fills.push(build(format!("{}-open", id), closing.opposite(), FillAction::Open, opened, Decimal::ZERO));
            }
            fills
        }
        other => {
            debug!(dir = %other, tid = raw.tid, "Skipping non-perpetual fill");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionKey;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw_fill(dir: &str, side: &str, sz: Decimal, start: Decimal) -> HlFill {
        HlFill {
            coin: "ETH".to_string(),
            px: dec!(3000),
            sz,
            side: side.to_string(),
            time: 1_700_000_000_000,
            start_position: start,
            dir: dir.to_string(),
            closed_pnl: dec!(12.5),
            tid: 42,
        }
    }

    #[test]
    fn test_open_vs_add() {
        let open = convert_fill(raw_fill("Open Long", "B", dec!(1), Decimal::ZERO));
        assert_eq!(open[0].action, FillAction::Open);
        assert_eq!(open[0].symbol, "ETHUSDT");
        assert_eq!(open[0].notional, dec!(3000));

        let add = convert_fill(raw_fill("Open Short", "A", dec!(1), dec!(-2)));
        assert_eq!(add[0].action, FillAction::Add);
        assert_eq!(add[0].position_side, PositionSide::Short);
    }

    #[test]
    fn test_reduce_vs_close() {
        let reduce = convert_fill(raw_fill("Close Long", "A", dec!(1), dec!(3)));
        assert_eq!(reduce[0].action, FillAction::Reduce);
        assert_eq!(reduce[0].realized_pnl, dec!(12.5));

        let close = convert_fill(raw_fill("Close Short", "B", dec!(2), dec!(-2)));
        assert_eq!(close[0].action, FillAction::Close);
    }

    #[test]
    fn test_flip_splits_into_close_then_open() {
        let fills = convert_fill(raw_fill("Long > Short", "A", dec!(5), dec!(2)));

        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].id, "42-close");
        assert_eq!(fills[0].action, FillAction::Close);
        assert_eq!(fills[0].position_side, PositionSide::Long);
        assert_eq!(fills[0].size, dec!(2));
        assert_eq!(fills[1].id, "42-open");
        assert_eq!(fills[1].action, FillAction::Open);
        assert_eq!(fills[1].position_side, PositionSide::Short);
        assert_eq!(fills[1].size, dec!(3));
    }

    #[test]
    fn test_spot_fills_skipped() {
        assert!(convert_fill(raw_fill("Buy", "B", dec!(1), Decimal::ZERO)).is_empty());
    }

    #[tokio::test]
    async fn test_clearinghouse_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "marginSummary": { "accountValue": "100000.0", "totalNtlPos": "30000.0" },
                "withdrawable": "70000.0",
                "assetPositions": [
                    {
                        "type": "oneWay",
                        "position": {
                            "coin": "BTC",
                            "szi": "-0.5",
                            "entryPx": "60000.0",
                            "positionValue": "30000.0",
                            "leverage": { "type": "isolated", "value": 20 }
                        }
                    }
                ],
                "time": 1700000000000i64
            })))
            .mount(&server)
            .await;

        let client = HyperliquidClient::with_base_url(server.uri()).unwrap();
        let state = client.get_account_state("0xleader").await.unwrap();

        assert_eq!(state.total_equity, dec!(100000));
        assert_eq!(state.available_balance, dec!(70000));
        let key = PositionKey::composite("BTCUSDT", PositionSide::Short, MarginMode::Isolated);
        let pos = state.position(&key).unwrap();
        assert_eq!(pos.size, dec!(0.5));
        assert_eq!(pos.mark_price, dec!(60000));
        assert_eq!(pos.leverage, 20);
    }
}
