//! OKX v5 REST client for a leader's fills, positions and balance.
//!
//! Uses the leader's read-only API key. OKX positions carry a native `posId`,
//! so identities on this venue are never virtual.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{
    normalize_symbol, AccountState, Fill, FillAction, MarginMode, Position, PositionSide, TradeSide, Venue,
};

use super::source::{LeaderDataSource, ProviderError};
use super::types::*;

const OKX_API_BASE: &str = "https://www.okx.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const FILL_PAGE_SIZE: usize = 100;
const MAX_FILL_PAGES: usize = 20;

type HmacSha256 = Hmac<Sha256>;

/// Read-only API credentials for a leader account.
#[derive(Clone)]
pub struct OkxCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl OkxCredentials {
    /// Load from `OKX_API_KEY`, `OKX_API_SECRET` and `OKX_PASSPHRASE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| ProviderError::Credentials(format!("{} not set", name)))
        };
        Ok(Self {
            api_key: var("OKX_API_KEY")?,
            secret: var("OKX_API_SECRET")?,
            passphrase: var("OKX_PASSPHRASE")?,
        })
    }
}

impl std::fmt::Debug for OkxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxCredentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

/// Contract spec needed to turn a fill size into notional.
#[derive(Debug, Clone, Copy)]
struct ContractSpec {
    ct_val: Decimal,
    inverse: bool,
}

/// Client for OKX private read endpoints.
pub struct OkxClient {
    client: Client,
    base_url: String,
    credentials: OkxCredentials,
    contracts: RwLock<HashMap<String, ContractSpec>>,
}

impl OkxClient {
    /// Create a new client against the production API.
    pub fn new(credentials: OkxCredentials) -> Result<Self, ProviderError> {
        let base_url = std::env::var("OKX_API_URL").unwrap_or_else(|_| OKX_API_BASE.to_string());
        Self::with_base_url(base_url, credentials)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, credentials: OkxCredentials) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url,
            credentials,
            contracts: RwLock::new(HashMap::new()),
        })
    }

    fn sign(&self, timestamp: &str, method: &str, request_path: &str) -> Result<String, ProviderError> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.as_bytes())
            .map_err(|e| ProviderError::Credentials(e.to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(request_path.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Signed GET returning the envelope's data array.
    async fn get<T: DeserializeOwned>(&self, request_path: &str, signed: bool) -> Result<Vec<T>, ProviderError> {
        let url = format!("{}{}", self.base_url, request_path);
        debug!(url = %url, "OKX request");

        let mut request = self.client.get(&url);
        if signed {
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            let signature = self.sign(&timestamp, "GET", request_path)?;
            request = request
                .header("OK-ACCESS-KEY", &self.credentials.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let envelope: OkxEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        if envelope.code != "0" {
            return Err(ProviderError::Venue {
                code: envelope.code,
                msg: envelope.msg,
            });
        }

        Ok(envelope.data)
    }

    async fn contract_spec(&self, inst_id: &str) -> Result<ContractSpec, ProviderError> {
        if let Some(spec) = self.contracts.read().await.get(inst_id) {
            return Ok(*spec);
        }

        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={}", inst_id);
        let instruments: Vec<OkxInstrument> = self.get(&path, false).await?;
        let instrument = instruments
            .into_iter()
            .find(|i| i.inst_id == inst_id)
            .ok_or_else(|| ProviderError::Parse(format!("unknown instrument {}", inst_id)))?;

        let spec = ContractSpec {
            ct_val: parse_required("ctVal", &instrument.ct_val)?,
            inverse: instrument.ct_type == "inverse",
        };
        self.contracts.write().await.insert(inst_id.to_string(), spec);
        Ok(spec)
    }

    async fn convert_fill(&self, raw: OkxFill) -> Result<Option<Fill>, ProviderError> {
        let side = match raw.side.as_str() {
            "buy" => TradeSide::Buy,
            "sell" => TradeSide::Sell,
            other => {
                warn!(side = %other, "Unknown OKX fill side");
                return Ok(None);
            }
        };

        // Net mode fills do not say which side they touch.
        let Some(position_side) = PositionSide::parse(&raw.pos_side) else {
            debug!(inst = %raw.inst_id, pos_side = %raw.pos_side, "Skipping fill without long/short position side");
            return Ok(None);
        };

        let increases = matches!(
            (side, position_side),
            (TradeSide::Buy, PositionSide::Long) | (TradeSide::Sell, PositionSide::Short)
        );
        // OKX does not report whether a position existed; matching classifies it.
        let action = if increases { FillAction::Add } else { FillAction::Reduce };

        let price = parse_required("fillPx", &raw.fill_px)?;
        let size = parse_required("fillSz", &raw.fill_sz)?;
        let spec = self.contract_spec(&raw.inst_id).await?;
        let notional = if spec.inverse {
            size * spec.ct_val
        } else {
            size * spec.ct_val * price
        };

        Ok(Some(Fill {
            id: format!("{}:{}", raw.inst_id, raw.trade_id),
            symbol: normalize_symbol(&raw.inst_id),
            side,
            position_side,
            action,
            price,
            size,
            notional,
            timestamp: parse_millis(&raw.ts)?,
            realized_pnl: parse_decimal(&raw.fill_pnl),
        }))
    }
}

#[async_trait]
impl LeaderDataSource for OkxClient {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    async fn get_fills(&self, _leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError> {
        let mut fills = Vec::new();
        let mut after: Option<String> = None;

        for page in 0..MAX_FILL_PAGES {
            let mut path = format!(
                "/api/v5/trade/fills?instType=SWAP&begin={}&limit={}",
                since.timestamp_millis(),
                FILL_PAGE_SIZE
            );
            if let Some(bill_id) = &after {
                path.push_str(&format!("&after={}", bill_id));
            }

            let raw: Vec<OkxFill> = self.get(&path, true).await?;
            let full_page = raw.len() >= FILL_PAGE_SIZE;
            after = raw.last().map(|f| f.bill_id.clone()).filter(|id| !id.is_empty());

            for item in raw {
                if let Some(fill) = self.convert_fill(item).await? {
                    if fill.timestamp >= since {
                        fills.push(fill);
                    }
                }
            }

            if !full_page || after.is_none() {
                break;
            }
            if page + 1 == MAX_FILL_PAGES {
                warn!(pages = MAX_FILL_PAGES, "Fill backlog exceeds page limit, older fills not fetched");
            }
        }

        Ok(fills)
    }

    async fn get_account_state(&self, _leader_id: &str) -> Result<AccountState, ProviderError> {
        let raw_positions: Vec<OkxPosition> = self.get("/api/v5/account/positions?instType=SWAP", true).await?;
        let balances: Vec<OkxBalance> = self.get("/api/v5/account/balance", true).await?;

        let balance = balances
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("empty balance response".to_string()))?;

        let total_equity = parse_decimal(&balance.total_eq);
        let available_balance = balance
            .details
            .iter()
            .find(|d| d.ccy == "USDT")
            .map(|d| {
                let avail_eq = parse_decimal(&d.avail_eq);
                if avail_eq.is_zero() {
                    parse_decimal(&d.avail_bal)
                } else {
                    avail_eq
                }
            })
            .unwrap_or(Decimal::ZERO);

        let positions = raw_positions.into_iter().filter_map(convert_position).collect();

        Ok(AccountState::new(total_equity, available_balance, positions))
    }
}

fn convert_position(raw: OkxPosition) -> Option<Position> {
    let signed = parse_decimal(&raw.pos);
    if signed.is_zero() {
        return None;
    }

    let side = match PositionSide::parse(&raw.pos_side) {
        Some(side) => side,
        None if signed > Decimal::ZERO => PositionSide::Long,
        None => PositionSide::Short,
    };

    Some(Position {
        symbol: normalize_symbol(&raw.inst_id),
        side,
        size: signed.abs(),
        entry_price: parse_decimal(&raw.avg_px),
        mark_price: parse_decimal(&raw.mark_px),
        leverage: parse_decimal(&raw.lever).to_u32().unwrap_or(0),
        margin_mode: MarginMode::parse(&raw.mgn_mode).unwrap_or_default(),
        notional: parse_decimal(&raw.notional_usd).abs(),
        pos_id: Some(raw.pos_id),
    })
}

/// Lenient decimal parse for OKX's optional numeric strings.
fn parse_decimal(s: &str) -> Decimal {
    if s.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn parse_required(field: &str, s: &str) -> Result<Decimal, ProviderError> {
    Decimal::from_str(s).map_err(|e| ProviderError::Parse(format!("{} = {:?}: {}", field, s, e)))
}

fn parse_millis(s: &str) -> Result<DateTime<Utc>, ProviderError> {
    let millis: i64 = s
        .parse()
        .map_err(|_| ProviderError::Parse(format!("bad timestamp {:?}", s)))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ProviderError::Parse(format!("timestamp out of range {}", millis)))
}
