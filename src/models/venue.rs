//! Supported leader venues.

use serde::{Deserialize, Serialize};

/// Venue a leader trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Okx,
    Hyperliquid,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Okx => "okx",
            Venue::Hyperliquid => "hyperliquid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "okx" => Some(Self::Okx),
            "hyperliquid" | "hl" => Some(Self::Hyperliquid),
            _ => None,
        }
    }

    /// Whether position ids on this venue are composite and reused on reopen.
    pub fn has_virtual_ids(&self) -> bool {
        matches!(self, Venue::Hyperliquid)
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a venue symbol to the `BASEQUOTE` form.
///
/// `BTC-USDT-SWAP` and `BTC-USDT` become `BTCUSDT`; a bare coin such as
/// Hyperliquid's `BTC` is quoted in USDT.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let parts: Vec<&str> = upper.split('-').collect();
    match parts.as_slice() {
        [base] => {
            if base.ends_with("USDT") || base.ends_with("USDC") {
                base.to_string()
            } else {
                format!("{}USDT", base)
            }
        }
        [base, quote, ..] => format!("{}{}", base, quote),
        _ => upper,
    }
}
