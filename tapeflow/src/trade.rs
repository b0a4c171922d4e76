//! Normalised inbound trade model.
//!
//! The transport layer (external to this crate) is expected to hand the core
//! already-normalised [`Trade`] records priced in the instrument's quote
//! currency. Nothing here validates exchange payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Identifier of one trade source (exchange + market feed).
pub type SourceId = SmolStr;

/// Side of a trade (aggressor side).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// Check if this is a buy
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Check if this is a sell
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single normalised trade execution.
///
/// Immutable once received; `time` is Unix epoch milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Trade {
    /// Source exchange feed the trade arrived from (e.g. "BINANCE").
    pub exchange: SourceId,
    /// Instrument identifier on that exchange (e.g. "btcusdt").
    pub market: SmolStr,
    /// Execution price in quote currency.
    pub price: f64,
    /// Trade size in base currency.
    pub amount: f64,
    /// Aggressor side.
    pub side: Side,
    /// True when this execution is a forced liquidation.
    #[serde(default)]
    pub liquidation: bool,
    /// Execution time, Unix epoch milliseconds.
    pub time: i64,
}

impl Trade {
    /// Source identity used for active-source filtering.
    pub fn source(&self) -> &SourceId {
        &self.exchange
    }

    /// Execution time as a UTC datetime, for logging at the edges.
    pub fn time_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.time).unwrap_or_else(Utc::now)
    }
}
