//! Per-bucket bar accumulators.
//!
//! [`SourceBar`] is one source's contribution to a time bucket, mutated in
//! place while the bucket is current and cloned into the chunk cache once it
//! closes. [`CombinedBar`] is the active-source aggregate of side-split
//! volumes, counts, and liquidation volumes for the same bucket.

use crate::trade::{Side, SourceId, Trade};
use serde::{Deserialize, Serialize};

/// Align a timestamp to the start of its bucket.
#[inline]
pub fn bucket_of(time_ms: i64, bucket_width_ms: i64) -> i64 {
    (time_ms / bucket_width_ms) * bucket_width_ms
}

/// One source's accumulation for a single time bucket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceBar {
    /// Source feed this bar belongs to.
    pub source: SourceId,
    /// Bucket start, Unix epoch milliseconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Aggressive buy volume, quote-currency notional.
    pub vbuy: f64,
    /// Aggressive sell volume, quote-currency notional.
    pub vsell: f64,
    /// Buy trade count.
    pub cbuy: u64,
    /// Sell trade count.
    pub csell: u64,
    /// Buy-side liquidation volume, quote-currency notional.
    pub lbuy: f64,
    /// Sell-side liquidation volume, quote-currency notional.
    pub lsell: f64,
    /// True until a trade touches this bucket.
    pub empty: bool,
}

impl SourceBar {
    /// Open a bar seeded with a starting price (carried close or first trade).
    pub fn seeded(source: SourceId, time: i64, price: f64) -> Self {
        Self {
            source,
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            vbuy: 0.0,
            vsell: 0.0,
            cbuy: 0,
            csell: 0,
            lbuy: 0.0,
            lsell: 0.0,
            empty: true,
        }
    }

    /// Fold one trade into this bar.
    ///
    /// Volumes accumulate in quote currency (price times size). Liquidations
    /// only increment the liquidation-volume fields; price fields are left
    /// untouched.
    pub fn fold_trade(&mut self, trade: &Trade) {
        let notional = trade.price * trade.amount;
        if trade.liquidation {
            match trade.side {
                Side::Buy => self.lbuy += notional,
                Side::Sell => self.lsell += notional,
            }
        } else {
            self.high = self.high.max(trade.price);
            self.low = self.low.min(trade.price);
            self.close = trade.price;
            match trade.side {
                Side::Buy => {
                    self.vbuy += notional;
                    self.cbuy += 1;
                }
                Side::Sell => {
                    self.vsell += notional;
                    self.csell += 1;
                }
            }
        }
        self.empty = false;
    }

    /// Merge a finished bar back in during replay.
    ///
    /// Used when archived chunk bars are folded through a throwaway renderer;
    /// equivalent to replaying the trades the bar was built from.
    pub fn fold_bar(&mut self, other: &SourceBar) {
        if other.empty {
            return;
        }
        if self.empty {
            self.open = other.open;
        }
        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.close = other.close;
        self.vbuy += other.vbuy;
        self.vsell += other.vsell;
        self.cbuy += other.cbuy;
        self.csell += other.csell;
        self.lbuy += other.lbuy;
        self.lsell += other.lsell;
        self.empty = false;
    }

    /// Advance to a new bucket, carrying the close forward as the starting
    /// OHLC and zeroing volumes and counts.
    pub fn advance(&mut self, time: i64) {
        self.time = time;
        self.open = self.close;
        self.high = self.close;
        self.low = self.close;
        self.vbuy = 0.0;
        self.vsell = 0.0;
        self.cbuy = 0;
        self.csell = 0;
        self.lbuy = 0.0;
        self.lsell = 0.0;
        self.empty = true;
    }
}

/// Sum across all active sources for one bucket.
///
/// Holds no price fields: the renderer derives combined OHLC views from the
/// retained per-source bars so that toggling the active set only requires
/// recombination, never re-ingestion.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct CombinedBar {
    /// Bucket start, Unix epoch milliseconds.
    pub time: i64,
    pub vbuy: f64,
    pub vsell: f64,
    pub cbuy: u64,
    pub csell: u64,
    pub lbuy: f64,
    pub lsell: f64,
    /// True until a trade from an active source touches this bucket.
    pub empty: bool,
}

impl CombinedBar {
    /// Open an empty combined bar for a bucket.
    pub fn new(time: i64) -> Self {
        Self {
            time,
            empty: true,
            ..Default::default()
        }
    }

    /// Mirror one active-source trade's increments.
    pub fn fold_trade(&mut self, trade: &Trade) {
        let notional = trade.price * trade.amount;
        if trade.liquidation {
            match trade.side {
                Side::Buy => self.lbuy += notional,
                Side::Sell => self.lsell += notional,
            }
        } else {
            match trade.side {
                Side::Buy => {
                    self.vbuy += notional;
                    self.cbuy += 1;
                }
                Side::Sell => {
                    self.vsell += notional;
                    self.csell += 1;
                }
            }
        }
        self.empty = false;
    }

    /// Mirror one active source bar's totals (replay path).
    pub fn fold_bar(&mut self, bar: &SourceBar) {
        if bar.empty {
            return;
        }
        self.vbuy += bar.vbuy;
        self.vsell += bar.vsell;
        self.cbuy += bar.cbuy;
        self.csell += bar.csell;
        self.lbuy += bar.lbuy;
        self.lsell += bar.lsell;
        self.empty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, amount: f64, side: Side, liquidation: bool, time: i64) -> Trade {
        Trade {
            exchange: SourceId::new("BINANCE"),
            market: "btcusdt".into(),
            price,
            amount,
            side,
            liquidation,
            time,
        }
    }

    #[test]
    fn test_bucket_alignment() {
        assert_eq!(bucket_of(0, 60_000), 0);
        assert_eq!(bucket_of(59_999, 60_000), 0);
        assert_eq!(bucket_of(60_000, 60_000), 60_000);
        assert_eq!(bucket_of(119_999, 60_000), 60_000);
    }

    #[test]
    fn test_source_bar_fold_and_carry() {
        let mut bar = SourceBar::seeded(SourceId::new("BINANCE"), 0, 100.0);
        assert!(bar.empty);

        bar.fold_trade(&trade(100.0, 1.0, Side::Buy, false, 0));
        bar.fold_trade(&trade(98.0, 2.0, Side::Sell, false, 10));
        bar.fold_trade(&trade(103.0, 0.5, Side::Buy, false, 20));

        assert!(!bar.empty);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 103.0);
        // Notional: 100*1 + 103*0.5 bought, 98*2 sold
        assert_eq!(bar.vbuy, 151.5);
        assert_eq!(bar.vsell, 196.0);
        assert_eq!(bar.cbuy, 2);
        assert_eq!(bar.csell, 1);

        bar.advance(60_000);
        assert!(bar.empty);
        assert_eq!(bar.time, 60_000);
        // Price continuity across buckets
        assert_eq!(bar.open, 103.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 103.0);
        assert_eq!(bar.close, 103.0);
        assert_eq!(bar.vbuy, 0.0);
        assert_eq!(bar.cbuy, 0);
    }

    #[test]
    fn test_liquidation_never_touches_price() {
        let mut bar = SourceBar::seeded(SourceId::new("BINANCE"), 0, 100.0);
        bar.fold_trade(&trade(100.0, 1.0, Side::Buy, false, 0));
        bar.fold_trade(&trade(250.0, 3.0, Side::Sell, true, 10));

        assert_eq!(bar.high, 100.0);
        assert_eq!(bar.close, 100.0);
        assert_eq!(bar.lsell, 750.0);
        assert_eq!(bar.vsell, 0.0);
        assert_eq!(bar.csell, 0);
    }

    #[test]
    fn test_fold_bar_merges_replay_totals() {
        let mut into = SourceBar::seeded(SourceId::new("BINANCE"), 0, 100.0);
        let mut from = SourceBar::seeded(SourceId::new("BINANCE"), 0, 101.0);
        from.fold_trade(&trade(101.0, 1.0, Side::Buy, false, 0));
        from.fold_trade(&trade(99.0, 0.5, Side::Sell, false, 5));

        into.fold_bar(&from);
        assert_eq!(into.open, 101.0);
        assert_eq!(into.low, 99.0);
        assert_eq!(into.close, 99.0);
        assert_eq!(into.vbuy, 101.0);
        assert_eq!(into.vsell, 49.5);

        // An empty bar must contribute nothing
        let untouched = SourceBar::seeded(SourceId::new("OKX"), 0, 500.0);
        let before = into.clone();
        into.fold_bar(&untouched);
        assert_eq!(into, before);
    }

    #[test]
    fn test_combined_bar_tracks_active_increments_only() {
        let mut combined = CombinedBar::new(0);
        assert!(combined.empty);

        combined.fold_trade(&trade(100.0, 1.0, Side::Buy, false, 0));
        combined.fold_trade(&trade(100.0, 2.0, Side::Sell, true, 5));

        assert!(!combined.empty);
        assert_eq!(combined.vbuy, 100.0);
        assert_eq!(combined.cbuy, 1);
        assert_eq!(combined.lsell, 200.0);
        assert_eq!(combined.vsell, 0.0);
    }
}
