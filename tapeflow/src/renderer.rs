//! The mutable aggregation context for one time bucket.
//!
//! Exactly one renderer is live (bound to the real-time stream) at a time;
//! ephemeral renderers are created transiently to replay archived ranges and
//! never escape the rebuild that made them. The renderer retains a bar per
//! source regardless of activity so that toggling the active set only needs
//! recombination, never re-ingestion of raw trades.

use crate::bar::{CombinedBar, SourceBar};
use crate::series::transpile::BarField;
use crate::series::{SerieId, SerieState};
use crate::trade::{SourceId, Trade};
use fnv::{FnvHashMap, FnvHashSet};
use vecmap::VecMap;

#[derive(Debug, Clone)]
pub struct Renderer {
    /// Current bucket start, Unix epoch milliseconds.
    pub time: i64,
    /// Active-source aggregate under construction.
    pub bar: CombinedBar,
    /// Per-source sub-bars, in first-seen order.
    pub sources: VecMap<SourceId, SourceBar>,
    /// Per-series persistent instruction state.
    pub series: FnvHashMap<SerieId, SerieState>,
    active: FnvHashSet<SourceId>,
}

impl Renderer {
    pub fn new(time: i64, active: FnvHashSet<SourceId>) -> Self {
        Self {
            time,
            bar: CombinedBar::new(time),
            sources: VecMap::new(),
            series: FnvHashMap::default(),
            active,
        }
    }

    pub fn is_active(&self, source: &SourceId) -> bool {
        self.active.contains(source)
    }

    /// Swap the active-source set and recombine the in-flight combined bar
    /// from the retained source bars.
    pub fn set_active(&mut self, active: FnvHashSet<SourceId>) {
        self.active = active;
        self.recombine();
    }

    /// Rebuild the combined bar from retained per-source bars, restricted to
    /// the active set.
    pub fn recombine(&mut self) {
        let mut combined = CombinedBar::new(self.time);
        for (source, bar) in self.sources.iter() {
            if self.active.contains(source) {
                combined.fold_bar(bar);
            }
        }
        self.bar = combined;
    }

    /// Fold one trade into its source bar, mirroring into the combined bar
    /// when the source is active.
    pub fn fold_trade(&mut self, trade: &Trade) {
        let source = trade.source();
        if !self.sources.contains_key(source) {
            self.sources.insert(
                source.clone(),
                SourceBar::seeded(source.clone(), self.time, trade.price),
            );
        }
        let bar = self.sources.get_mut(source).expect("source bar just inserted");
        bar.fold_trade(trade);

        if self.active.contains(source) {
            self.bar.fold_trade(trade);
        }
    }

    /// Fold one archived source bar during replay, mirroring into the
    /// combined bar when the source is active.
    pub fn fold_source_bar(&mut self, archived: &SourceBar) {
        if archived.empty {
            return;
        }
        if !self.sources.contains_key(&archived.source) {
            self.sources.insert(
                archived.source.clone(),
                SourceBar::seeded(archived.source.clone(), self.time, archived.open),
            );
        }
        let bar = self
            .sources
            .get_mut(&archived.source)
            .expect("source bar just inserted");
        bar.fold_bar(archived);

        if self.active.contains(&archived.source) {
            self.bar.fold_bar(archived);
        }
    }

    /// Advance to a new bucket: every source bar carries its close forward
    /// as the starting OHLC, the combined bar resets.
    pub fn advance(&mut self, time: i64) {
        self.time = time;
        for (_, bar) in self.sources.iter_mut() {
            bar.advance(time);
        }
        self.bar = CombinedBar::new(time);
    }

    /// Source bars touched this bucket, for persistence on close.
    pub fn touched_bars(&self) -> impl Iterator<Item = &SourceBar> {
        self.sources.values().filter(|bar| !bar.empty)
    }

    /// Read one combined-bar field. Price fields are derived views over
    /// active non-empty source bars: mean open/close, extreme high/low.
    pub fn combined_field(&self, field: BarField) -> f64 {
        match field {
            BarField::Time => self.bar.time as f64,
            BarField::Vbuy => self.bar.vbuy,
            BarField::Vsell => self.bar.vsell,
            BarField::Cbuy => self.bar.cbuy as f64,
            BarField::Csell => self.bar.csell as f64,
            BarField::Lbuy => self.bar.lbuy,
            BarField::Lsell => self.bar.lsell,
            BarField::Open => self.mean_price(|bar| bar.open),
            BarField::Close => self.mean_price(|bar| bar.close),
            BarField::High => self.extreme_price(|bar| bar.high, f64::max),
            BarField::Low => self.extreme_price(|bar| bar.low, f64::min),
        }
    }

    /// Read one field of a named source's bar; 0 when the source has not
    /// traded yet.
    pub fn source_field(&self, source: &SourceId, field: BarField) -> f64 {
        let Some(bar) = self.sources.get(source) else {
            return 0.0;
        };
        match field {
            BarField::Time => bar.time as f64,
            BarField::Open => bar.open,
            BarField::High => bar.high,
            BarField::Low => bar.low,
            BarField::Close => bar.close,
            BarField::Vbuy => bar.vbuy,
            BarField::Vsell => bar.vsell,
            BarField::Cbuy => bar.cbuy as f64,
            BarField::Csell => bar.csell as f64,
            BarField::Lbuy => bar.lbuy,
            BarField::Lsell => bar.lsell,
        }
    }

    /// Combined OHLC view over active non-empty sources.
    pub fn combined_ohlc(&self) -> (f64, f64, f64, f64) {
        (
            self.combined_field(BarField::Open),
            self.combined_field(BarField::High),
            self.combined_field(BarField::Low),
            self.combined_field(BarField::Close),
        )
    }

    fn contributing(&self) -> impl Iterator<Item = &SourceBar> {
        self.sources
            .iter()
            .filter(|(source, bar)| self.active.contains(*source) && !bar.empty)
            .map(|(_, bar)| bar)
    }

    fn mean_price(&self, pick: impl Fn(&SourceBar) -> f64) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for bar in self.contributing() {
            sum += pick(bar);
            count += 1;
        }
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    fn extreme_price(
        &self,
        pick: impl Fn(&SourceBar) -> f64,
        fold: impl Fn(f64, f64) -> f64,
    ) -> f64 {
        let mut extreme = None;
        for bar in self.contributing() {
            let value = pick(bar);
            extreme = Some(match extreme {
                None => value,
                Some(current) => fold(current, value),
            });
        }
        extreme.unwrap_or(0.0)
    }
}
