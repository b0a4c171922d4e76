//! Chunked storage of finished per-source bars.
//!
//! Finished [`SourceBar`]s are grouped into size-bounded, time-ordered
//! chunks. Exactly one chunk is active (still receiving appends); older
//! chunks are sealed and only consulted when a visible range is replayed.

use crate::bar::SourceBar;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An ordered run of finished source bars spanning `[from, to]`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Chunk {
    pub bars: Vec<SourceBar>,
    /// First bucket timestamp in this chunk.
    pub from: i64,
    /// Last bucket timestamp in this chunk.
    pub to: i64,
    /// Still receiving appended bars.
    pub active: bool,
    /// Currently selected for display.
    pub rendered: bool,
}

impl Chunk {
    fn new(bars: Vec<SourceBar>) -> Self {
        let from = bars.first().map(|bar| bar.time).unwrap_or(0);
        let to = bars.last().map(|bar| bar.time).unwrap_or(from);
        Self {
            bars,
            from,
            to,
            active: true,
            rendered: false,
        }
    }
}

/// In-memory store of sealed and active chunks, kept in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ChunkCache {
    chunks: Vec<Chunk>,
    /// Bar-count cap per chunk before a roll is considered.
    bar_cap: usize,
}

impl ChunkCache {
    pub fn new(bar_cap: usize) -> Self {
        Self {
            chunks: Vec::new(),
            bar_cap: bar_cap.max(1),
        }
    }

    /// Seal the current active chunk (if any) and append a new active chunk
    /// seeded with `bars`.
    pub fn save_chunk(&mut self, bars: Vec<SourceBar>) -> &Chunk {
        if let Some(active) = self.chunks.iter_mut().find(|chunk| chunk.active) {
            active.active = false;
            debug!(from = active.from, to = active.to, len = active.bars.len(), "chunk sealed");
        }
        self.chunks.push(Chunk::new(bars));
        self.chunks.last().unwrap()
    }

    /// Append one finished bar, rolling to a new chunk when the active chunk
    /// is absent, or when it has reached the bar cap and `bar` opens a new
    /// bucket. One bucket's source bars never straddle two chunks, which
    /// keeps chunk time ranges disjoint.
    pub fn push(&mut self, bar: SourceBar) {
        let roll = match self.active() {
            None => true,
            Some(active) => active.bars.len() >= self.bar_cap && bar.time > active.to,
        };
        if roll {
            self.save_chunk(vec![bar]);
            return;
        }
        let active = self
            .chunks
            .iter_mut()
            .find(|chunk| chunk.active)
            .expect("active chunk exists after roll check");
        active.to = active.to.max(bar.time);
        active.bars.push(bar);
    }

    /// The chunk still receiving appends, if any.
    pub fn active(&self) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.active)
    }

    /// Highest bucket timestamp stored, equal to the last chunk's `to`.
    pub fn high_water(&self) -> Option<i64> {
        self.chunks.last().map(|chunk| chunk.to)
    }

    /// Select chunks for a visible range starting at `range_start` and
    /// concatenate their bars in time order.
    ///
    /// A chunk is selected when its `to` exceeds
    /// `range_start - lookback_bars * bucket_width_ms`, keeping bars just
    /// outside the viewport available for series that need lag. Selection
    /// updates each chunk's `rendered` flag.
    pub fn select(
        &mut self,
        range_start: i64,
        bucket_width_ms: i64,
        lookback_bars: i64,
    ) -> Vec<SourceBar> {
        let threshold = range_start.saturating_sub(lookback_bars.saturating_mul(bucket_width_ms));
        let mut bars = Vec::new();
        for chunk in &mut self.chunks {
            chunk.rendered = chunk.to > threshold;
            if chunk.rendered {
                bars.extend(chunk.bars.iter().cloned());
            }
        }
        bars
    }

    /// Discard all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::SourceId;
    use itertools::Itertools;

    fn bar(source: &str, time: i64) -> SourceBar {
        let mut bar = SourceBar::seeded(SourceId::new(source), time, 100.0);
        bar.empty = false;
        bar.vbuy = 1.0;
        bar
    }

    #[test]
    fn test_roll_only_at_bucket_boundary() {
        let mut cache = ChunkCache::new(2);
        // Three sources close the same bucket: cap is exceeded but the
        // bucket must stay in one chunk.
        cache.push(bar("BINANCE", 0));
        cache.push(bar("BYBIT", 0));
        cache.push(bar("OKX", 0));
        assert_eq!(cache.chunks().len(), 1);
        assert_eq!(cache.active().unwrap().bars.len(), 3);

        // Next bucket opens a fresh chunk.
        cache.push(bar("BINANCE", 60_000));
        assert_eq!(cache.chunks().len(), 2);
        assert!(!cache.chunks()[0].active);
        assert!(cache.chunks()[1].active);
        assert_eq!(cache.high_water(), Some(60_000));
    }

    #[test]
    fn test_ranges_disjoint_and_ordered() {
        let mut cache = ChunkCache::new(2);
        for bucket in 0..6 {
            cache.push(bar("BINANCE", bucket * 60_000));
        }

        for (left, right) in cache.chunks().iter().tuple_windows() {
            assert!(left.to < right.from, "chunk ranges overlap");
        }

        let times: Vec<i64> = cache
            .chunks()
            .iter()
            .flat_map(|chunk| chunk.bars.iter().map(|bar| bar.time))
            .collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_select_applies_lookback() {
        let mut cache = ChunkCache::new(1);
        cache.push(bar("BINANCE", 0));
        cache.push(bar("BINANCE", 60_000));
        cache.push(bar("BINANCE", 120_000));

        // Viewport starts at 120_000 with 60s buckets: lookback of 3 buckets
        // keeps everything with to > 120_000 - 180_000.
        let bars = cache.select(120_000, 60_000, 3);
        assert_eq!(bars.len(), 3);

        // A tight lookback of 0 drops the chunk that closed at 0.
        let bars = cache.select(120_000, 60_000, 0);
        assert_eq!(bars.len(), 2);
        assert!(!cache.chunks()[0].rendered);
        assert!(cache.chunks()[1].rendered);
    }

    #[test]
    fn test_save_chunk_seals_previous() {
        let mut cache = ChunkCache::new(100);
        cache.push(bar("BINANCE", 0));
        let chunk = cache.save_chunk(vec![bar("BINANCE", 60_000)]);
        assert!(chunk.active);
        assert_eq!(chunk.from, 60_000);
        assert_eq!(cache.chunks()[0].active, false);
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut cache = ChunkCache::new(10);
        cache.push(bar("BINANCE", 0));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.high_water(), None);
    }
}
