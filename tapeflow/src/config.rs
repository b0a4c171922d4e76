//! Explicit aggregation configuration.
//!
//! Components receive configuration at construction; changes arrive as
//! discrete [`ConfigEvent`]s through the controller, never through a shared
//! mutable store.

use crate::trade::SourceId;
use serde::{Deserialize, Serialize};

/// Lookback constant `K`: chunks closing within `K` buckets before the
/// visible range stay selected so lagging series have history.
pub const RANGE_LOOKBACK_BARS: i64 = 3;

/// How long a just-issued data replace suppresses display-driven range
/// change handling, to avoid feedback loops. Not a correctness mechanism.
pub const REDRAW_GUARD_MS: i64 = 500;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregationConfig {
    /// Bucket width in milliseconds.
    pub bucket_width_ms: i64,
    /// Bar-count cap per cache chunk.
    pub chunk_bar_cap: usize,
    /// Sliding-counter trailing window, milliseconds.
    pub counter_window_ms: i64,
    /// Sliding-counter slot granularity, milliseconds.
    pub counter_granularity_ms: i64,
    /// Sources whose trades count into combined bars.
    pub active_sources: Vec<SourceId>,
    /// All sources known to the feed, addressable from formulas.
    pub sources: Vec<SourceId>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: 10_000,
            chunk_bar_cap: 5_000,
            counter_window_ms: 60_000,
            counter_granularity_ms: 5_000,
            active_sources: Vec::new(),
            sources: Vec::new(),
        }
    }
}

impl AggregationConfig {
    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|source| SourceId::new(source)).collect();
        self.active_sources = self.sources.clone();
        self
    }

    pub fn with_bucket_width(mut self, bucket_width_ms: i64) -> Self {
        self.bucket_width_ms = bucket_width_ms;
        self
    }

    pub fn with_chunk_bar_cap(mut self, chunk_bar_cap: usize) -> Self {
        self.chunk_bar_cap = chunk_bar_cap;
        self
    }
}

/// Discrete configuration change pushed into the controller.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ConfigEvent {
    /// New bucket width; invalidates cached bars.
    BucketWidth(i64),
    /// New active-source set; triggers recombination and rebuild.
    ActiveSources(Vec<SourceId>),
    /// Display-driven visible range change, milliseconds.
    VisibleRange { from: i64, to: i64 },
}
