//! Multi-source trade aggregation into time-bucketed bars feeding
//! user-definable derived series.
//!
//! A continuous stream of normalised [`Trade`]s folds into fixed-width time
//! buckets: one [`SourceBar`] per feed plus a [`CombinedBar`] across the
//! active source set. Finished per-source bars persist into a chunked
//! in-memory cache so that toggling which sources count, or changing the
//! visible range, only requires replaying retained bars, never re-ingesting
//! raw trades.
//!
//! Each user serie carries a formula compiled once by [`transpile`] into a
//! typed instruction graph; [`SerieAdapter`] evaluates it on every bucket
//! close against explicit per-renderer state, so cloned state replays
//! reproducibly. [`AggregationController`] orchestrates the pipeline:
//! queued trade batches, bucket-boundary crossings, chunk persistence,
//! dependency-ordered serie recomputation, fault isolation, and full
//! rebuilds against the [`RenderSink`] display collaborator.

pub mod bar;
pub mod cache;
pub mod config;
pub mod controller;
pub mod counter;
pub mod error;
pub mod renderer;
pub mod sched;
pub mod series;
pub mod sink;
pub mod trade;

pub use bar::{CombinedBar, SourceBar, bucket_of};
pub use cache::{Chunk, ChunkCache};
pub use config::{AggregationConfig, ConfigEvent};
pub use controller::AggregationController;
pub use counter::SlidingCounter;
pub use error::{SeriesError, SeriesFault};
pub use renderer::Renderer;
pub use sched::TimerQueue;
pub use series::{
    ActiveSerie, OutputKind, SerieAdapter, SerieDefinition, SerieId, SerieModel, SerieOptions,
    SerieState, TranspileContext, VisualType, transpile,
};
pub use sink::{LogSink, PointValue, RecordingSink, RenderSink, SeriesPoint, SinkEvent};
pub use trade::{Side, SourceId, Trade};
