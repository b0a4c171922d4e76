//! Orchestration of the whole aggregation pipeline.
//!
//! The controller exclusively owns the live [`Renderer`], the [`ChunkCache`],
//! and the series registry; nothing else mutates them. Trade batches queue up
//! and are folded synchronously to completion by [`drain`], so aggregation
//! and recomputation never interleave. Per-series validation failures stream
//! to the fault channel and never stop the loop.
//!
//! [`drain`]: AggregationController::drain

use crate::bar::{SourceBar, bucket_of};
use crate::cache::ChunkCache;
use crate::config::{AggregationConfig, ConfigEvent, RANGE_LOOKBACK_BARS, REDRAW_GUARD_MS};
use crate::counter::SlidingCounter;
use crate::error::{SeriesError, SeriesFault};
use crate::renderer::Renderer;
use crate::sched::TimerQueue;
use crate::series::{
    ActiveSerie, SerieDefinition, SerieId, SerieOptions, SerieState, TranspileContext, VisualType,
    transpile,
};
use crate::sink::{PointValue, RenderSink, SeriesPoint};
use crate::trade::{SourceId, Trade};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vecmap::VecMap;

fn notional(trade: &Trade) -> f64 {
    trade.price * trade.amount
}

/// Narrow a computed value to the shape its visual can draw: OHLC collapses
/// to its close under scalar visuals, everything else passes through.
fn shape_point(visual: VisualType, value: PointValue) -> PointValue {
    match (visual, value) {
        (
            VisualType::Line | VisualType::Area | VisualType::Histogram,
            PointValue::Ohlc { close, .. },
        ) => PointValue::Value(close),
        (_, value) => value,
    }
}

/// Evaluate `ids` (already in dependency order) against a renderer whose
/// bucket just closed, record one point per surviving serie, then advance
/// every instruction state once.
///
/// A bucket with an empty combined bar emits nothing and advances nothing.
/// Non-numeric results land in `dead` instead of `points`; a dead serie's
/// dependents read `NaN` for it and fault through the same path.
fn compute_closed_bucket(
    renderer: &mut Renderer,
    registry: &VecMap<SerieId, ActiveSerie>,
    ids: &[SerieId],
    points: &mut FnvHashMap<SerieId, Vec<SeriesPoint>>,
    dead: &mut Vec<(SerieId, i64)>,
) {
    if renderer.bar.empty {
        return;
    }
    let time = renderer.time;
    let mut outputs: FnvHashMap<SerieId, f64> = FnvHashMap::default();
    for id in ids {
        if dead.iter().any(|(dead_id, _)| dead_id == id) {
            continue;
        }
        let Some(serie) = registry.get(id) else {
            continue;
        };
        let Some(adapter) = serie.adapter.as_ref() else {
            continue;
        };
        let Some(mut state) = renderer.series.remove(id) else {
            continue;
        };
        let value = adapter.eval(renderer, &mut state, &serie.definition.options, &outputs);
        renderer.series.insert(id.clone(), state);
        if value.has_nan() {
            dead.push((id.clone(), time));
            continue;
        }
        outputs.insert(id.clone(), value.scalar());
        points.entry(id.clone()).or_default().push(SeriesPoint {
            time,
            value: shape_point(serie.definition.visual, value),
        });
    }
    for state in renderer.series.values_mut() {
        state.advance();
    }
}

/// Owns the live renderer, the chunk cache, and the bound series; folds the
/// queued trade stream into buckets and drives every bound serie through its
/// adapter on each bucket close.
pub struct AggregationController<S: RenderSink> {
    config: AggregationConfig,
    renderer: Renderer,
    cache: ChunkCache,
    /// Rolling notional traded across all sources, for flow diagnostics.
    counter: SlidingCounter<Trade>,
    series: VecMap<SerieId, ActiveSerie>,
    /// Evaluation order: every serie after the series it references.
    order: Vec<SerieId>,
    /// Queued trade batches, drained strictly in arrival order.
    queue: VecDeque<Vec<Trade>>,
    sink: S,
    faults: mpsc::UnboundedSender<SeriesFault>,
    /// While armed, display-driven range changes are ignored so a just-issued
    /// data replace cannot feed back into another rebuild.
    guard: TimerQueue<()>,
    /// Timeline position of the last drain.
    now_ms: i64,
    /// Start of the visible range used for chunk selection.
    visible_from: i64,
}

impl<S: RenderSink> AggregationController<S> {
    /// Build a controller around its configuration and render sink. The
    /// returned receiver carries per-series validation faults.
    pub fn new(
        config: AggregationConfig,
        sink: S,
    ) -> (Self, mpsc::UnboundedReceiver<SeriesFault>) {
        let (faults, fault_stream) = mpsc::unbounded_channel();
        let controller = Self {
            renderer: Renderer::new(0, config.active_sources.iter().cloned().collect()),
            cache: ChunkCache::new(config.chunk_bar_cap),
            counter: SlidingCounter::new(
                config.counter_window_ms,
                config.counter_granularity_ms,
                notional,
            ),
            series: VecMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            sink,
            faults,
            guard: TimerQueue::new(),
            now_ms: 0,
            visible_from: 0,
            config,
        };
        (controller, fault_stream)
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn serie(&self, id: &SerieId) -> Option<&ActiveSerie> {
        self.series.get(id)
    }

    /// True while the serie has instruction state in the live renderer.
    pub fn is_bound(&self, id: &SerieId) -> bool {
        self.renderer.series.contains_key(id)
    }

    /// Rolling notional traded over the counter window.
    pub fn flow(&self, now_ms: i64) -> f64 {
        self.counter.value(now_ms)
    }

    /// Enqueue one trade batch. Empty batches are ignored.
    pub fn queue_trades(&mut self, batch: Vec<Trade>) {
        if batch.is_empty() {
            return;
        }
        self.queue.push_back(batch);
    }

    /// Fold every queued batch to completion, strictly in arrival order,
    /// then pump the counter expiries and the redraw guard.
    pub fn drain(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
        while let Some(batch) = self.queue.pop_front() {
            for trade in batch {
                self.ingest(trade);
            }
        }
        self.counter.poll(now_ms);
        while self.guard.pop_due(now_ms).is_some() {}
    }

    /// Register or replace a serie.
    ///
    /// A successful compile binds the serie (when enabled) and replays its
    /// history; a failed compile keeps the configuration registered but
    /// unbound, with the error both returned and emitted as a fault.
    pub fn add_serie(&mut self, definition: SerieDefinition) -> Result<(), SeriesError> {
        let id = definition.id.clone();
        self.renderer.series.remove(&id);

        let known: Vec<SerieId> = self
            .series
            .keys()
            .filter(|existing| **existing != id)
            .cloned()
            .collect();
        let ctx = TranspileContext {
            sources: &self.config.sources,
            series: &known,
        };
        let compiled = transpile(&definition, &ctx).and_then(|model| {
            if self.has_cycle(&id, &model.references) {
                Err(SeriesError::CyclicReference(id.to_string()))
            } else {
                Ok(model)
            }
        });

        match compiled {
            Ok(model) => {
                info!(%id, kind = %model.output_kind, "series compiled");
                let enabled = definition.enabled;
                self.series
                    .insert(id.clone(), ActiveSerie::compiled(definition, model));
                self.reorder();
                if enabled {
                    self.bind(&id);
                    self.rebuild_subset(Some(std::slice::from_ref(&id)));
                }
                Ok(())
            }
            Err(error) => {
                self.series.insert(id.clone(), ActiveSerie::broken(definition));
                self.reorder();
                self.fault(id, error.clone());
                Err(error)
            }
        }
    }

    /// Drop a serie entirely: state, configuration, and evaluation slot.
    pub fn remove_serie(&mut self, id: &SerieId) {
        self.renderer.series.remove(id);
        if self.series.remove(id).is_some() {
            self.reorder();
            info!(%id, "series removed");
        }
    }

    /// Attach or detach a serie without touching its configuration.
    pub fn set_serie_enabled(&mut self, id: &SerieId, enabled: bool) {
        let Some(serie) = self.series.get_mut(id) else {
            return;
        };
        if serie.definition.enabled == enabled {
            return;
        }
        serie.definition.enabled = enabled;
        if enabled {
            self.bind(id);
            self.rebuild_subset(Some(std::slice::from_ref(id)));
        } else {
            self.unbind(id);
        }
    }

    /// Re-bind a serie that was unbound by a runtime fault. No-op while the
    /// model is broken or the serie is disabled.
    pub fn retry_serie(&mut self, id: &SerieId) {
        let ready = self
            .series
            .get(id)
            .is_some_and(|serie| serie.model.is_some() && serie.definition.enabled);
        if ready {
            self.bind(id);
            self.rebuild_subset(Some(std::slice::from_ref(id)));
        }
    }

    /// Swap a serie's resolved numeric options and re-resolve any
    /// options-dependent instruction windows in place, without recompiling.
    pub fn set_serie_options(&mut self, id: &SerieId, options: SerieOptions) {
        let Some(serie) = self.series.get_mut(id) else {
            return;
        };
        serie.definition.options = options;
        if let (Some(model), Some(state)) =
            (serie.model.as_ref(), self.renderer.series.get_mut(id))
        {
            state.update_args(model, &serie.definition.options);
        }
    }

    /// Apply one discrete configuration change.
    pub fn apply(&mut self, event: ConfigEvent) {
        match event {
            ConfigEvent::BucketWidth(width) => self.set_bucket_width(width),
            ConfigEvent::ActiveSources(sources) => self.set_active_sources(sources),
            ConfigEvent::VisibleRange { from, to } => self.set_visible_range(from, to),
        }
    }

    /// Swap which sources count into combined bars. The in-flight bucket is
    /// recombined from retained source bars and history is rebuilt, without
    /// re-ingesting raw trades.
    pub fn set_active_sources(&mut self, sources: Vec<SourceId>) {
        info!(active = sources.len(), "active source set changed");
        self.config.active_sources = sources;
        self.renderer
            .set_active(self.config.active_sources.iter().cloned().collect());
        self.rebuild();
    }

    /// Change the bucket width. Cached bars aggregate at the old width and
    /// are invalidated; the live renderer restarts with fresh serie state.
    pub fn set_bucket_width(&mut self, bucket_width_ms: i64) {
        if bucket_width_ms == self.config.bucket_width_ms {
            return;
        }
        info!(bucket_width_ms, "bucket width changed, cache invalidated");
        self.config.bucket_width_ms = bucket_width_ms.max(1);
        self.cache.clear();
        self.reset_renderer();
        let bound: Vec<SerieId> = self.bound_series();
        for id in bound {
            self.sink.replace_all(&id, Vec::new());
        }
    }

    /// Display-driven visible range change. Ignored while the redraw guard
    /// is armed, so a just-issued data replace cannot feed back here.
    pub fn set_visible_range(&mut self, from: i64, to: i64) {
        if !self.guard.is_empty() {
            debug!(from, to, "range change suppressed after data replace");
            return;
        }
        self.visible_from = from;
        self.rebuild();
    }

    /// Replay all selected chunks and issue a full data replace for every
    /// bound serie.
    pub fn rebuild(&mut self) {
        self.rebuild_subset(None);
    }

    /// Targeted redraw: rebuild only `subset` and its transitive references.
    pub fn rebuild_series(&mut self, subset: &[SerieId]) {
        self.rebuild_subset(Some(subset));
    }

    /// Cancel all pending work: queued batches, counter expiries, cached
    /// chunks, and the redraw guard. The series registry survives and every
    /// enabled serie re-binds with fresh state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.counter.clear();
        self.cache.clear();
        self.guard.clear();
        self.reset_renderer();
    }

    fn ingest(&mut self, trade: Trade) {
        let bucket = bucket_of(trade.time, self.config.bucket_width_ms);
        if bucket < self.renderer.time {
            debug!(time = %trade.time_utc(), live = self.renderer.time, "stale trade dropped");
            return;
        }
        if bucket > self.renderer.time {
            self.close_bucket();
            self.renderer.advance(bucket);
        }
        self.counter.on_update(trade.time, &trade);
        self.renderer.fold_trade(&trade);
    }

    /// Finalize the live bucket: run every bound serie through its adapter,
    /// append the survivors' points, then persist the touched source bars.
    fn close_bucket(&mut self) {
        if !self.renderer.bar.empty {
            let bound = self.bound_series();
            let mut points: FnvHashMap<SerieId, Vec<SeriesPoint>> = FnvHashMap::default();
            let mut dead: Vec<(SerieId, i64)> = Vec::new();
            compute_closed_bucket(&mut self.renderer, &self.series, &bound, &mut points, &mut dead);
            for (id, time) in dead {
                self.unbind(&id);
                self.fault(id, SeriesError::NonNumeric { time });
            }
            for id in &bound {
                if let Some(point) = points.remove(id).and_then(|mut points| points.pop()) {
                    self.sink.append_last(id, point);
                }
            }
        }
        let finished: Vec<SourceBar> = self.renderer.touched_bars().cloned().collect();
        debug!(time = self.renderer.time, bars = finished.len(), "bucket closed");
        for bar in finished {
            self.cache.push(bar);
        }
    }

    /// Replay the selected chunks through a throwaway renderer and replace
    /// the relevant series' data wholesale.
    ///
    /// The throwaway renderer's trailing serie state carries into the live
    /// renderer only when the replay ended at the bucket adjacent to real
    /// time; otherwise live state is left untouched.
    fn rebuild_subset(&mut self, subset: Option<&[SerieId]>) {
        let relevant = self.relevant_series(subset);
        if relevant.is_empty() {
            return;
        }

        let bars = self.cache.select(
            self.visible_from,
            self.config.bucket_width_ms,
            RANGE_LOOKBACK_BARS,
        );

        let mut points: FnvHashMap<SerieId, Vec<SeriesPoint>> = FnvHashMap::default();
        let mut dead: Vec<(SerieId, i64)> = Vec::new();

        if let Some(first) = bars.first() {
            let mut replay = Renderer::new(
                first.time,
                self.config.active_sources.iter().cloned().collect(),
            );
            for id in &relevant {
                if let Some(serie) = self.series.get(id) {
                    if let Some(model) = serie.model.as_ref() {
                        replay
                            .series
                            .insert(id.clone(), SerieState::new(model, &serie.definition.options));
                    }
                }
            }

            for bar in &bars {
                if bar.time > replay.time {
                    compute_closed_bucket(
                        &mut replay,
                        &self.series,
                        &relevant,
                        &mut points,
                        &mut dead,
                    );
                    replay.advance(bar.time);
                }
                replay.fold_source_bar(bar);
            }
            compute_closed_bucket(&mut replay, &self.series, &relevant, &mut points, &mut dead);

            if Some(replay.time) == self.cache.high_water() {
                for id in &relevant {
                    if dead.iter().any(|(dead_id, _)| dead_id == id) {
                        continue;
                    }
                    if let Some(state) = replay.series.remove(id) {
                        self.renderer.series.insert(id.clone(), state);
                    }
                }
            }
        }

        for (id, time) in dead {
            self.unbind(&id);
            self.fault(id, SeriesError::NonNumeric { time });
        }
        for id in &relevant {
            if !self.is_bound(id) {
                continue;
            }
            self.sink
                .replace_all(id, points.remove(id).unwrap_or_default());
        }
        info!(series = relevant.len(), bars = bars.len(), "rebuild complete");

        self.guard.clear();
        self.guard.schedule(self.now_ms + REDRAW_GUARD_MS, ());
    }

    /// Bound series in evaluation order: all of them, or an explicit subset
    /// widened to its transitive references.
    fn relevant_series(&self, subset: Option<&[SerieId]>) -> Vec<SerieId> {
        let Some(ids) = subset else {
            return self.bound_series();
        };
        let mut wanted: FnvHashSet<SerieId> = ids.iter().cloned().collect();
        let mut stack: Vec<SerieId> = ids.to_vec();
        while let Some(id) = stack.pop() {
            if let Some(model) = self.series.get(&id).and_then(|serie| serie.model.as_ref()) {
                for reference in &model.references {
                    if wanted.insert(reference.clone()) {
                        stack.push(reference.clone());
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|id| wanted.contains(*id) && self.is_bound(id))
            .cloned()
            .collect()
    }

    fn bound_series(&self) -> Vec<SerieId> {
        self.order
            .iter()
            .filter(|id| self.is_bound(id))
            .cloned()
            .collect()
    }

    /// Clone the compiled model's instruction state into the live renderer.
    /// Broken or disabled series are skipped silently.
    fn bind(&mut self, id: &SerieId) {
        let Some(serie) = self.series.get(id) else {
            return;
        };
        let Some(model) = serie.model.as_ref() else {
            return;
        };
        if !serie.definition.enabled {
            return;
        }
        self.renderer
            .series
            .insert(id.clone(), SerieState::new(model, &serie.definition.options));
    }

    fn unbind(&mut self, id: &SerieId) {
        if self.renderer.series.remove(id).is_some() {
            warn!(%id, "series unbound");
        }
    }

    fn fault(&mut self, serie: SerieId, error: SeriesError) {
        warn!(%serie, %error, "series fault");
        let _ = self.faults.send(SeriesFault::new(serie, error));
    }

    fn reset_renderer(&mut self) {
        self.renderer = Renderer::new(0, self.config.active_sources.iter().cloned().collect());
        for id in self.order.clone() {
            self.bind(&id);
        }
    }

    /// Would registering `id` with these references close a loop?
    fn has_cycle(&self, id: &SerieId, references: &[SerieId]) -> bool {
        let mut stack: Vec<SerieId> = references.to_vec();
        let mut seen: FnvHashSet<SerieId> = FnvHashSet::default();
        while let Some(next) = stack.pop() {
            if &next == id {
                return true;
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(model) = self.series.get(&next).and_then(|serie| serie.model.as_ref()) {
                stack.extend(model.references.iter().cloned());
            }
        }
        false
    }

    /// Recompute the evaluation order so every serie comes after the series
    /// it references. Cycles are rejected before registration; if one slips
    /// through, the remainder keeps registry order.
    fn reorder(&mut self) {
        let ids: Vec<SerieId> = self.series.keys().cloned().collect();
        let mut placed: FnvHashSet<SerieId> = FnvHashSet::default();
        let mut order: Vec<SerieId> = Vec::with_capacity(ids.len());

        while order.len() < ids.len() {
            let before = order.len();
            for id in &ids {
                if placed.contains(id) {
                    continue;
                }
                let ready = match self.series.get(id).and_then(|serie| serie.model.as_ref()) {
                    Some(model) => model.references.iter().all(|reference| {
                        placed.contains(reference) || !self.series.contains_key(reference)
                    }),
                    None => true,
                };
                if ready {
                    placed.insert(id.clone());
                    order.push(id.clone());
                }
            }
            if order.len() == before {
                for id in &ids {
                    if placed.insert(id.clone()) {
                        order.push(id.clone());
                    }
                }
            }
        }
        self.order = order;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, SinkEvent};
    use crate::trade::Side;

    fn config() -> AggregationConfig {
        AggregationConfig::default().with_sources(&["BINANCE", "BYBIT"])
    }

    fn controller() -> (
        AggregationController<RecordingSink>,
        mpsc::UnboundedReceiver<SeriesFault>,
    ) {
        AggregationController::new(config(), RecordingSink::new())
    }

    fn trade(source: &str, price: f64, amount: f64, side: Side, time: i64) -> Trade {
        Trade {
            exchange: SourceId::new(source),
            market: "btcusdt".into(),
            price,
            amount,
            side,
            liquidation: false,
            time,
        }
    }

    fn serie(id: &str, formula: &str) -> SerieDefinition {
        SerieDefinition::new(id, VisualType::Line, formula)
    }

    #[test]
    fn test_stale_trade_dropped() {
        let (mut controller, _faults) = controller();
        controller.queue_trades(vec![
            trade("BINANCE", 100.0, 1.0, Side::Buy, 25_000),
            trade("BINANCE", 90.0, 5.0, Side::Buy, 5_000),
        ]);
        controller.drain(25_000);

        assert_eq!(controller.renderer().time, 20_000);
        assert_eq!(controller.renderer().bar.vbuy, 100.0);
    }

    #[test]
    fn test_empty_batch_ignored() {
        let (mut controller, _faults) = controller();
        controller.queue_trades(Vec::new());
        controller.drain(0);
        assert!(controller.sink().events.is_empty());
        assert!(controller.cache().is_empty());
    }

    #[test]
    fn test_reorder_places_references_first() {
        let (mut controller, _faults) = controller();
        controller.add_serie(serie("base", "vbuy")).unwrap();
        controller.add_serie(serie("mid", "base * 2")).unwrap();
        controller.add_serie(serie("top", "mid + base")).unwrap();

        assert_eq!(
            controller.order,
            vec![
                SerieId::new("base"),
                SerieId::new("mid"),
                SerieId::new("top")
            ]
        );

        // Re-registering a dependency keeps it ahead of its dependents.
        controller.add_serie(serie("base", "vsell")).unwrap();
        let base_at = controller.order.iter().position(|id| id == "base").unwrap();
        let mid_at = controller.order.iter().position(|id| id == "mid").unwrap();
        assert!(base_at < mid_at);
    }

    #[test]
    fn test_cycle_rejected_on_edit() {
        let (mut controller, mut faults) = controller();
        controller.add_serie(serie("a", "vbuy")).unwrap();
        controller.add_serie(serie("b", "a * 2")).unwrap();

        let result = controller.add_serie(serie("a", "b + 1"));
        assert_eq!(
            result,
            Err(SeriesError::CyclicReference("a".to_string()))
        );
        assert!(!controller.is_bound(&SerieId::new("a")));
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.serie, SerieId::new("a"));
    }

    #[test]
    fn test_bucket_width_change_invalidates_cache() {
        let (mut controller, _faults) = controller();
        controller.add_serie(serie("vol", "vbuy + vsell")).unwrap();
        controller.queue_trades(vec![
            trade("BINANCE", 100.0, 1.0, Side::Buy, 0),
            trade("BINANCE", 100.0, 1.0, Side::Buy, 10_000),
        ]);
        controller.drain(10_000);
        assert!(!controller.cache().is_empty());

        controller.set_bucket_width(60_000);
        assert!(controller.cache().is_empty());
        assert_eq!(controller.renderer().time, 0);
        assert!(controller.is_bound(&SerieId::new("vol")));
        let replaced = controller.sink().replaced("vol").unwrap();
        assert!(replaced.is_empty());
    }

    #[test]
    fn test_guard_suppresses_range_changes_until_pumped() {
        let (mut controller, _faults) = controller();
        controller.add_serie(serie("vol", "vbuy + vsell")).unwrap();
        controller.queue_trades(vec![
            trade("BINANCE", 100.0, 1.0, Side::Buy, 0),
            trade("BINANCE", 100.0, 1.0, Side::Buy, 10_000),
        ]);
        controller.drain(10_000);

        controller.rebuild();
        let replaces = |controller: &AggregationController<RecordingSink>| {
            controller
                .sink()
                .events
                .iter()
                .filter(|event| matches!(event, SinkEvent::Replace { .. }))
                .count()
        };
        let after_rebuild = replaces(&controller);

        controller.set_visible_range(0, 100_000);
        assert_eq!(replaces(&controller), after_rebuild);

        // Well past any plausible guard duration.
        controller.drain(60_000);
        controller.set_visible_range(0, 100_000);
        assert!(replaces(&controller) > after_rebuild);
    }
}
