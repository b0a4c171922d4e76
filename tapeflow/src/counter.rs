//! Decaying live sum over a trailing time window.
//!
//! The window of duration `W` is subdivided into granularity slots of `G`
//! milliseconds. Updates accumulate into the current slot; a closed slot is
//! scheduled to expire `W` after it opened, so the sum decays even when
//! updates stop arriving. Expiries fire from [`SlidingCounter::poll`], which
//! the owner pumps on its drain cadence.

use crate::sched::TimerQueue;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Slot {
    start: i64,
    value: f64,
}

/// A sliding-window counter over projected snapshot values.
///
/// The projection is supplied at construction so call sites fold whole
/// snapshots without repeating extraction logic.
#[derive(Debug)]
pub struct SlidingCounter<T> {
    project: fn(&T) -> f64,
    window_ms: i64,
    granularity_ms: i64,
    /// Closed slots awaiting expiry, oldest first.
    slots: VecDeque<Slot>,
    current: Option<Slot>,
    live_sum: f64,
    /// Set once the first expiry fires, meaning the window is fully
    /// populated and interpolation may activate.
    filled: bool,
    expiries: TimerQueue<i64>,
}

impl<T> SlidingCounter<T> {
    /// Create a counter over `window_ms`, subdivided into `granularity_ms`
    /// slots. Granularity is clamped to the window.
    pub fn new(window_ms: i64, granularity_ms: i64, project: fn(&T) -> f64) -> Self {
        Self {
            project,
            window_ms,
            granularity_ms: granularity_ms.min(window_ms).max(1),
            slots: VecDeque::new(),
            current: None,
            live_sum: 0.0,
            filled: false,
            expiries: TimerQueue::new(),
        }
    }

    /// Fold a new snapshot into the window.
    pub fn on_update(&mut self, now_ms: i64, snapshot: &T) {
        let value = (self.project)(snapshot);
        let slot_start = (now_ms / self.granularity_ms) * self.granularity_ms;

        match self.current {
            Some(ref mut slot) if slot.start == slot_start => {
                slot.value += value;
            }
            Some(slot) => {
                self.slots.push_back(slot);
                self.expiries.schedule(slot.start + self.window_ms, slot.start);
                self.current = Some(Slot {
                    start: slot_start,
                    value,
                });
            }
            None => {
                self.current = Some(Slot {
                    start: slot_start,
                    value,
                });
            }
        }
        self.live_sum += value;
    }

    /// Fire any slot expiries that are due. Each fires exactly once,
    /// independent of whether updates are still arriving.
    pub fn poll(&mut self, now_ms: i64) {
        while let Some(slot_start) = self.expiries.pop_due(now_ms) {
            self.filled = true;
            if let Some(position) = self.slots.iter().position(|slot| slot.start == slot_start) {
                let slot = self.slots.remove(position).unwrap();
                self.live_sum -= slot.value;
                debug!(slot_start, value = slot.value, "counter slot expired");
            }
        }
        // The current slot also ages out when updates stop entirely.
        if let Some(slot) = self.current {
            if now_ms >= slot.start + self.window_ms {
                self.live_sum -= slot.value;
                self.current = None;
                self.filled = true;
            }
        }
    }

    /// Live sum of all non-evicted slots.
    ///
    /// Once the window has been fully populated, the oldest surviving slot's
    /// contribution fades linearly over its final granularity span so its
    /// eviction causes no visible step-down. Before that, the raw sum is
    /// returned.
    pub fn value(&self, now_ms: i64) -> f64 {
        if !self.filled {
            return self.live_sum;
        }
        let Some(oldest) = self.slots.front() else {
            return self.live_sum;
        };
        let due = oldest.start + self.window_ms;
        let fade_start = due - self.granularity_ms;
        let fraction = ((now_ms - fade_start) as f64 / self.granularity_ms as f64).clamp(0.0, 1.0);
        self.live_sum - oldest.value * fraction
    }

    /// Discard all slots and cancel pending expiries. Safe from any state.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.current = None;
        self.live_sum = 0.0;
        self.filled = false;
        self.expiries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_counter(window_ms: i64, granularity_ms: i64) -> SlidingCounter<f64> {
        SlidingCounter::new(window_ms, granularity_ms, |value| *value)
    }

    #[test]
    fn test_raw_sum_before_filled() {
        let mut counter = identity_counter(10_000, 2_000);
        counter.on_update(0, &1.0);
        counter.on_update(500, &2.0);
        counter.on_update(2_100, &3.0);

        assert_eq!(counter.value(2_100), 6.0);
    }

    #[test]
    fn test_decays_to_zero_after_window() {
        let mut counter = identity_counter(10_000, 2_000);
        // Constant rate for one full window: one update per granularity slot
        for slot in 0..5 {
            counter.on_update(slot * 2_000, &1.0);
        }
        counter.poll(9_999);
        assert!(counter.value(9_999) > 0.0);

        // One full window with no updates: everything must expire
        counter.poll(20_000);
        assert_eq!(counter.value(20_000), 0.0);
    }

    #[test]
    fn test_expiry_fires_without_further_updates() {
        let mut counter = identity_counter(10_000, 2_000);
        counter.on_update(0, &4.0);
        counter.on_update(2_000, &1.0); // closes slot 0, schedules its expiry at 10_000

        counter.poll(9_999);
        assert_eq!(counter.value(9_999), 5.0);

        counter.poll(10_000);
        // Slot 0 evicted; the remaining slot is now oldest and starts fading
        // only inside its own final granularity span.
        assert_eq!(counter.value(10_000), 1.0);
    }

    #[test]
    fn test_eviction_boundary_has_no_step() {
        let mut counter = identity_counter(10_000, 2_000);
        for slot in 0..6 {
            counter.on_update(slot * 2_000, &2.0);
        }
        counter.poll(10_000); // slot 0 expires, filled = true

        // Oldest surviving slot opened at 2_000, expires at 12_000, fades
        // linearly from 10_000.
        assert_eq!(counter.value(10_000), 10.0);
        assert_eq!(counter.value(11_000), 9.0);
        let before = counter.value(11_999);
        counter.poll(12_000);
        let after = counter.value(12_000);
        assert!((before - after).abs() < 0.01);
    }

    #[test]
    fn test_clear_from_any_state() {
        let mut counter = identity_counter(10_000, 2_000);
        counter.clear();
        assert_eq!(counter.value(0), 0.0);

        counter.on_update(0, &1.0);
        counter.on_update(2_000, &1.0);
        counter.clear();
        assert_eq!(counter.value(2_000), 0.0);

        // Cancelled expiries must not fire later
        counter.poll(50_000);
        assert_eq!(counter.value(50_000), 0.0);
    }

    #[test]
    fn test_projection_applies() {
        struct Snapshot {
            amount: f64,
        }
        let mut counter: SlidingCounter<Snapshot> =
            SlidingCounter::new(10_000, 2_000, |snapshot| snapshot.amount * 2.0);
        counter.on_update(0, &Snapshot { amount: 3.0 });
        assert_eq!(counter.value(0), 6.0);
    }
}
