//! Per-view strategy lifecycle and timing history.
//!
//! Each (view, iteration) pair gets one `Strategy`: the division of that
//! view's tiles across the model-parallel group. A strategy moves through
//! `created → started → measured → finished`; only a measured strategy may
//! be folded back into the history, and folding is what advances the
//! smoothed per-worker estimates that drive the next division.

use crate::strategy::division::{DivisionMode, DivisionPolicy, Partition, TileGrid};
use crate::utils::config::StrategyConfig;
use crate::utils::error::{Result, SplatGridError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

/// Lifecycle of one division decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Created,
    Started,
    Measured,
    Finished,
}

/// The active division decision for one (view, iteration) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    view_id: u64,
    iteration: u64,
    mode: DivisionMode,
    partition: Partition,
    state: StrategyState,
    /// One elapsed time per model-parallel rank, present once measured
    times: Option<Vec<f64>>,
}

impl Strategy {
    fn new(view_id: u64, iteration: u64, mode: DivisionMode, partition: Partition) -> Self {
        Self {
            view_id,
            iteration,
            mode,
            partition,
            state: StrategyState::Created,
            times: None,
        }
    }

    fn start(mut self) -> Self {
        self.state = StrategyState::Started;
        self
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn mode(&self) -> DivisionMode {
        self.mode
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Units this worker computes, by its model-parallel rank.
    pub fn local_units(&self, mp_rank: usize) -> &[u32] {
        self.partition.units_of(mp_rank)
    }

    pub fn times(&self) -> Option<&[f64]> {
        self.times.as_deref()
    }

    /// Record the measured per-worker times for this strategy.
    ///
    /// Requires exactly one finite, non-negative value per model-parallel
    /// rank, and may only be called once on a started strategy.
    pub fn update_stats(&mut self, times: &[f64]) -> Result<()> {
        if self.state != StrategyState::Started {
            return Err(SplatGridError::Strategy(format!(
                "update_stats in state {:?}, expected Started",
                self.state
            )));
        }
        if times.len() != self.partition.n_workers() {
            return Err(SplatGridError::Strategy(format!(
                "expected {} per-worker times, got {}",
                self.partition.n_workers(),
                times.len()
            )));
        }
        if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(SplatGridError::Strategy(
                "per-worker times must be finite and non-negative".to_string(),
            ));
        }

        self.times = Some(times.to_vec());
        self.state = StrategyState::Measured;
        Ok(())
    }
}

/// History of one view: finished strategies plus the smoothed estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ViewHistory {
    /// Finished strategies, oldest first, bounded by the window
    records: VecDeque<Strategy>,
    /// Smoothed per-worker times; empty until the first strategy finishes
    smoothed: Vec<f64>,
    /// Partition of the most recently finished strategy
    last_partition: Option<Partition>,
}

/// Timing feedback accumulator for every view this worker renders.
///
/// Keyed by view id; drives the division policy with exponentially smoothed
/// per-worker estimates (`new = α·measured + (1-α)·old`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyHistory {
    n_workers: usize,
    alpha: f64,
    window: usize,
    epsilon: f64,
    adaptive: bool,
    views: BTreeMap<u64, ViewHistory>,
}

impl StrategyHistory {
    /// History for a model-parallel group of `n_workers`.
    pub fn new(n_workers: usize, config: &StrategyConfig) -> Self {
        Self {
            n_workers,
            alpha: config.alpha,
            window: config.history_window,
            epsilon: config.epsilon,
            adaptive: config.adaptive,
            views: BTreeMap::new(),
        }
    }

    fn policy(&self) -> DivisionPolicy {
        DivisionPolicy::new(self.epsilon)
    }

    /// Derive the next strategy for a view.
    ///
    /// A view with no finished history (or an adaptive policy turned off)
    /// gets the even split; otherwise the smoothed estimates feed the
    /// history-based policy.
    pub fn start_strategy(&mut self, view_id: u64, tiles: TileGrid, iteration: u64) -> Strategy {
        let n_units = tiles.n_units();
        let policy = self.policy();

        let feedback = if self.adaptive {
            self.views.get(&view_id).and_then(|vh| {
                vh.last_partition
                    .as_ref()
                    .filter(|_| !vh.smoothed.is_empty())
                    .map(|prev| (vh.smoothed.clone(), prev.clone()))
            })
        } else {
            None
        };

        let (mode, partition) = match feedback {
            Some((smoothed, prev)) => (
                DivisionMode::HistoryBased,
                policy.history_based(&smoothed, &prev, n_units),
            ),
            None => (DivisionMode::Even, policy.even(n_units, self.n_workers)),
        };

        Strategy::new(view_id, iteration, mode, partition).start()
    }

    /// An even strategy that leaves history untouched, for evaluation passes.
    pub fn even_strategy(&self, view_id: u64, tiles: TileGrid, iteration: u64) -> Strategy {
        let partition = self.policy().even(tiles.n_units(), self.n_workers);
        Strategy::new(view_id, iteration, DivisionMode::Even, partition).start()
    }

    /// Fold a measured strategy into the view's bounded window and advance
    /// the smoothed estimates.
    ///
    /// Finishing an unmeasured strategy is a caller contract violation: it
    /// is logged, the history stays untouched, and `false` is returned so
    /// the caller can tell the fold did not happen.
    pub fn finish_strategy(&mut self, strategy: &mut Strategy) -> bool {
        if strategy.state != StrategyState::Measured {
            warn!(
                view_id = strategy.view_id,
                iteration = strategy.iteration,
                state = ?strategy.state,
                "finish_strategy called before update_stats; ignoring"
            );
            return false;
        }

        strategy.state = StrategyState::Finished;
        let times = strategy
            .times
            .clone()
            .unwrap_or_else(|| vec![0.0; self.n_workers]);

        let vh = self.views.entry(strategy.view_id).or_default();
        if vh.smoothed.is_empty() {
            vh.smoothed = times;
        } else {
            for (old, new) in vh.smoothed.iter_mut().zip(times.iter()) {
                *old = self.alpha * new + (1.0 - self.alpha) * *old;
            }
        }
        vh.last_partition = Some(strategy.partition.clone());

        vh.records.push_back(strategy.clone());
        while vh.records.len() > self.window {
            vh.records.pop_front();
        }

        true
    }

    /// Smoothed per-worker estimates for a view, if any strategy finished.
    pub fn smoothed(&self, view_id: u64) -> Option<&[f64]> {
        self.views
            .get(&view_id)
            .filter(|vh| !vh.smoothed.is_empty())
            .map(|vh| vh.smoothed.as_slice())
    }

    /// Number of views with recorded history.
    pub fn n_views(&self) -> usize {
        self.views.len()
    }

    /// Finished records currently retained for a view.
    pub fn n_records(&self, view_id: u64) -> usize {
        self.views.get(&view_id).map_or(0, |vh| vh.records.len())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n_workers: usize) -> StrategyHistory {
        StrategyHistory::new(n_workers, &StrategyConfig::default())
    }

    fn tiles() -> TileGrid {
        TileGrid::for_view(64, 64) // 16 units
    }

    #[test]
    fn test_first_call_is_even_split() {
        let mut h = history(2);
        let s = h.start_strategy(7, tiles(), 0);
        assert_eq!(s.state(), StrategyState::Started);
        assert_eq!(s.mode(), DivisionMode::Even);
        assert_eq!(s.partition().unit_counts(), vec![8, 8]);
        assert_eq!(s.local_units(0), (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut h = history(2);
        let mut s = h.start_strategy(1, tiles(), 0);

        s.update_stats(&[1.0, 3.0]).unwrap();
        assert_eq!(s.state(), StrategyState::Measured);
        assert_eq!(s.times(), Some(&[1.0, 3.0][..]));

        assert!(h.finish_strategy(&mut s));
        assert_eq!(s.state(), StrategyState::Finished);
        assert_eq!(h.smoothed(1), Some(&[1.0, 3.0][..]));
        assert_eq!(h.n_records(1), 1);
    }

    #[test]
    fn test_update_stats_requires_one_time_per_worker() {
        let mut h = history(3);
        let mut s = h.start_strategy(1, tiles(), 0);
        assert!(s.update_stats(&[1.0, 2.0]).is_err());
        assert!(s.update_stats(&[1.0, f64::NAN, 2.0]).is_err());
        assert!(s.update_stats(&[1.0, 2.0, 3.0]).is_ok());
        // Second measurement of the same strategy is rejected.
        assert!(s.update_stats(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_finish_without_measure_is_noop() {
        let mut h = history(2);
        let mut s = h.start_strategy(1, tiles(), 0);
        s.update_stats(&[2.0, 2.0]).unwrap();
        h.finish_strategy(&mut s);
        let before = h.to_json().unwrap();

        let mut unmeasured = h.start_strategy(1, tiles(), 1);
        assert!(!h.finish_strategy(&mut unmeasured));
        assert_eq!(unmeasured.state(), StrategyState::Started);

        let after = h.to_json().unwrap();
        assert_eq!(before, after, "history must be bit-for-bit unchanged");
    }

    #[test]
    fn test_smoothing_update() {
        let mut h = history(2);

        let mut s = h.start_strategy(1, tiles(), 0);
        s.update_stats(&[1.0, 2.0]).unwrap();
        h.finish_strategy(&mut s);
        assert_eq!(h.smoothed(1), Some(&[1.0, 2.0][..]));

        let mut s = h.start_strategy(1, tiles(), 1);
        s.update_stats(&[2.0, 1.0]).unwrap();
        h.finish_strategy(&mut s);

        // new = 0.2 * measured + 0.8 * old
        let sm = h.smoothed(1).unwrap();
        assert!((sm[0] - (0.2 * 2.0 + 0.8 * 1.0)).abs() < 1e-12);
        assert!((sm[1] - (0.2 * 1.0 + 0.8 * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_second_strategy_uses_feedback() {
        let mut h = history(2);
        let mut s = h.start_strategy(1, tiles(), 0);
        s.update_stats(&[4.0, 1.0]).unwrap();
        h.finish_strategy(&mut s);

        let next = h.start_strategy(1, tiles(), 1);
        assert_eq!(next.mode(), DivisionMode::HistoryBased);
        // LPT balances estimated load, so half of the slow worker's expensive
        // tiles (units 0..8, 0.5 each) move over to the fast worker.
        let moved = next
            .local_units(1)
            .iter()
            .filter(|&&u| u < 8)
            .count();
        assert_eq!(moved, 4);
        let load = |w: usize| -> f64 {
            next.local_units(w)
                .iter()
                .map(|&u| if u < 8 { 0.5 } else { 0.125 })
                .sum()
        };
        assert!((load(0) - load(1)).abs() < 0.51, "loads {} {}", load(0), load(1));
    }

    #[test]
    fn test_adaptive_off_stays_even() {
        let config = StrategyConfig {
            adaptive: false,
            ..StrategyConfig::default()
        };
        let mut h = StrategyHistory::new(2, &config);
        let mut s = h.start_strategy(1, tiles(), 0);
        s.update_stats(&[9.0, 1.0]).unwrap();
        h.finish_strategy(&mut s);

        assert_eq!(h.start_strategy(1, tiles(), 1).mode(), DivisionMode::Even);
    }

    #[test]
    fn test_window_bound() {
        let config = StrategyConfig {
            history_window: 2,
            ..StrategyConfig::default()
        };
        let mut h = StrategyHistory::new(2, &config);
        for i in 0..5 {
            let mut s = h.start_strategy(1, tiles(), i);
            s.update_stats(&[1.0, 1.0]).unwrap();
            h.finish_strategy(&mut s);
        }
        assert_eq!(h.n_records(1), 2);
    }

    #[test]
    fn test_even_strategy_does_not_touch_history() {
        let h = history(2);
        let before = h.to_json().unwrap();
        let s = h.even_strategy(42, tiles(), 10);
        assert_eq!(s.mode(), DivisionMode::Even);
        assert_eq!(h.to_json().unwrap(), before);
    }

    #[test]
    fn test_serde_round_trip_preserves_decisions() {
        let mut h = history(2);
        for i in 0..3 {
            let mut s = h.start_strategy(1, tiles(), i);
            s.update_stats(&[1.0 + i as f64, 3.0 - i as f64]).unwrap();
            h.finish_strategy(&mut s);
        }

        let json = h.to_json().unwrap();
        let mut reloaded = StrategyHistory::from_json(&json).unwrap();

        assert_eq!(reloaded.smoothed(1), h.smoothed(1));
        let a = h.start_strategy(1, tiles(), 99);
        let b = reloaded.start_strategy(1, tiles(), 99);
        assert_eq!(a, b, "reloaded history must reproduce the next decision");
    }
}
