//! Workload units and division policies.
//!
//! A view's rendering work is divided at tile granularity: the image is cut
//! into fixed 16×16 pixel blocks, flattened row-major, and each tile is
//! assigned to exactly one model-parallel worker as its compute owner.
//!
//! Two policies exist. `even` hands each worker one contiguous chunk of the
//! flattened tile list and ignores all feedback; it is used for the first
//! iteration of a view and for deterministic evaluation passes. The
//! history-based policy is longest-processing-time list scheduling: derive a
//! per-tile cost from the smoothed per-worker times of the previous
//! assignment, sort tiles by descending cost, and give each tile to the
//! currently least-loaded worker. Per-tile cost varies heavily with content,
//! so an equal tile count can still leave one worker as the straggler; LPT
//! packs against the measured estimate instead of the count.

use serde::{Deserialize, Serialize};

/// Tile width in pixels.
pub const BLOCK_X: u32 = 16;
/// Tile height in pixels.
pub const BLOCK_Y: u32 = 16;

/// The tile decomposition of one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileGrid {
    pub fn for_view(width: u32, height: u32) -> Self {
        Self {
            tiles_x: width.div_ceil(BLOCK_X),
            tiles_y: height.div_ceil(BLOCK_Y),
        }
    }

    pub fn n_units(&self) -> usize {
        (self.tiles_x * self.tiles_y) as usize
    }

    /// Tile coordinates of a flattened unit index.
    pub fn tile_xy(&self, unit: u32) -> (u32, u32) {
        (unit % self.tiles_x, unit / self.tiles_x)
    }
}

/// Which policy produced a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionMode {
    Even,
    HistoryBased,
}

/// An assignment of every workload unit to exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Unit ids per worker, each list ascending
    per_worker: Vec<Vec<u32>>,
}

impl Partition {
    pub fn new(per_worker: Vec<Vec<u32>>) -> Self {
        Self { per_worker }
    }

    pub fn n_workers(&self) -> usize {
        self.per_worker.len()
    }

    pub fn n_units(&self) -> usize {
        self.per_worker.iter().map(|u| u.len()).sum()
    }

    pub fn units_of(&self, worker: usize) -> &[u32] {
        &self.per_worker[worker]
    }

    pub fn unit_counts(&self) -> Vec<usize> {
        self.per_worker.iter().map(|u| u.len()).collect()
    }

    pub fn worker_of(&self, unit: u32) -> Option<usize> {
        self.per_worker
            .iter()
            .position(|units| units.binary_search(&unit).is_ok())
    }
}

/// Division policy over a view's tile units.
#[derive(Debug, Clone, Copy)]
pub struct DivisionPolicy {
    epsilon: f64,
}

impl DivisionPolicy {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// Contiguous even chunks; the first `n mod k` workers get one extra unit.
    pub fn even(&self, n_units: usize, n_workers: usize) -> Partition {
        let base = n_units / n_workers;
        let rem = n_units % n_workers;
        let per_worker = (0..n_workers)
            .map(|w| {
                let start = w * base + w.min(rem);
                let len = base + usize::from(w < rem);
                (start as u32..(start + len) as u32).collect()
            })
            .collect();
        Partition::new(per_worker)
    }

    /// LPT over per-unit costs derived from the previous round's feedback.
    ///
    /// A worker's smoothed time is spread evenly over the units it computed
    /// last time; zero or missing reports clamp to epsilon so a worker that
    /// touched nothing cannot zero out its units.
    pub fn history_based(
        &self,
        smoothed: &[f64],
        previous: &Partition,
        n_units: usize,
    ) -> Partition {
        let costs = self.unit_costs(smoothed, previous, n_units);
        self.lpt(&costs, smoothed.len())
    }

    fn unit_costs(&self, smoothed: &[f64], previous: &Partition, n_units: usize) -> Vec<f64> {
        let mut costs = vec![1.0f64; n_units];
        if previous.n_units() != n_units || previous.n_workers() != smoothed.len() {
            // Resolution or worker count changed under us; start from uniform.
            return costs;
        }
        for (worker, &time) in smoothed.iter().enumerate() {
            let units = previous.units_of(worker);
            if units.is_empty() {
                continue;
            }
            let per_unit = time.max(self.epsilon) / units.len() as f64;
            for &u in units {
                costs[u as usize] = per_unit;
            }
        }
        costs
    }

    /// Longest-processing-time list scheduling.
    ///
    /// Ties break toward the lower unit index and the lower worker index, so
    /// the result is identical on every worker given identical inputs.
    fn lpt(&self, costs: &[f64], n_workers: usize) -> Partition {
        let mut order: Vec<u32> = (0..costs.len() as u32).collect();
        order.sort_by(|&a, &b| {
            costs[b as usize]
                .partial_cmp(&costs[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let mut loads = vec![0.0f64; n_workers];
        let mut per_worker: Vec<Vec<u32>> = vec![Vec::new(); n_workers];
        for unit in order {
            let mut lightest = 0usize;
            for w in 1..n_workers {
                if loads[w] < loads[lightest] {
                    lightest = w;
                }
            }
            loads[lightest] += costs[unit as usize].max(self.epsilon);
            per_worker[lightest].push(unit);
        }

        for units in &mut per_worker {
            units.sort_unstable();
        }
        Partition::new(per_worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DivisionPolicy {
        DivisionPolicy::new(1e-6)
    }

    #[test]
    fn test_tile_grid_rounds_up() {
        let grid = TileGrid::for_view(512, 288);
        assert_eq!(grid.tiles_x, 32);
        assert_eq!(grid.tiles_y, 18);
        assert_eq!(grid.n_units(), 576);

        let grid = TileGrid::for_view(17, 16);
        assert_eq!((grid.tiles_x, grid.tiles_y), (2, 1));
        assert_eq!(grid.tile_xy(1), (1, 0));
    }

    #[test]
    fn test_even_partition_contiguous() {
        let p = policy().even(10, 3);
        assert_eq!(p.units_of(0), &[0, 1, 2, 3]);
        assert_eq!(p.units_of(1), &[4, 5, 6]);
        assert_eq!(p.units_of(2), &[7, 8, 9]);
        assert_eq!(p.n_units(), 10);
    }

    #[test]
    fn test_even_partition_remainder_to_first_workers() {
        let p = policy().even(11, 4);
        assert_eq!(p.unit_counts(), vec![3, 3, 3, 2]);

        // Fewer units than workers leaves trailing workers empty.
        let p = policy().even(2, 4);
        assert_eq!(p.unit_counts(), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_every_unit_assigned_once() {
        let p = policy().even(7, 3);
        for unit in 0..7u32 {
            assert!(p.worker_of(unit).is_some());
        }
        assert_eq!(p.worker_of(7), None);
    }

    #[test]
    fn test_lpt_balances_skewed_costs() {
        // Worker 0 was 4x slower over the same unit count, so its previous
        // units carry 4x the cost and must spread across both workers.
        let prev = policy().even(8, 2);
        let smoothed = vec![4.0, 1.0];
        let p = policy().history_based(&smoothed, &prev, 8);

        assert_eq!(p.n_units(), 8);
        let cost_of = |w: usize| -> f64 {
            p.units_of(w)
                .iter()
                .map(|&u| if u < 4 { 1.0 } else { 0.25 })
                .sum()
        };
        let (c0, c1) = (cost_of(0), cost_of(1));
        assert!((c0 - c1).abs() < 0.6, "loads {} vs {}", c0, c1);
        // The naive even split would have been 4.0 vs 1.0.
        assert!(c0.max(c1) < 3.0);
    }

    #[test]
    fn test_lpt_deterministic() {
        let prev = policy().even(16, 4);
        let smoothed = vec![1.0, 2.0, 3.0, 4.0];
        let a = policy().history_based(&smoothed, &prev, 16);
        let b = policy().history_based(&smoothed, &prev, 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_time_clamped() {
        let prev = policy().even(4, 2);
        let smoothed = vec![0.0, 1.0];
        let p = policy().history_based(&smoothed, &prev, 4);
        // The zero report clamps to epsilon instead of producing NaN costs;
        // every unit is still assigned exactly once.
        assert_eq!(p.n_units(), 4);
        for unit in 0..4u32 {
            assert!(p.worker_of(unit).is_some());
        }
    }

    #[test]
    fn test_unit_count_change_falls_back_to_uniform() {
        let prev = policy().even(8, 2);
        let p = policy().history_based(&[5.0, 1.0], &prev, 6);
        assert_eq!(p.n_units(), 6);
        let counts = p.unit_counts();
        assert_eq!(counts.iter().sum::<usize>(), 6);
        assert!((counts[0] as i64 - counts[1] as i64).abs() <= 1);
    }
}
