//! Ownership rebalancing across the global group.
//!
//! Growth and pruning happen locally, so worker slices drift apart over
//! time. On a cadence counted in growth events, every worker gathers all
//! slice counts, derives the same transfer plan from them, and plays its
//! part in that plan with paired point-to-point transfers. Optimizer state
//! always travels inside the transfer records, and a second count gather
//! verifies exact conservation before the call returns.

use crate::distributed::{all_gather_counts, CommGroup};
use crate::scene::points::PointStore;
use crate::utils::error::{Result, SplatGridError};
use crate::utils::metrics;
use candle_core::Device;
use tracing::{debug, info};

/// One leg of a transfer plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: usize,
    pub to: usize,
    pub count: usize,
}

/// Target count for `rank` when `total` points spread over `n` workers,
/// remainder to the first workers.
pub fn target_count(total: usize, n: usize, rank: usize) -> usize {
    total / n + usize::from(rank < total % n)
}

/// Derive the transfer plan every rank computes identically.
///
/// Counts already within one point of their target on every worker yield
/// an empty plan. Otherwise donors (above target, ascending rank) ship
/// their surplus to receivers (below target, ascending rank) until every
/// count equals its target exactly.
pub fn plan_moves(counts: &[usize]) -> Vec<Move> {
    let n = counts.len();
    if n == 0 {
        return Vec::new();
    }
    let total: usize = counts.iter().sum();
    let balanced = counts
        .iter()
        .enumerate()
        .all(|(r, &c)| c.abs_diff(target_count(total, n, r)) <= 1);
    if balanced {
        return Vec::new();
    }

    let mut surplus: Vec<(usize, usize)> = Vec::new();
    let mut deficit: Vec<(usize, usize)> = Vec::new();
    for (r, &c) in counts.iter().enumerate() {
        let t = target_count(total, n, r);
        if c > t {
            surplus.push((r, c - t));
        } else if c < t {
            deficit.push((r, t - c));
        }
    }

    let mut moves = Vec::new();
    let mut di = 0;
    for (from, mut extra) in surplus {
        while extra > 0 && di < deficit.len() {
            let (to, need) = deficit[di];
            let count = extra.min(need);
            moves.push(Move { from, to, count });
            extra -= count;
            if need == count {
                di += 1;
            } else {
                deficit[di].1 -= count;
            }
        }
    }
    moves
}

/// Cadence bookkeeping plus the collective rebalancing step.
#[derive(Debug)]
pub struct RedistributionController {
    frequency: usize,
    enabled: bool,
    growth_events: usize,
}

impl RedistributionController {
    pub fn new(frequency: usize, enabled: bool) -> Self {
        Self {
            frequency,
            enabled,
            growth_events: 0,
        }
    }

    /// Count one executed growth pass. Returns true when this event lands
    /// on the redistribution cadence.
    ///
    /// The count advances only for passes every worker actually executed,
    /// so the return value is an agreed signal the whole grid can branch on.
    pub fn on_growth_event(&mut self) -> bool {
        self.growth_events += 1;
        self.enabled && self.frequency > 0 && self.growth_events % self.frequency == 0
    }

    pub fn growth_events(&self) -> usize {
        self.growth_events
    }

    /// Rebalance ownership over `global`. Returns the number of points that
    /// changed owner, summed over the whole grid.
    ///
    /// Donors surrender their highest ids, so the plan's selection is
    /// deterministic given identical pre-state. Every rank runs the same
    /// plan; ranks a move does not name stay silent, which is safe because
    /// transfers are point-to-point, not collectives.
    pub fn redistribute(
        &self,
        store: &mut PointStore,
        global: &CommGroup,
        device: &Device,
    ) -> Result<usize> {
        let rank = global.rank();
        let counts = all_gather_counts(store.n_owned(), global.comm())?;
        let total_before: usize = counts.iter().sum();
        let moves = plan_moves(&counts);
        if moves.is_empty() {
            debug!(?counts, "ownership already balanced");
            return Ok(0);
        }

        for mv in &moves {
            if mv.from == rank {
                let ids = store.highest_ids(mv.count);
                if ids.len() != mv.count {
                    return Err(SplatGridError::Redistribution(format!(
                        "planned to send {} points but only {} owned",
                        mv.count,
                        ids.len()
                    )));
                }
                let (ids_t, payload) = store.pack_transfer(&ids, device)?;
                global.send(&ids_t, mv.to)?;
                global.send(&payload, mv.to)?;
                store.remove_ids(&ids)?;
            } else if mv.to == rank {
                let ids_t = global.recv(mv.from)?;
                let payload = global.recv(mv.from)?;
                store.insert_transfer(&ids_t, &payload)?;
            }
        }

        let counts_after = all_gather_counts(store.n_owned(), global.comm())?;
        let total_after: usize = counts_after.iter().sum();
        if total_after != total_before {
            return Err(SplatGridError::Redistribution(format!(
                "point count changed during redistribution: {} -> {}",
                total_before, total_after
            )));
        }
        for (r, &c) in counts_after.iter().enumerate() {
            let t = target_count(total_before, counts_after.len(), r);
            if c != t {
                return Err(SplatGridError::Redistribution(format!(
                    "rank {} holds {} points after redistribution, target {}",
                    r, c, t
                )));
            }
        }

        let moved: usize = moves.iter().map(|m| m.count).sum();
        metrics::record_redistribution(moved);
        info!(moved, ?counts, after = ?counts_after, "redistributed point ownership");
        Ok(moved)
    }
}
