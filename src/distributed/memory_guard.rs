//! Global memory safety valve.
//!
//! Point growth is the one operation that can run a worker out of memory,
//! so before each growth pass every worker contributes its peak reading to
//! an all_gather over the global group. One worker over the threshold
//! latches growth off everywhere, permanently for the rest of the run.
//! Because every rank sees the same gathered vector, every rank flips the
//! latch at the same iteration and the grid never disagrees about whether
//! growth happens.

use crate::distributed::{all_gather_scalars, CommGroup};
use crate::utils::error::Result;
use crate::utils::metrics;
use tracing::warn;

#[derive(Debug)]
pub struct MemoryGuard {
    threshold: f64,
    latched: bool,
}

impl MemoryGuard {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            latched: false,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether growth is still permitted. Once false, always false.
    pub fn growth_allowed(&self) -> bool {
        !self.latched
    }

    /// Gather peak readings over `global` and update the latch.
    ///
    /// Returns [`growth_allowed`](Self::growth_allowed) after the update.
    /// Every member of the group must call this at the same step; the
    /// result is derived from the gathered maximum, so all members return
    /// the same answer.
    pub fn check(&mut self, peak_units: f64, global: &CommGroup) -> Result<bool> {
        let readings = all_gather_scalars(peak_units, global.comm())?;
        let max = readings.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        if !self.latched && max > self.threshold {
            self.latched = true;
            warn!(
                peak = max,
                threshold = self.threshold,
                "peak memory over threshold; disabling point growth for the rest of the run"
            );
        }
        metrics::record_memory(max, self.latched);
        Ok(!self.latched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalComm;
    use std::sync::Arc;
    use std::thread;

    fn single_group() -> CommGroup {
        let comm = LocalComm::new_group_set(1).remove(0);
        CommGroup::new(Arc::new(comm), vec![0])
    }

    #[test]
    fn test_under_threshold_allows_growth() {
        let mut guard = MemoryGuard::new(17.5);
        let group = single_group();
        assert!(guard.check(17.5, &group).unwrap());
        assert!(guard.growth_allowed());
    }

    #[test]
    fn test_latch_is_one_way() {
        let mut guard = MemoryGuard::new(17.5);
        let group = single_group();
        assert!(!guard.check(18.0, &group).unwrap());
        assert!(!guard.growth_allowed());
        // Memory dropping back below the threshold does not re-enable.
        assert!(!guard.check(1.0, &group).unwrap());
        assert!(!guard.growth_allowed());
    }

    #[test]
    fn test_one_hot_worker_latches_everyone() {
        let comms = LocalComm::new_group_set(3);
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let group = CommGroup::new(Arc::new(comm), vec![0, 1, 2]);
                    let mut guard = MemoryGuard::new(17.5);
                    let reading = if rank == 1 { 18.0 } else { 2.0 };
                    guard.check(reading, &group).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap(), "every rank must latch");
        }
    }
}
