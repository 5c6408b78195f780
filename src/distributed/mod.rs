//! Distributed coordination infrastructure.
//!
//! Workers form a 2-D grid (data-parallel rows × model-parallel columns) and
//! communicate only through blocking collectives. Calls are matched by order,
//! not tags: the Nth collective issued by each member of a group must be the
//! same logical step on every member, so any branch that gates a collective
//! must be decided from values all members already agree on (iteration
//! counter, static configuration, or an earlier reduced result).

use candle_core::{Device, Tensor};

use crate::utils::error::{Result, SplatGridError};
use std::sync::Arc;

/// Blocking collective contract shared by all backends.
///
/// Implementations include:
/// - `LocalComm`: in-process thread rendezvous, used by tests and the
///   single-process launcher
///
/// Every operation suspends the caller until all group members have issued
/// the matching call, and requires identical shape/dtype across members.
pub trait Collective: Send + Sync {
    /// Rank of this worker within the group
    fn rank(&self) -> usize;

    /// Number of workers in the group
    fn world_size(&self) -> usize;

    /// Sum the tensor across all members; every member receives the total.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Gather tensors from all members, concatenated along dim 0 in rank order.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Send the root member's tensor to every member.
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor>;

    /// Block until every member has arrived.
    fn barrier(&self) -> Result<()> {
        let probe = Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu)?;
        self.all_reduce(&probe)?;
        Ok(())
    }

    /// Point-to-point send to another member of this group.
    fn send(&self, tensor: &Tensor, dst: usize) -> Result<()> {
        let _ = (tensor, dst);
        Err(SplatGridError::Collective(
            "send not implemented for this backend".to_string(),
        ))
    }

    /// Point-to-point receive from another member of this group.
    ///
    /// Messages from one sender arrive in send order.
    fn recv(&self, src: usize) -> Result<Tensor> {
        let _ = src;
        Err(SplatGridError::Collective(
            "recv not implemented for this backend".to_string(),
        ))
    }

    /// Create a scoped subgroup from ranks of this group.
    ///
    /// Every listed member must call this with the identical rank list; the
    /// returned handle numbers members by their position in the list.
    fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn Collective>>;
}

pub mod backend;
pub mod grad_sync;
pub mod groups;
pub mod memory_guard;

// Re-export commonly used items
pub use backend::LocalComm;
pub use grad_sync::GradientSyncEngine;
pub use groups::{CommGroup, GridShape, WorkerContext};
pub use memory_guard::MemoryGuard;

/// Mean-reduce a scalar across the group.
pub fn all_reduce_scalar(value: f64, comm: &dyn Collective) -> Result<f64> {
    if comm.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value as f32], &Device::Cpu)?;
    let reduced = comm.all_reduce(&tensor)?;
    let result = reduced.to_vec1::<f32>()?[0] as f64;
    Ok(result / comm.world_size() as f64)
}

/// Sum one scalar per rank across the group, no averaging.
pub fn all_reduce_scalar_sum(value: f64, comm: &dyn Collective) -> Result<f64> {
    if comm.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value as f32], &Device::Cpu)?;
    let reduced = comm.all_reduce(&tensor)?;
    Ok(reduced.to_vec1::<f32>()?[0] as f64)
}

/// Exchange one integer count per rank, in rank order.
///
/// Counts ride as i64 so they stay exact; the f32 scalar helpers are not
/// safe for bookkeeping that conservation checks depend on.
pub fn all_gather_counts(count: usize, comm: &dyn Collective) -> Result<Vec<usize>> {
    if comm.world_size() == 1 {
        return Ok(vec![count]);
    }

    let tensor = Tensor::new(&[count as i64], &Device::Cpu)?;
    let gathered = comm.all_gather(&tensor)?;
    gathered
        .to_vec1::<i64>()?
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| {
                SplatGridError::Collective(format!("gathered count {} is not a valid size", v))
            })
        })
        .collect()
}

/// Gather one scalar per member, ordered by group rank.
///
/// Used for per-worker render times and peak-memory readings, where every
/// member needs the full per-rank vector rather than a reduction.
pub fn all_gather_scalars(value: f64, comm: &dyn Collective) -> Result<Vec<f64>> {
    if comm.world_size() == 1 {
        return Ok(vec![value]);
    }

    let tensor = Tensor::new(&[value as f32], &Device::Cpu)?;
    let gathered = comm.all_gather(&tensor)?;
    Ok(gathered
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| v as f64)
        .collect())
}
