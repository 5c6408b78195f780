//! Worker-grid process groups.
//!
//! Ranks form a 2-D grid: data-parallel rows × model-parallel columns, plus
//! node-local blocks. Membership comes from one deterministic formula so that
//! every worker derives identical group composition with no negotiation:
//! collective correctness depends on it.

use super::backend::LocalComm;
use super::Collective;
use crate::utils::config::GridConfig;
use crate::utils::error::{Result, SplatGridError};
use candle_core::{Device, Tensor};
use std::sync::Arc;
use tracing::info;

/// Shape of the worker grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub world_size: usize,
    pub mp_size: usize,
    pub gpus_per_node: usize,
}

impl GridShape {
    pub fn new(world_size: usize, mp_size: usize, gpus_per_node: usize) -> Result<Self> {
        if world_size == 0 || mp_size == 0 || gpus_per_node == 0 {
            return Err(SplatGridError::Config(
                "grid dimensions must be at least 1".to_string(),
            ));
        }
        if world_size % mp_size != 0 {
            return Err(SplatGridError::Config(format!(
                "world_size({}) must be divisible by mp_size({})",
                world_size, mp_size
            )));
        }
        Ok(Self {
            world_size,
            mp_size,
            gpus_per_node,
        })
    }

    pub fn from_config(config: &GridConfig) -> Result<Self> {
        Self::new(config.world_size, config.mp_size, config.gpus_per_node)
    }

    pub fn single_worker() -> Self {
        Self {
            world_size: 1,
            mp_size: 1,
            gpus_per_node: 1,
        }
    }

    /// Number of data-parallel rows.
    pub fn dp_size(&self) -> usize {
        self.world_size / self.mp_size
    }

    /// Row of a rank: which data-parallel group it renders for.
    pub fn dp_index(&self, rank: usize) -> usize {
        rank / self.mp_size
    }

    /// Column of a rank: its position within its model-parallel group.
    pub fn mp_index(&self, rank: usize) -> usize {
        rank % self.mp_size
    }

    /// Model-parallel group of a rank: the contiguous block sharing its row.
    pub fn mp_group_ranks(&self, rank: usize) -> Vec<usize> {
        let row = self.dp_index(rank);
        (row * self.mp_size..(row + 1) * self.mp_size).collect()
    }

    /// Data-parallel group of a rank: the strided set sharing its column.
    pub fn dp_group_ranks(&self, rank: usize) -> Vec<usize> {
        let col = self.mp_index(rank);
        (0..self.dp_size()).map(|i| i * self.mp_size + col).collect()
    }

    /// Node-local group of a rank: the block of co-located workers.
    pub fn node_group_ranks(&self, rank: usize) -> Vec<usize> {
        let node = rank / self.gpus_per_node;
        let start = node * self.gpus_per_node;
        let end = ((node + 1) * self.gpus_per_node).min(self.world_size);
        (start..end).collect()
    }
}

/// Handle for one communication group this worker belongs to.
#[derive(Clone)]
pub struct CommGroup {
    /// Scoped communicator; its rank numbering follows `ranks` order
    comm: Arc<dyn Collective>,
    /// Global ranks of the members, in group-rank order
    ranks: Vec<usize>,
}

impl CommGroup {
    pub fn new(comm: Arc<dyn Collective>, ranks: Vec<usize>) -> Self {
        Self { comm, ranks }
    }

    /// This worker's rank within the group.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// The underlying collective, for the scalar helpers in this module's
    /// parent.
    pub fn comm(&self) -> &dyn Collective {
        self.comm.as_ref()
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Global ranks of the members, in group-rank order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Group rank of a global rank, if it is a member.
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    pub fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.comm.all_reduce(tensor)
    }

    pub fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.comm.all_gather(tensor)
    }

    pub fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        self.comm.broadcast(tensor, root)
    }

    pub fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }

    /// Send to a member addressed by group rank.
    pub fn send(&self, tensor: &Tensor, dst: usize) -> Result<()> {
        self.comm.send(tensor, dst)
    }

    /// Receive from a member addressed by group rank.
    pub fn recv(&self, src: usize) -> Result<Tensor> {
        self.comm.recv(src)
    }
}

/// Everything a component needs to know about this worker's place in the
/// grid, constructed once at startup and passed by reference.
///
/// There is deliberately no process-global registry: a test builds one
/// context per thread over an in-process backend and gets the exact
/// collective semantics of a multi-process run.
pub struct WorkerContext {
    rank: usize,
    grid: GridShape,
    device: Device,
    global: CommGroup,
    dp: CommGroup,
    mp: CommGroup,
    node: CommGroup,
}

impl WorkerContext {
    /// Build the four groups for this worker from a world communicator.
    ///
    /// Non-blocking: subgroup creation only registers membership, so
    /// contexts can be constructed sequentially before worker threads start.
    pub fn new(comm: Arc<dyn Collective>, grid: GridShape, device: Device) -> Result<Self> {
        if comm.world_size() != grid.world_size {
            return Err(SplatGridError::Config(format!(
                "communicator world size {} does not match grid world size {}",
                comm.world_size(),
                grid.world_size
            )));
        }

        let rank = comm.rank();
        let global_ranks: Vec<usize> = (0..grid.world_size).collect();
        let mp_ranks = grid.mp_group_ranks(rank);
        let dp_ranks = grid.dp_group_ranks(rank);
        let node_ranks = grid.node_group_ranks(rank);

        let mp_comm = comm.new_group(&mp_ranks)?;
        let dp_comm = comm.new_group(&dp_ranks)?;
        let node_comm = comm.new_group(&node_ranks)?;

        info!(
            rank = rank,
            world_size = grid.world_size,
            dp_index = grid.dp_index(rank),
            mp_index = grid.mp_index(rank),
            "Worker joined grid"
        );

        Ok(Self {
            rank,
            grid,
            device,
            global: CommGroup::new(comm, global_ranks),
            dp: CommGroup::new(dp_comm, dp_ranks),
            mp: CommGroup::new(mp_comm, mp_ranks),
            node: CommGroup::new(node_comm, node_ranks),
        })
    }

    /// One context per rank over an in-process backend, for tests and the
    /// single-process launcher.
    pub fn local_grid(grid: GridShape, device: &Device) -> Result<Vec<Self>> {
        LocalComm::new_group_set(grid.world_size)
            .into_iter()
            .map(|comm| Self::new(Arc::new(comm), grid, device.clone()))
            .collect()
    }

    /// Global rank of this worker.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.grid.world_size
    }

    pub fn grid(&self) -> GridShape {
        self.grid
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Which data-parallel row this worker renders for.
    pub fn dp_index(&self) -> usize {
        self.grid.dp_index(self.rank)
    }

    /// Position within the model-parallel group.
    pub fn mp_index(&self) -> usize {
        self.grid.mp_index(self.rank)
    }

    /// Rank 0 does the logging and persistence that should happen once.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn global_group(&self) -> &CommGroup {
        &self.global
    }

    pub fn dp_group(&self) -> &CommGroup {
        &self.dp
    }

    pub fn mp_group(&self) -> &CommGroup {
        &self.mp
    }

    pub fn node_group(&self) -> &CommGroup {
        &self.node
    }
}
