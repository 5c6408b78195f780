//! Adaptive workload division across the model-parallel group.
//!
//! `division` turns a view into tile units and partitions them, either
//! evenly or from timing feedback; `history` owns the per-view strategy
//! lifecycle and the smoothed estimates that feedback produces.

pub mod division;
pub mod history;

pub use division::{DivisionMode, DivisionPolicy, Partition, TileGrid, BLOCK_X, BLOCK_Y};
pub use history::{Strategy, StrategyHistory, StrategyState};
