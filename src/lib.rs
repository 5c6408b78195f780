//! Distributed point-set scene training over a 2-D worker grid.
//!
//! Workers are arranged as data-parallel rows and model-parallel columns.
//! Each model-parallel group shares the per-view rendering work through
//! adaptive tile partitions, while data-parallel replicas split the view
//! batch and average gradients. The crate provides the worker grid and
//! collectives, the scene storage with dynamic growth and redistribution,
//! the adaptive division strategies, and the training loop that ties them
//! together.

pub mod distributed;
pub mod scene;
pub mod strategy;
pub mod training;
pub mod utils;

pub use distributed::{GridShape, WorkerContext};
pub use training::Trainer;
pub use utils::{Config, Result, SplatGridError};
