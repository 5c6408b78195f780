//! The distributed point set.
//!
//! `points` holds each worker's owned slice with its optimizer state,
//! `replicate` assembles the full scene every iteration needs for
//! rendering, `redistribute` keeps the slices balanced, and `views` is the
//! synthetic camera set and its agreed batch sampler.

pub mod points;
pub mod redistribute;
pub mod replicate;
pub mod views;

pub use points::{PointAttributes, PointStore, PAD_ID};
pub use redistribute::{plan_moves, target_count, Move, RedistributionController};
pub use replicate::ReplicatedScene;
pub use views::{View, ViewSet};
