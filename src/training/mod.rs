//! Training loop, synthetic renderer, and schedules.

pub mod render;
pub mod schedule;
pub mod trainer;

pub use render::{RenderOutput, Renderer, SyntheticRenderer};
pub use schedule::PositionLrSchedule;
pub use trainer::{TrainSummary, Trainer};
