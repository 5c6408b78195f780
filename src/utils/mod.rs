//! Shared infrastructure: configuration, errors, logging, metrics,
//! checkpoints.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use error::{Result, SplatGridError};
