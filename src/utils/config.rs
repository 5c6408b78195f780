//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `SPLATGRID_*` environment variables override config file values.
//! Example: `SPLATGRID_TRAIN__BATCH_SIZE=4` overrides `train.batch_size`.

use crate::utils::error::{Result, SplatGridError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Worker-grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// World size (total number of workers)
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// Model-parallel group size (workers jointly rendering one view)
    #[serde(default = "default_one")]
    pub mp_size: usize,

    /// Workers per node, for node-local groups
    #[serde(default = "default_gpus_per_node")]
    pub gpus_per_node: usize,
}

/// Training-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Total training iterations
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Views per iteration across the whole grid; must divide by dp_size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seed for deterministic view sampling
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Evaluation cadence in iterations (0 disables)
    #[serde(default = "default_eval_interval")]
    pub eval_interval: u64,

    /// Logging cadence in iterations
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,

    /// Initial position learning rate
    #[serde(default = "default_position_lr_init")]
    pub position_lr_init: f64,

    /// Final position learning rate
    #[serde(default = "default_position_lr_final")]
    pub position_lr_final: f64,

    /// Horizon of the position LR schedule, in steps
    #[serde(default = "default_lr_max_steps")]
    pub lr_max_steps: u64,

    /// Fixed learning rate for non-position parameters
    #[serde(default = "default_feature_lr")]
    pub feature_lr: f64,
}

/// Workload-division configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Exponential-smoothing factor for per-worker time estimates
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Bounded history window per view (finished strategies kept)
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Clamp for zero-cost/zero-touch reports
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Use the history-based policy after the first iteration of a view
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

/// Scene and growth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Initial entity count across all workers
    #[serde(default = "default_n_points")]
    pub n_points: usize,

    /// Appearance-coefficient dimension per entity
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    /// Training views in the synthetic view set
    #[serde(default = "default_n_views")]
    pub n_views: usize,

    /// Held-out evaluation views
    #[serde(default = "default_eval_views")]
    pub eval_views: usize,

    /// View width in pixels
    #[serde(default = "default_view_width")]
    pub view_width: u32,

    /// View height in pixels
    #[serde(default = "default_view_height")]
    pub view_height: u32,

    /// Growth cadence in iterations
    #[serde(default = "default_densify_interval")]
    pub densify_interval: u64,

    /// First iteration eligible for growth
    #[serde(default = "default_densify_from")]
    pub densify_from: u64,

    /// Iteration after which growth stops
    #[serde(default = "default_densify_until")]
    pub densify_until: u64,

    /// Accumulated positional-gradient threshold for splitting
    #[serde(default = "default_densify_grad_threshold")]
    pub densify_grad_threshold: f32,

    /// Opacity floor below which entities are pruned
    #[serde(default = "default_prune_opacity")]
    pub prune_opacity: f32,

    /// Rebalance ownership every N point-count-changing events
    #[serde(default = "default_redistribute_frequency")]
    pub redistribute_frequency: u64,

    /// Redistribution mode: "by_id" or "none"
    #[serde(default = "default_redistribute_mode")]
    pub redistribute_mode: String,
}

/// Memory-watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Peak-memory threshold in memory units; any worker above it latches
    /// growth off for the rest of the run
    #[serde(default = "default_memory_threshold")]
    pub threshold: f64,

    /// Memory units accounted per resident entity
    #[serde(default = "default_units_per_point")]
    pub units_per_point: f64,
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoint directory
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,

    /// Checkpoint cadence in iterations (0 disables checkpointing)
    #[serde(default)]
    pub interval: u64,

    /// Resume from an existing checkpoint set on startup
    #[serde(default)]
    pub resume: bool,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub train: TrainConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub scene: SceneConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

// Default value functions
fn default_world_size() -> usize { 1 }
fn default_one() -> usize { 1 }
fn default_gpus_per_node() -> usize { 4 }
fn default_iterations() -> u64 { 1000 }
fn default_batch_size() -> usize { 1 }
fn default_seed() -> u64 { 42 }
fn default_eval_interval() -> u64 { 500 }
fn default_log_interval() -> u64 { 50 }
fn default_position_lr_init() -> f64 { 1.6e-4 }
fn default_position_lr_final() -> f64 { 1.6e-6 }
fn default_lr_max_steps() -> u64 { 30_000 }
fn default_feature_lr() -> f64 { 2.5e-3 }
fn default_alpha() -> f64 { 0.2 }
fn default_history_window() -> usize { 16 }
fn default_epsilon() -> f64 { 1e-6 }
fn default_true() -> bool { true }
fn default_n_points() -> usize { 4096 }
fn default_feature_dim() -> usize { 24 }
fn default_n_views() -> usize { 32 }
fn default_eval_views() -> usize { 4 }
fn default_view_width() -> u32 { 512 }
fn default_view_height() -> u32 { 288 }
fn default_densify_interval() -> u64 { 100 }
fn default_densify_from() -> u64 { 500 }
fn default_densify_until() -> u64 { 15_000 }
fn default_densify_grad_threshold() -> f32 { 2e-4 }
fn default_prune_opacity() -> f32 { 5e-3 }
fn default_redistribute_frequency() -> u64 { 10 }
fn default_redistribute_mode() -> String { "by_id".to_string() }
fn default_memory_threshold() -> f64 { 17.5 }
fn default_units_per_point() -> f64 { 1e-3 }
fn default_checkpoint_dir() -> String { "./checkpoints".to_string() }

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            mp_size: default_one(),
            gpus_per_node: default_gpus_per_node(),
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            eval_interval: default_eval_interval(),
            log_interval: default_log_interval(),
            position_lr_init: default_position_lr_init(),
            position_lr_final: default_position_lr_final(),
            lr_max_steps: default_lr_max_steps(),
            feature_lr: default_feature_lr(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            history_window: default_history_window(),
            epsilon: default_epsilon(),
            adaptive: default_true(),
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            n_points: default_n_points(),
            feature_dim: default_feature_dim(),
            n_views: default_n_views(),
            eval_views: default_eval_views(),
            view_width: default_view_width(),
            view_height: default_view_height(),
            densify_interval: default_densify_interval(),
            densify_from: default_densify_from(),
            densify_until: default_densify_until(),
            densify_grad_threshold: default_densify_grad_threshold(),
            prune_opacity: default_prune_opacity(),
            redistribute_frequency: default_redistribute_frequency(),
            redistribute_mode: default_redistribute_mode(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold: default_memory_threshold(),
            units_per_point: default_units_per_point(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval: 0,
            resume: false,
        }
    }
}

impl GridConfig {
    /// Data-parallel group count, derived from world and MP sizes.
    pub fn dp_size(&self) -> usize {
        self.world_size / self.mp_size
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SplatGridError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables are prefixed with `SPLATGRID_` and use uppercase.
    /// Nested keys use double underscore: `SPLATGRID_TRAIN__BATCH_SIZE`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            if !key.starts_with("SPLATGRID_") {
                continue;
            }

            let config_key = key[10..].to_lowercase(); // Remove "SPLATGRID_" prefix

            // Handle nested keys with double underscore
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["grid", field] => self.apply_grid_override(field, &value),
                ["train", field] => self.apply_train_override(field, &value),
                ["strategy", field] => self.apply_strategy_override(field, &value),
                ["scene", field] => self.apply_scene_override(field, &value),
                ["memory", field] => self.apply_memory_override(field, &value),
                ["checkpoint", field] => self.apply_checkpoint_override(field, &value),
                [field] => {
                    // Try each section for simple keys
                    self.apply_grid_override(field, &value);
                    self.apply_train_override(field, &value);
                    self.apply_strategy_override(field, &value);
                    self.apply_scene_override(field, &value);
                    self.apply_memory_override(field, &value);
                    self.apply_checkpoint_override(field, &value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_grid_override(&mut self, field: &str, value: &str) {
        match field {
            "world_size" => if let Ok(v) = value.parse() { self.grid.world_size = v; }
            "mp_size" => if let Ok(v) = value.parse() { self.grid.mp_size = v; }
            "gpus_per_node" => if let Ok(v) = value.parse() { self.grid.gpus_per_node = v; }
            _ => {}
        }
    }

    fn apply_train_override(&mut self, field: &str, value: &str) {
        match field {
            "iterations" => if let Ok(v) = value.parse() { self.train.iterations = v; }
            "batch_size" | "bsz" => if let Ok(v) = value.parse() { self.train.batch_size = v; }
            "seed" => if let Ok(v) = value.parse() { self.train.seed = v; }
            "eval_interval" => if let Ok(v) = value.parse() { self.train.eval_interval = v; }
            "log_interval" => if let Ok(v) = value.parse() { self.train.log_interval = v; }
            "position_lr_init" => if let Ok(v) = value.parse() { self.train.position_lr_init = v; }
            "position_lr_final" => if let Ok(v) = value.parse() { self.train.position_lr_final = v; }
            "lr_max_steps" => if let Ok(v) = value.parse() { self.train.lr_max_steps = v; }
            "feature_lr" => if let Ok(v) = value.parse() { self.train.feature_lr = v; }
            _ => {}
        }
    }

    fn apply_strategy_override(&mut self, field: &str, value: &str) {
        match field {
            "alpha" => if let Ok(v) = value.parse() { self.strategy.alpha = v; }
            "history_window" => if let Ok(v) = value.parse() { self.strategy.history_window = v; }
            "epsilon" => if let Ok(v) = value.parse() { self.strategy.epsilon = v; }
            "adaptive" => {
                self.strategy.adaptive = value.to_lowercase() == "true" || value == "1";
            }
            _ => {}
        }
    }

    fn apply_scene_override(&mut self, field: &str, value: &str) {
        match field {
            "n_points" => if let Ok(v) = value.parse() { self.scene.n_points = v; }
            "feature_dim" => if let Ok(v) = value.parse() { self.scene.feature_dim = v; }
            "n_views" => if let Ok(v) = value.parse() { self.scene.n_views = v; }
            "eval_views" => if let Ok(v) = value.parse() { self.scene.eval_views = v; }
            "view_width" => if let Ok(v) = value.parse() { self.scene.view_width = v; }
            "view_height" => if let Ok(v) = value.parse() { self.scene.view_height = v; }
            "densify_interval" => if let Ok(v) = value.parse() { self.scene.densify_interval = v; }
            "densify_from" => if let Ok(v) = value.parse() { self.scene.densify_from = v; }
            "densify_until" => if let Ok(v) = value.parse() { self.scene.densify_until = v; }
            "densify_grad_threshold" => {
                if let Ok(v) = value.parse() { self.scene.densify_grad_threshold = v; }
            }
            "prune_opacity" => if let Ok(v) = value.parse() { self.scene.prune_opacity = v; }
            "redistribute_frequency" => {
                if let Ok(v) = value.parse() { self.scene.redistribute_frequency = v; }
            }
            "redistribute_mode" => self.scene.redistribute_mode = value.to_string(),
            _ => {}
        }
    }

    fn apply_memory_override(&mut self, field: &str, value: &str) {
        match field {
            "threshold" | "memory_threshold" => {
                if let Ok(v) = value.parse() { self.memory.threshold = v; }
            }
            "units_per_point" => if let Ok(v) = value.parse() { self.memory.units_per_point = v; }
            _ => {}
        }
    }

    fn apply_checkpoint_override(&mut self, field: &str, value: &str) {
        match field {
            "dir" | "checkpoint_dir" => self.checkpoint.dir = value.to_string(),
            "interval" => if let Ok(v) = value.parse() { self.checkpoint.interval = v; }
            "resume" => self.checkpoint.resume = value.to_lowercase() == "true" || value == "1",
            _ => {}
        }
    }

    /// Validate configuration consistency.
    ///
    /// Runs before any communication group is constructed, so a bad grid or
    /// batch shape fails the job without opening a collective.
    pub fn validate(&self) -> Result<()> {
        if self.grid.world_size == 0 || self.grid.mp_size == 0 {
            return Err(SplatGridError::Config(
                "world_size and mp_size must be at least 1".to_string(),
            ));
        }

        if self.grid.world_size % self.grid.mp_size != 0 {
            return Err(SplatGridError::Config(format!(
                "world_size({}) must be divisible by mp_size({})",
                self.grid.world_size, self.grid.mp_size
            )));
        }

        if self.train.batch_size == 0 {
            return Err(SplatGridError::Config(
                "train.batch_size must be at least 1".to_string(),
            ));
        }

        let dp_size = self.grid.dp_size();
        if self.train.batch_size % dp_size != 0 {
            return Err(SplatGridError::Config(format!(
                "batch_size({}) must be divisible by dp_size({})",
                self.train.batch_size, dp_size
            )));
        }

        if self.grid.gpus_per_node == 0 {
            return Err(SplatGridError::Config(
                "gpus_per_node must be at least 1".to_string(),
            ));
        }

        if !(self.strategy.alpha > 0.0 && self.strategy.alpha <= 1.0) {
            return Err(SplatGridError::Config(format!(
                "strategy.alpha({}) must be in (0, 1]",
                self.strategy.alpha
            )));
        }

        if self.strategy.epsilon <= 0.0 {
            return Err(SplatGridError::Config(
                "strategy.epsilon must be positive".to_string(),
            ));
        }

        if self.strategy.history_window == 0 {
            return Err(SplatGridError::Config(
                "strategy.history_window must be at least 1".to_string(),
            ));
        }

        if self.scene.view_width == 0 || self.scene.view_height == 0 {
            return Err(SplatGridError::Config(
                "view dimensions must be positive".to_string(),
            ));
        }

        if self.scene.n_views == 0 {
            return Err(SplatGridError::Config(
                "scene.n_views must be at least 1".to_string(),
            ));
        }

        match self.scene.redistribute_mode.as_str() {
            "by_id" | "none" => {}
            other => {
                return Err(SplatGridError::Config(format!(
                    "unknown redistribute_mode '{}' (expected 'by_id' or 'none')",
                    other
                )));
            }
        }

        if self.memory.threshold <= 0.0 {
            return Err(SplatGridError::Config(
                "memory.threshold must be positive".to_string(),
            ));
        }

        if self.train.lr_max_steps == 0 {
            return Err(SplatGridError::Config(
                "train.lr_max_steps must be at least 1".to_string(),
            ));
        }

        if self.train.position_lr_init <= 0.0 || self.train.position_lr_final <= 0.0 {
            return Err(SplatGridError::Config(
                "position learning rates must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SplatGridError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}
