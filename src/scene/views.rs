//! Synthetic views and batch sampling.
//!
//! Batch selection must agree across the whole grid, so it is derived only
//! from the configured seed and the iteration number. Every worker runs the
//! same sampler and gets the same batch without any communication.

use crate::utils::config::SceneConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const ITER_MIX: u64 = 0x517c_c1b7_2722_0a95;

/// One camera view of the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// The train/eval view split.
#[derive(Debug, Clone)]
pub struct ViewSet {
    train: Vec<View>,
    eval: Vec<View>,
}

impl ViewSet {
    /// Views `0..n_views` train; the next `eval_views` ids are held out.
    pub fn synthetic(scene: &SceneConfig) -> Self {
        let view = |id| View {
            id,
            width: scene.view_width,
            height: scene.view_height,
        };
        Self {
            train: (0..scene.n_views as u64).map(view).collect(),
            eval: (scene.n_views as u64..(scene.n_views + scene.eval_views) as u64)
                .map(view)
                .collect(),
        }
    }

    pub fn train_views(&self) -> &[View] {
        &self.train
    }

    pub fn eval_views(&self) -> &[View] {
        &self.eval
    }

    /// Draw the training batch for one iteration.
    ///
    /// Seeded by `(seed, iteration)` only, so every rank draws the same
    /// views in the same order.
    pub fn sample_batch(&self, seed: u64, iteration: u64, batch_size: usize) -> Vec<View> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ iteration.wrapping_mul(ITER_MIX));
        (0..batch_size)
            .map(|_| self.train[rng.gen_range(0..self.train.len())])
            .collect()
    }
}
