//! The distributed training loop.
//!
//! One `Trainer` runs per worker. Each iteration walks the same sequence
//! on every rank: sample the agreed batch, replicate the scene, render
//! per-view unit slices under the strategy the history picked, gather
//! per-worker times and fold them back, reduce gradients over the
//! model-parallel then the data-parallel group, and step the owned points.
//! Growth, memory checks, redistribution, evaluation and checkpoints all
//! hang off cadences derived from the iteration counter, so no rank ever
//! branches around a collective on private state.

use crate::distributed::{
    all_gather_scalars, all_reduce_scalar, all_reduce_scalar_sum, GradientSyncEngine, MemoryGuard,
    WorkerContext,
};
use crate::scene::{PointStore, RedistributionController, ReplicatedScene, ViewSet};
use crate::strategy::{StrategyHistory, TileGrid};
use crate::training::render::{RenderOutput, Renderer, SyntheticRenderer};
use crate::training::schedule::PositionLrSchedule;
use crate::utils::checkpoint;
use crate::utils::config::Config;
use crate::utils::error::{Result, SplatGridError};
use crate::utils::metrics;
use candle_core::Tensor;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// What a finished run reports back to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub iterations: u64,
    pub final_loss: Option<f64>,
    pub points_owned: usize,
    pub growth_disabled: bool,
}

pub struct Trainer {
    config: Config,
    ctx: WorkerContext,
    renderer: Box<dyn Renderer>,
    store: PointStore,
    history: StrategyHistory,
    sync: GradientSyncEngine,
    redistribution: RedistributionController,
    memory_guard: MemoryGuard,
    schedule: PositionLrSchedule,
    views: ViewSet,
    loss_ema: Option<f64>,
}

impl Trainer {
    pub fn new(config: Config, ctx: WorkerContext) -> Result<Self> {
        Self::with_renderer(config, ctx, Box::new(SyntheticRenderer::new()))
    }

    pub fn with_renderer(
        config: Config,
        ctx: WorkerContext,
        renderer: Box<dyn Renderer>,
    ) -> Result<Self> {
        let store = PointStore::init(
            ctx.rank(),
            ctx.world_size(),
            &config.scene,
            config.train.seed,
        )?;
        let history = StrategyHistory::new(ctx.grid().mp_size, &config.strategy);
        let sync = GradientSyncEngine::new(store.record_dim());
        let redistribution = RedistributionController::new(
            config.scene.redistribute_frequency as usize,
            config.scene.redistribute_mode == "by_id",
        );
        let memory_guard = MemoryGuard::new(config.memory.threshold);
        let schedule = PositionLrSchedule::new(&config.train);
        let views = ViewSet::synthetic(&config.scene);

        if ctx.is_main() {
            info!(
                world_size = ctx.world_size(),
                mp_size = ctx.grid().mp_size,
                dp_size = ctx.grid().dp_size(),
                points = config.scene.n_points,
                views = config.scene.n_views,
                "trainer initialized"
            );
        }

        Ok(Self {
            config,
            ctx,
            renderer,
            store,
            history,
            sync,
            redistribution,
            memory_guard,
            schedule,
            views,
            loss_ema: None,
        })
    }

    pub fn store(&self) -> &PointStore {
        &self.store
    }

    pub fn history(&self) -> &StrategyHistory {
        &self.history
    }

    /// Run the configured number of iterations and report the outcome.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let start_iter = if self.config.checkpoint.resume {
            self.try_resume()?.unwrap_or(0)
        } else {
            0
        };

        for iteration in start_iter..self.config.train.iterations {
            let started = Instant::now();
            let loss = self.train_iteration(iteration)?;
            let lr = self.schedule.get_lr(iteration);

            let ema = match self.loss_ema {
                Some(prev) => 0.4 * loss + 0.6 * prev,
                None => loss,
            };
            self.loss_ema = Some(ema);
            metrics::record_iteration(loss, started.elapsed().as_secs_f64(), lr);

            if self.ctx.is_main() && (iteration + 1) % self.config.train.log_interval == 0 {
                info!(
                    iteration = iteration + 1,
                    loss = format!("{loss:.6}"),
                    ema = format!("{ema:.6}"),
                    lr = format!("{lr:.2e}"),
                    points = self.store.n_owned(),
                    "train"
                );
            }

            self.maybe_grow(iteration)?;

            let eval_interval = self.config.train.eval_interval;
            if eval_interval > 0 && (iteration + 1) % eval_interval == 0 {
                self.evaluate(iteration)?;
            }

            let ckpt_interval = self.config.checkpoint.interval;
            if ckpt_interval > 0 && (iteration + 1) % ckpt_interval == 0 {
                self.save_checkpoint(iteration)?;
            }
        }

        Ok(TrainSummary {
            iterations: self.config.train.iterations,
            final_loss: self.loss_ema,
            points_owned: self.store.n_owned(),
            growth_disabled: !self.memory_guard.growth_allowed(),
        })
    }

    /// One optimization step. Returns the batch mean loss, identical on
    /// every rank.
    fn train_iteration(&mut self, iteration: u64) -> Result<f64> {
        let device = self.ctx.device().clone();
        let batch_size = self.config.train.batch_size;
        let dp_size = self.ctx.grid().dp_size();
        let per_replica = batch_size / dp_size;

        // Same seed and iteration on every rank, so the batch is agreed.
        let batch = self
            .views
            .sample_batch(self.config.train.seed, iteration, batch_size);
        let dp_index = self.ctx.dp_index();
        let my_views = &batch[dp_index * per_replica..(dp_index + 1) * per_replica];

        let scene = ReplicatedScene::gather(&self.store, self.ctx.global_group(), &device)?;
        let agreed: Vec<u64> = scene.ids().to_vec();

        let mut accum = RenderOutput::empty();
        let mut batch_loss = 0.0;
        let mut render_secs = 0.0;
        for view in my_views {
            let tiles = TileGrid::for_view(view.width, view.height);
            let mut strategy = self.history.start_strategy(view.id, tiles, iteration);
            let units = strategy.local_units(self.ctx.mp_index()).to_vec();

            let render_started = Instant::now();
            let out = self.renderer.render(&scene, view, tiles, &units)?;
            render_secs += render_started.elapsed().as_secs_f64();

            // Everyone in the row shares its per-worker times, so the same
            // measurements feed every member's history.
            let times = all_gather_scalars(out.cost, self.ctx.mp_group().comm())?;
            strategy.update_stats(&times)?;
            self.history.finish_strategy(&mut strategy);
            metrics::record_imbalance(&times);

            batch_loss += all_reduce_scalar_sum(out.loss, self.ctx.mp_group().comm())?;
            accum.merge(out);
        }
        metrics::record_phase("render", render_secs);

        // Row stage then column stage composes to the full-grid sum.
        let sync_started = Instant::now();
        let mut grads = accum.grads;
        self.sync
            .sync(&agreed, &mut grads, self.ctx.mp_group(), &device)?;
        self.sync
            .sync(&agreed, &mut grads, self.ctx.dp_group(), &device)?;
        metrics::record_phase("sync", sync_started.elapsed().as_secs_f64());

        let mut dense = self.sync.to_dense(&agreed, &grads)?;
        let scale = 1.0 / batch_size as f32;
        for g in dense.iter_mut() {
            *g *= scale;
        }
        let lr = self.schedule.get_lr(iteration);
        self.store
            .apply_gradients(&agreed, &dense, lr, self.config.train.feature_lr)?;

        let local_mean = if per_replica > 0 {
            batch_loss / per_replica as f64
        } else {
            0.0
        };
        all_reduce_scalar(local_mean, self.ctx.dp_group().comm())
    }

    /// Growth pass with its memory check and redistribution cadence.
    ///
    /// Every gate here derives from the iteration counter or from gathered
    /// results, so all ranks take the same branch.
    fn maybe_grow(&mut self, iteration: u64) -> Result<()> {
        let scene_cfg = &self.config.scene;
        let in_window = iteration >= scene_cfg.densify_from && iteration < scene_cfg.densify_until;
        let on_cadence = scene_cfg.densify_interval > 0
            && iteration % scene_cfg.densify_interval == 0;
        if !(in_window && on_cadence) {
            return Ok(());
        }

        let reading = self.store.memory_units(self.config.memory.units_per_point);
        let allowed = self.memory_guard.check(reading, self.ctx.global_group())?;
        if !allowed {
            debug!(iteration, "growth request suppressed by memory latch");
            return Ok(());
        }

        let scene_cfg = self.config.scene.clone();
        let (added, pruned) =
            self.store
                .growth_pass(iteration, &scene_cfg, self.config.train.seed);
        metrics::record_growth(added, pruned);
        metrics::record_point_count(self.store.n_owned());
        debug!(iteration, added, pruned, "growth pass");

        if self.redistribution.on_growth_event() {
            let device = self.ctx.device().clone();
            self.redistribution
                .redistribute(&mut self.store, self.ctx.global_group(), &device)?;
        }
        Ok(())
    }

    /// Held-out evaluation under the even division, leaving the strategy
    /// history untouched. Returns the mean eval loss.
    fn evaluate(&mut self, iteration: u64) -> Result<f64> {
        let started = Instant::now();
        let device = self.ctx.device().clone();
        let scene = ReplicatedScene::gather(&self.store, self.ctx.global_group(), &device)?;

        let eval_views = self.views.eval_views().to_vec();
        if eval_views.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for view in &eval_views {
            let tiles = TileGrid::for_view(view.width, view.height);
            let strategy = self.history.even_strategy(view.id, tiles, iteration);
            let units = strategy.local_units(self.ctx.mp_index());
            let out = self.renderer.render(&scene, view, tiles, units)?;
            total += all_reduce_scalar_sum(out.loss, self.ctx.mp_group().comm())?;
        }
        let mean = total / eval_views.len() as f64;
        metrics::record_phase("eval", started.elapsed().as_secs_f64());
        if self.ctx.is_main() {
            info!(
                iteration = iteration + 1,
                eval_loss = format!("{mean:.6}"),
                views = eval_views.len(),
                "evaluation"
            );
        }
        Ok(mean)
    }

    fn save_checkpoint(&self, iteration: u64) -> Result<()> {
        let dir = Path::new(&self.config.checkpoint.dir);
        checkpoint::save_point_checkpoint(
            dir,
            self.ctx.world_size(),
            self.ctx.rank(),
            iteration,
            &self.store,
            self.ctx.device(),
        )?;
        checkpoint::save_strategy_history(
            dir,
            self.ctx.world_size(),
            self.ctx.rank(),
            &self.history,
        )?;
        if self.ctx.is_main() {
            info!(iteration = iteration + 1, dir = %dir.display(), "checkpoint saved");
        }
        Ok(())
    }

    /// Resume from this grid's checkpoint set if the main rank finds one.
    ///
    /// The main rank reads its own metadata and broadcasts the resume
    /// iteration, so the whole grid agrees on whether a resume happens; a
    /// rank whose file is then missing fails loudly instead of training
    /// from scratch beside resumed peers.
    fn try_resume(&mut self) -> Result<Option<u64>> {
        let dir = Path::new(&self.config.checkpoint.dir);
        let device = self.ctx.device().clone();

        let announced = if self.ctx.is_main() {
            checkpoint::read_checkpoint_iteration(dir, self.ctx.world_size(), 0)?
                .map(|it| it + 1)
                .unwrap_or(0)
        } else {
            0
        };
        let tensor = Tensor::new(&[announced as i64], &device)?;
        let agreed = self.ctx.global_group().broadcast(&tensor, 0)?;
        let resume_from = agreed.to_vec1::<i64>()?[0];
        if resume_from <= 0 {
            return Ok(None);
        }

        let (store, iteration) = checkpoint::load_point_checkpoint(
            dir,
            self.ctx.world_size(),
            self.ctx.rank(),
            self.config.scene.feature_dim,
            &device,
        )?;
        if iteration + 1 != resume_from as u64 {
            return Err(SplatGridError::Checkpoint(format!(
                "rank {} checkpoint is at iteration {} but the grid resumes from {}",
                self.ctx.rank(),
                iteration,
                resume_from - 1
            )));
        }
        self.store = store;
        self.history = checkpoint::load_strategy_history(
            dir,
            self.ctx.world_size(),
            self.ctx.rank(),
        )?;
        info!(
            rank = self.ctx.rank(),
            iteration, "resumed from checkpoint"
        );
        Ok(Some(iteration + 1))
    }
}
