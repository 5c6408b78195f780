use splatgrid::distributed::{GridShape, LocalComm, WorkerContext};
use splatgrid::training::{TrainSummary, Trainer};
use splatgrid::utils::config::Config;
use splatgrid::utils::error::{Result, SplatGridError};
use splatgrid::utils::logging;

use candle_core::Device;
use std::sync::Arc;
use tracing::{info, warn};

/// CUDA-first device selection shared by every worker thread.
///
/// Device acquisition failure downgrades to CPU with a warning instead of
/// aborting, so a misconfigured driver still produces a (slow) run.
fn select_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA GPU");
                return device;
            }
            Err(err) => {
                warn!(error = %err, "CUDA available but device creation failed, falling back");
            }
        }
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal GPU");
                return device;
            }
            Err(err) => {
                warn!(error = %err, "Metal available but device creation failed, falling back");
            }
        }
    }
    info!("Using CPU");
    Device::Cpu
}

#[cfg(feature = "metrics-server")]
fn spawn_metrics_server() {
    let Ok(port) = std::env::var("SPLATGRID_METRICS_PORT") else {
        return;
    };
    let Ok(port) = port.parse::<u16>() else {
        warn!("SPLATGRID_METRICS_PORT is not a valid port, metrics server disabled");
        return;
    };
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                warn!(error = %err, "Failed to start metrics runtime");
                return;
            }
        };
        if let Err(err) = runtime.block_on(splatgrid::utils::metrics::start_metrics_server(port)) {
            warn!(error = %err, "Metrics server exited");
        }
    });
}

fn main() -> Result<()> {
    logging::init_logging_from_env();
    info!("Starting splatgrid trainer");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file_with_env(&path)?,
        None => Config::from_env(),
    };
    config.validate()?;

    let grid = GridShape::from_config(&config.grid)?;
    info!(
        world_size = grid.world_size,
        mp_size = grid.mp_size,
        dp_size = grid.dp_size(),
        "Worker grid configured"
    );

    #[cfg(feature = "metrics-server")]
    spawn_metrics_server();

    let device = select_device();

    // One thread per rank over an in-process collective backend. Real
    // multi-node deployments swap LocalComm for an NCCL-backed Collective
    // and run one process per rank instead.
    let comms = LocalComm::new_group_set(grid.world_size);
    let mut handles = Vec::with_capacity(grid.world_size);
    for comm in comms {
        let config = config.clone();
        let device = device.clone();
        handles.push(std::thread::spawn(move || -> Result<TrainSummary> {
            let ctx = WorkerContext::new(Arc::new(comm), grid, device)?;
            let mut trainer = Trainer::new(config, ctx)?;
            trainer.run()
        }));
    }

    let mut first: Option<TrainSummary> = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let summary = handle
            .join()
            .map_err(|_| SplatGridError::Collective(format!("worker {} panicked", rank)))??;
        if first.is_none() {
            first = Some(summary);
        }
    }

    if let Some(summary) = first {
        info!(
            iterations = summary.iterations,
            final_loss = summary.final_loss,
            growth_disabled = summary.growth_disabled,
            "Training complete"
        );
    }

    Ok(())
}
