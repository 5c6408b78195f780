//! Checkpoint persistence with SHA256 corruption detection.
//!
//! Every worker writes its own slice: `chkpnt_ws={ws}_rk={rank}.safetensors`
//! for point state and `strategy_history_ws={ws}_rk={rank}.json` for the
//! division history. A companion `.meta.json` carries the checksum plus the
//! grid shape the set was written under; reloading under a different world
//! size is rejected rather than silently resharded.

use crate::scene::PointStore;
use crate::strategy::StrategyHistory;
use crate::utils::error::{Result, SplatGridError};
use candle_core::{safetensors, DType, Device, Tensor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Metadata stored alongside each checkpoint file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// SHA256 checksum of the tensor contents
    pub checksum: String,
    /// Original filename
    pub filename: String,
    /// World size the set was written under
    pub world_size: usize,
    /// Rank that wrote this file
    pub rank: usize,
    /// Iteration the state was captured at
    pub iteration: u64,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

pub fn point_checkpoint_name(world_size: usize, rank: usize) -> String {
    format!("chkpnt_ws={}_rk={}.safetensors", world_size, rank)
}

pub fn strategy_history_name(world_size: usize, rank: usize) -> String {
    format!("strategy_history_ws={}_rk={}.json", world_size, rank)
}

/// Compute SHA256 over tensor metadata and contents.
///
/// Large tensors are sampled (first and last 1024 bytes) to keep hashing
/// cheap; keys are sorted so the digest is deterministic.
pub fn compute_tensor_checksum(tensors: &HashMap<String, Tensor>) -> Result<String> {
    let mut hasher = Sha256::new();

    let mut keys: Vec<&String> = tensors.keys().collect();
    keys.sort();

    for key in keys {
        let tensor = &tensors[key];
        let meta = format!("{}:{:?}:{:?}", key, tensor.dtype(), tensor.dims());
        hasher.update(meta.as_bytes());

        let flat = tensor.flatten_all()?;
        let bytes: Vec<u8> = match tensor.dtype() {
            DType::F32 => flat
                .to_vec1::<f32>()?
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            DType::I64 => flat
                .to_vec1::<i64>()?
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            other => {
                return Err(SplatGridError::Checkpoint(format!(
                    "cannot checksum tensor {:?} with dtype {:?}",
                    key, other
                )))
            }
        };

        if bytes.len() > 2048 {
            hasher.update(&bytes[..1024]);
            hasher.update(&bytes[bytes.len() - 1024..]);
        } else {
            hasher.update(&bytes);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Save tensors plus a `.meta.json` companion holding the checksum.
pub fn save_checkpoint_with_checksum<P: AsRef<Path>>(
    tensors: &HashMap<String, Tensor>,
    path: P,
    world_size: usize,
    rank: usize,
    iteration: u64,
) -> Result<()> {
    let path = path.as_ref();

    let checksum = compute_tensor_checksum(tensors)?;
    safetensors::save(tensors, path)?;

    let metadata = CheckpointMetadata {
        checksum: checksum.clone(),
        filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("checkpoint")
            .to_string(),
        world_size,
        rank,
        iteration,
        extra: HashMap::new(),
    };

    let meta_path = path.with_extension("meta.json");
    let meta_json = serde_json::to_string_pretty(&metadata)?;
    fs::write(&meta_path, meta_json)?;

    info!(
        checkpoint = %path.display(),
        checksum = %checksum,
        iteration,
        "checkpoint saved"
    );
    Ok(())
}

/// Load tensors and verify them against the stored checksum.
pub fn load_checkpoint_with_checksum<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, CheckpointMetadata)> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(SplatGridError::Checkpoint(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }

    let tensors = safetensors::load(path, device)?;

    let meta_path = path.with_extension("meta.json");
    if !meta_path.exists() {
        return Err(SplatGridError::Checkpoint(format!(
            "metadata not found: {}",
            meta_path.display()
        )));
    }
    let meta: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;

    let current_checksum = compute_tensor_checksum(&tensors)?;
    if current_checksum != meta.checksum {
        error!(
            expected = %meta.checksum,
            actual = %current_checksum,
            checkpoint = %path.display(),
            "checkpoint checksum mismatch"
        );
        return Err(SplatGridError::Checkpoint(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            meta.checksum,
            current_checksum
        )));
    }

    Ok((tensors, meta))
}

/// Write this worker's point slice for the given grid shape.
pub fn save_point_checkpoint(
    dir: &Path,
    world_size: usize,
    rank: usize,
    iteration: u64,
    store: &PointStore,
    device: &Device,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(point_checkpoint_name(world_size, rank));
    let tensors = store.snapshot(device)?;
    save_checkpoint_with_checksum(&tensors, &path, world_size, rank, iteration)?;
    Ok(path)
}

/// Load this worker's point slice, verifying the whole set first.
///
/// The directory must hold exactly `world_size` slice files for this world
/// size, and the file's own metadata must agree on the grid shape; both
/// guards reject resuming a checkpoint set under a different grid.
pub fn load_point_checkpoint(
    dir: &Path,
    world_size: usize,
    rank: usize,
    feature_dim: usize,
    device: &Device,
) -> Result<(PointStore, u64)> {
    let prefix = format!("chkpnt_ws={}_rk=", world_size);
    let mut found = 0usize;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".safetensors") {
            found += 1;
        }
    }
    if found != world_size {
        return Err(SplatGridError::Checkpoint(format!(
            "checkpoint set in {} holds {} slices for world size {}",
            dir.display(),
            found,
            world_size
        )));
    }

    let path = dir.join(point_checkpoint_name(world_size, rank));
    let (tensors, meta) = load_checkpoint_with_checksum(&path, device)?;
    if meta.world_size != world_size || meta.rank != rank {
        return Err(SplatGridError::Checkpoint(format!(
            "checkpoint {} was written as rank {}/{} but is being loaded as rank {}/{}",
            path.display(),
            meta.rank,
            meta.world_size,
            rank,
            world_size
        )));
    }

    let store = PointStore::restore(rank, world_size, feature_dim, &tensors)?;
    Ok((store, meta.iteration))
}

/// Iteration recorded in a slice's metadata, without loading tensors.
pub fn read_checkpoint_iteration(
    dir: &Path,
    world_size: usize,
    rank: usize,
) -> Result<Option<u64>> {
    let meta_path = dir
        .join(point_checkpoint_name(world_size, rank))
        .with_extension("meta.json");
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
    Ok(Some(meta.iteration))
}

pub fn save_strategy_history(
    dir: &Path,
    world_size: usize,
    rank: usize,
    history: &StrategyHistory,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(strategy_history_name(world_size, rank));
    fs::write(&path, history.to_json()?)?;
    Ok(path)
}

pub fn load_strategy_history(dir: &Path, world_size: usize, rank: usize) -> Result<StrategyHistory> {
    let path = dir.join(strategy_history_name(world_size, rank));
    StrategyHistory::from_json(&fs::read_to_string(&path)?)
}
