//! Gradient reduction over an agreed id set.
//!
//! Workers touch different subsets of the replicated points, so gradients
//! are exchanged as one dense `[k, record_dim]` tensor over the id set the
//! replication gather agreed on, in ascending id order. Ids a worker never
//! touched contribute explicit zero rows; that keeps the buffer shape
//! identical on every member and the whole exchange down to a single sum
//! all_reduce. The engine is group-parametric: the trainer runs it once
//! over the model-parallel group and once over the data-parallel group,
//! which composes to the full-grid sum.

use crate::distributed::CommGroup;
use crate::utils::error::{Result, SplatGridError};
use candle_core::{Device, Tensor};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct GradientSyncEngine {
    record_dim: usize,
}

impl GradientSyncEngine {
    pub fn new(record_dim: usize) -> Self {
        Self { record_dim }
    }

    pub fn record_dim(&self) -> usize {
        self.record_dim
    }

    /// Sum gradients for `agreed_ids` across `group`, in place.
    ///
    /// `agreed_ids` must be ascending and identical on every member; the
    /// replication gather guarantees that. After the call, `grads` holds
    /// the group sum for every agreed id. Entries for ids outside the
    /// agreed set are left exactly as they were.
    pub fn sync(
        &self,
        agreed_ids: &[u64],
        grads: &mut HashMap<u64, Vec<f32>>,
        group: &CommGroup,
        device: &Device,
    ) -> Result<()> {
        if agreed_ids.is_empty() {
            return Ok(());
        }

        let dense = self.pack_dense(agreed_ids, grads, device)?;
        let reduced = group.all_reduce(&dense)?;
        let rows = reduced.to_vec2::<f32>()?;
        for (row, &id) in rows.into_iter().zip(agreed_ids.iter()) {
            grads.insert(id, row);
        }
        Ok(())
    }

    fn pack_dense(
        &self,
        agreed_ids: &[u64],
        grads: &HashMap<u64, Vec<f32>>,
        device: &Device,
    ) -> Result<Tensor> {
        let flat = self.to_dense(agreed_ids, grads)?;
        Ok(Tensor::from_vec(
            flat,
            (agreed_ids.len(), self.record_dim),
            device,
        )?)
    }

    /// Dense row-major `[k, record_dim]` buffer in ascending `agreed_ids`
    /// order, zero rows for untouched ids. This is the wire layout and the
    /// layout
    /// [`PointStore::apply_gradients`](crate::scene::PointStore::apply_gradients)
    /// consumes.
    pub fn to_dense(
        &self,
        agreed_ids: &[u64],
        grads: &HashMap<u64, Vec<f32>>,
    ) -> Result<Vec<f32>> {
        let dim = self.record_dim;
        let mut flat = vec![0.0f32; agreed_ids.len() * dim];
        for (row, &id) in agreed_ids.iter().enumerate() {
            if let Some(grad) = grads.get(&id) {
                if grad.len() != dim {
                    return Err(SplatGridError::Collective(format!(
                        "gradient for point {} has {} values, expected {}",
                        id,
                        grad.len(),
                        dim
                    )));
                }
                flat[row * dim..(row + 1) * dim].copy_from_slice(grad);
            }
        }
        Ok(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalComm;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sync_sums_across_three_workers() {
        let comms = LocalComm::new_group_set(3);
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let engine = GradientSyncEngine::new(2);
                    let group = CommGroup::new(Arc::new(comm), vec![0, 1, 2]);
                    let agreed = vec![5u64, 9];

                    let mut grads: HashMap<u64, Vec<f32>> = HashMap::new();
                    // Every worker touches id 5 with a rank-distinct value.
                    grads.insert(5, vec![(rank + 1) as f32, 0.5]);
                    // Only rank 1 touches id 9.
                    if rank == 1 {
                        grads.insert(9, vec![10.0, 20.0]);
                    }
                    // A private id outside the agreed set.
                    if rank == 2 {
                        grads.insert(100, vec![7.0, 7.0]);
                    }

                    engine
                        .sync(&agreed, &mut grads, &group, &Device::Cpu)
                        .unwrap();
                    grads
                })
            })
            .collect();

        for handle in handles {
            let grads = handle.join().unwrap();
            // g1 + g2 + g3 over the shared id.
            assert_eq!(grads.get(&5), Some(&vec![6.0, 1.5]));
            // Zero rows elsewhere make single-toucher sums exact.
            assert_eq!(grads.get(&9), Some(&vec![10.0, 20.0]));
            // Non-agreed local gradient is untouched where it existed.
            if grads.contains_key(&100) {
                assert_eq!(grads.get(&100), Some(&vec![7.0, 7.0]));
            }
        }
    }

    #[test]
    fn test_untouched_agreed_id_reduces_to_zeros() {
        let comms = LocalComm::new_group_set(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let engine = GradientSyncEngine::new(3);
                    let group = CommGroup::new(Arc::new(comm), vec![0, 1]);
                    let mut grads: HashMap<u64, Vec<f32>> = HashMap::new();
                    engine
                        .sync(&[4], &mut grads, &group, &Device::Cpu)
                        .unwrap();
                    grads
                })
            })
            .collect();
        for handle in handles {
            let grads = handle.join().unwrap();
            assert_eq!(grads.get(&4), Some(&vec![0.0, 0.0, 0.0]));
        }
    }

    #[test]
    fn test_wrong_width_gradient_is_rejected() {
        let engine = GradientSyncEngine::new(4);
        let mut grads: HashMap<u64, Vec<f32>> = HashMap::new();
        grads.insert(1, vec![1.0, 2.0]);
        assert!(engine.to_dense(&[1], &grads).is_err());
    }

    #[test]
    fn test_to_dense_orders_rows_by_id() {
        let engine = GradientSyncEngine::new(1);
        let mut grads: HashMap<u64, Vec<f32>> = HashMap::new();
        grads.insert(7, vec![70.0]);
        grads.insert(3, vec![30.0]);
        let flat = engine.to_dense(&[3, 5, 7], &grads).unwrap();
        assert_eq!(flat, vec![30.0, 0.0, 70.0]);
    }
}
