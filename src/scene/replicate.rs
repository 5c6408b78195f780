//! Whole-scene replication.
//!
//! Rendering needs every point, not just the locally owned slice, so each
//! iteration starts with one all_gather of parameter records over the
//! global group. Slices differ in size, so every rank pads to the gathered
//! maximum and fill rows carry [`PAD_ID`]. The ascending id list of the
//! gathered scene is the agreed set that gradient sync reduces over.

use crate::distributed::{all_gather_counts, CommGroup};
use crate::scene::points::{PointStore, PAD_ID};
use crate::utils::error::{Result, SplatGridError};
use candle_core::Device;

/// A full copy of the scene, identical on every rank after a gather.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedScene {
    /// Ascending global point ids
    ids: Vec<u64>,
    /// Row-major `[len, record_dim]` parameter records, rows match `ids`
    params: Vec<f32>,
    feature_dim: usize,
}

impl ReplicatedScene {
    /// Gather every worker's slice over `global`.
    ///
    /// Fails if the same id arrives from two workers, which would mean the
    /// disjoint-ownership invariant is broken.
    pub fn gather(store: &PointStore, global: &CommGroup, device: &Device) -> Result<Self> {
        let feature_dim = store.feature_dim();
        let counts = all_gather_counts(store.n_owned(), global.comm())?;
        let max_n = counts.iter().copied().max().unwrap_or(0);
        if max_n == 0 {
            return Ok(Self {
                ids: Vec::new(),
                params: Vec::new(),
                feature_dim,
            });
        }

        let (ids_t, params_t) = store.pack_params_padded(max_n, device)?;
        let all_ids = global.all_gather(&ids_t)?.to_vec1::<i64>()?;
        let all_params = global.all_gather(&params_t)?.to_vec2::<f32>()?;

        let dim = feature_dim + 7;
        let mut rows: Vec<(u64, usize)> = Vec::with_capacity(all_ids.len());
        for (row, &raw_id) in all_ids.iter().enumerate() {
            if raw_id == PAD_ID {
                continue;
            }
            rows.push((raw_id as u64, row));
        }
        rows.sort_unstable_by_key(|&(id, _)| id);
        for pair in rows.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(SplatGridError::Scene(format!(
                    "point {} gathered from more than one worker",
                    pair[0].0
                )));
            }
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut params = Vec::with_capacity(rows.len() * dim);
        for (id, row) in rows {
            ids.push(id);
            params.extend_from_slice(&all_params[row]);
        }
        Ok(Self {
            ids,
            params,
            feature_dim,
        })
    }

    /// Replica of a single store, no communication. Used by evaluation on a
    /// one-worker grid and by tests.
    pub fn from_store(store: &PointStore, device: &Device) -> Result<Self> {
        let (ids_t, params_t) = store.pack_params(device)?;
        let ids = ids_t
            .to_vec1::<i64>()?
            .into_iter()
            .map(|id| id as u64)
            .collect();
        let params = params_t.to_vec2::<f32>()?.concat();
        Ok(Self {
            ids,
            params,
            feature_dim: store.feature_dim(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The agreed id set, ascending.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn record_dim(&self) -> usize {
        self.feature_dim + 7
    }

    pub fn index_of(&self, id: u64) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    pub fn record(&self, index: usize) -> &[f32] {
        let dim = self.record_dim();
        &self.params[index * dim..(index + 1) * dim]
    }

    pub fn position(&self, index: usize) -> [f32; 3] {
        let r = self.record(index);
        [r[0], r[1], r[2]]
    }

    pub fn features(&self, index: usize) -> &[f32] {
        &self.record(index)[3..3 + self.feature_dim]
    }

    pub fn opacity(&self, index: usize) -> f32 {
        self.record(index)[3 + self.feature_dim]
    }

    pub fn scale(&self, index: usize) -> [f32; 3] {
        let r = self.record(index);
        let f = self.feature_dim;
        [r[4 + f], r[5 + f], r[6 + f]]
    }
}
