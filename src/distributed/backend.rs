use super::Collective;
use crate::utils::error::{Result, SplatGridError};
use candle_core::Tensor;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
    mailboxes: Mutex<HashMap<(usize, usize), VecDeque<Tensor>>>,
    mail_ready: Condvar,
    subgroups: Mutex<HashMap<Vec<usize>, Arc<SharedState>>>,
}

impl SharedState {
    fn new(size: usize) -> Self {
        Self {
            buffers: Mutex::new((0..size).map(|_| None).collect()),
            barrier: Barrier::new(size),
            mailboxes: Mutex::new(HashMap::new()),
            mail_ready: Condvar::new(),
            subgroups: Mutex::new(HashMap::new()),
        }
    }
}

/// In-process collective backend.
///
/// All members of a group are threads sharing one rendezvous state: a slot
/// buffer per rank plus a barrier for the write/combine phases. Blocking and
/// call-order matching behave exactly like a multi-process backend, which is
/// what makes single-process SPMD tests honest.
pub struct LocalComm {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalComm {
    /// Create one handle per rank over a fresh shared state.
    ///
    /// The returned handles are moved onto one thread each; a thread must
    /// only ever use its own handle.
    pub fn new_group_set(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState::new(world_size));

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Check that every slot holds the same shape and dtype.
    ///
    /// Runs identically on every member over the same buffers, so either all
    /// members succeed or all members observe the same mismatch (fail-stop,
    /// no divergence).
    fn verify_uniform(buffers: &[Option<Tensor>]) -> Result<()> {
        let first = buffers[0]
            .as_ref()
            .ok_or_else(|| SplatGridError::Collective("empty collective slot".to_string()))?;
        for (i, slot) in buffers.iter().enumerate().skip(1) {
            let t = slot
                .as_ref()
                .ok_or_else(|| SplatGridError::Collective("empty collective slot".to_string()))?;
            if t.dims() != first.dims() || t.dtype() != first.dtype() {
                return Err(SplatGridError::Collective(format!(
                    "collective shape mismatch: rank 0 has {:?} {:?}, rank {} has {:?} {:?}",
                    first.dims(),
                    first.dtype(),
                    i,
                    t.dims(),
                    t.dtype()
                )));
            }
        }
        Ok(())
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        // 1. Write to own slot
        {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[self.rank] = Some(tensor.clone());
        }

        // 2. Wait for all writers
        self.shared.barrier.wait();

        // 3. Every member verifies and combines from the same slots
        let combined = {
            let buffers = self.shared.buffers.lock().unwrap();
            Self::verify_uniform(&buffers).and_then(|_| {
                let mut sum = buffers[0].as_ref().unwrap().clone();
                for slot in buffers.iter().skip(1) {
                    sum = (sum + slot.as_ref().unwrap())?;
                }
                Ok(sum)
            })
        };

        // 4. Hold everyone until all reads are done; on a mismatch every
        //    member reaches this point with the same error
        self.shared.barrier.wait();

        combined
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[self.rank] = Some(tensor.clone());
        }

        self.shared.barrier.wait();

        let gathered = {
            let buffers = self.shared.buffers.lock().unwrap();
            Self::verify_uniform(&buffers).and_then(|_| {
                let tensors: Vec<&Tensor> =
                    buffers.iter().map(|t| t.as_ref().unwrap()).collect();
                Ok(Tensor::cat(&tensors, 0)?)
            })
        };

        self.shared.barrier.wait();

        gathered
    }

    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        if root >= self.world_size {
            return Err(SplatGridError::Collective(format!(
                "broadcast root {} out of range for group of {}",
                root, self.world_size
            )));
        }

        if self.rank == root {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[root] = Some(tensor.clone());
        }

        self.shared.barrier.wait();

        let result = {
            let buffers = self.shared.buffers.lock().unwrap();
            buffers[root].as_ref().unwrap().clone()
        };

        self.shared.barrier.wait();

        Ok(result)
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send(&self, tensor: &Tensor, dst: usize) -> Result<()> {
        if dst >= self.world_size {
            return Err(SplatGridError::Collective(format!(
                "send destination {} out of range for group of {}",
                dst, self.world_size
            )));
        }

        let mut mailboxes = self.shared.mailboxes.lock().unwrap();
        mailboxes
            .entry((self.rank, dst))
            .or_default()
            .push_back(tensor.clone());
        self.shared.mail_ready.notify_all();
        Ok(())
    }

    fn recv(&self, src: usize) -> Result<Tensor> {
        if src >= self.world_size {
            return Err(SplatGridError::Collective(format!(
                "recv source {} out of range for group of {}",
                src, self.world_size
            )));
        }

        let key = (src, self.rank);
        let mut mailboxes = self.shared.mailboxes.lock().unwrap();
        loop {
            if let Some(tensor) = mailboxes.get_mut(&key).and_then(|q| q.pop_front()) {
                return Ok(tensor);
            }
            mailboxes = self.shared.mail_ready.wait(mailboxes).unwrap();
        }
    }

    fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn Collective>> {
        if ranks.is_empty() {
            return Err(SplatGridError::Collective(
                "cannot create an empty group".to_string(),
            ));
        }
        for &r in ranks {
            if r >= self.world_size {
                return Err(SplatGridError::Collective(format!(
                    "group member {} out of range for world of {}",
                    r, self.world_size
                )));
            }
        }
        let sub_rank = ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| {
                SplatGridError::Collective(format!(
                    "rank {} is not a member of group {:?}",
                    self.rank, ranks
                ))
            })?;

        // Members rendezvous on the rank list: the first caller creates the
        // scoped state, the rest attach to it.
        let child = {
            let mut subgroups = self.shared.subgroups.lock().unwrap();
            subgroups
                .entry(ranks.to_vec())
                .or_insert_with(|| Arc::new(SharedState::new(ranks.len())))
                .clone()
        };

        Ok(Arc::new(LocalComm {
            rank: sub_rank,
            world_size: ranks.len(),
            shared: child,
        }))
    }
}
