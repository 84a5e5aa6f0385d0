//! Data-parallel collectives over local worker threads.
//!
//! Every worker runs the same control flow; they meet at barriers and exchange
//! tensors only through [`Collective::all_reduce`] / [`Collective::broadcast`].
//! Rank 0 collects, reduces and sends the result back.

use std::sync::{Arc, Barrier};

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::{bounded, Receiver, Sender};
use rlhf_core::{Result, RlhfError};
use rlhf_model::StopSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    fn barrier(&self);

    /// Elementwise reduction; every rank receives the same result.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Rank 0's tensor, on every rank.
    fn broadcast(&self, tensor: &Tensor) -> Result<Tensor>;

    fn all_reduce_scalar(&self, value: f64, op: ReduceOp) -> Result<f64> {
        if self.world_size() <= 1 {
            return Ok(value);
        }
        let t = Tensor::new(&[value], &Device::Cpu)?;
        let reduced = self.all_reduce(&t, op)?;
        Ok(reduced.to_dtype(DType::F64)?.to_vec1::<f64>()?[0])
    }
}

/// Single worker: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

/// Channels and barrier shared by all workers of one process.
pub struct ThreadGroup {
    world_size: usize,
    barrier: Barrier,
    // Worker rank -> rank 0.
    to_main: Vec<(Sender<Tensor>, Receiver<Tensor>)>,
    // Rank 0 -> worker rank.
    from_main: Vec<(Sender<Tensor>, Receiver<Tensor>)>,
}

impl ThreadGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        let world_size = world_size.max(1);
        Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            to_main: (0..world_size).map(|_| bounded(1)).collect(),
            from_main: (0..world_size).map(|_| bounded(1)).collect(),
        })
    }

    /// One handle per rank, to be moved into the worker threads.
    pub fn handles(self: &Arc<Self>) -> Vec<ThreadCollective> {
        (0..self.world_size)
            .map(|rank| ThreadCollective {
                rank,
                group: Arc::clone(self),
            })
            .collect()
    }
}

pub struct ThreadCollective {
    rank: usize,
    group: Arc<ThreadGroup>,
}

fn channel_error(what: &str, rank: usize) -> RlhfError {
    RlhfError::Collective(format!("{what} failed on rank {rank}: peer worker is gone"))
}

impl ThreadCollective {
    fn send_to_main(&self, t: Tensor) -> Result<()> {
        self.group.to_main[self.rank]
            .0
            .send(t)
            .map_err(|_| channel_error("send", self.rank))
    }

    fn recv_from_main(&self) -> Result<Tensor> {
        self.group.from_main[self.rank]
            .1
            .recv()
            .map_err(|_| channel_error("receive", self.rank))
    }

    fn scatter_from_main(&self, t: &Tensor) -> Result<()> {
        for peer in 1..self.group.world_size {
            self.group.from_main[peer]
                .0
                .send(t.clone())
                .map_err(|_| channel_error("send", 0))?;
        }
        Ok(())
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let ws = self.group.world_size;
        if ws <= 1 {
            return Ok(tensor.clone());
        }
        if self.rank == 0 {
            let mut acc = tensor.clone();
            for peer in 1..ws {
                let other = self.group.to_main[peer]
                    .1
                    .recv()
                    .map_err(|_| channel_error("receive", 0))?
                    .to_device(tensor.device())?;
                acc = match op {
                    ReduceOp::Sum | ReduceOp::Mean => (acc + other)?,
                    ReduceOp::Max => acc.maximum(&other)?,
                };
            }
            if op == ReduceOp::Mean {
                acc = (acc / ws as f64)?;
            }
            self.scatter_from_main(&acc)?;
            Ok(acc)
        } else {
            self.send_to_main(tensor.clone())?;
            Ok(self.recv_from_main()?.to_device(tensor.device())?)
        }
    }

    fn broadcast(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.group.world_size <= 1 {
            return Ok(tensor.clone());
        }
        if self.rank == 0 {
            self.scatter_from_main(tensor)?;
            Ok(tensor.clone())
        } else {
            Ok(self.recv_from_main()?.to_device(tensor.device())?)
        }
    }
}

/// Generation stops only when no rank has unfinished rows.
pub struct SyncedStop<'a>(pub &'a dyn Collective);

impl StopSync for SyncedStop<'_> {
    fn any_unfinished(&self, local_unfinished: bool) -> candle_core::Result<bool> {
        let flag = if local_unfinished { 1.0 } else { 0.0 };
        let any = self
            .0
            .all_reduce_scalar(flag, ReduceOp::Max)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        Ok(any > 0.0)
    }
}
