//! Batched iteration over a rank's shard.

use candle_core::Device;
use rlhf_core::Result;

use crate::data::dataset::Dataset;
use crate::data::sampler::DistributedSampler;

pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    sampler: DistributedSampler,
    device: Device,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, sampler: DistributedSampler, device: &Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            sampler,
            device: device.clone(),
        }
    }

    /// Batches per epoch on this rank; the last one may be short.
    pub fn len(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn iter(&self, epoch: u64) -> Batches<'_, D> {
        Batches {
            loader: self,
            indices: self.sampler.indices(epoch),
            pos: 0,
        }
    }
}

pub struct Batches<'a, D> {
    loader: &'a DataLoader<D>,
    indices: Vec<usize>,
    pos: usize,
}

impl<D: Dataset> Iterator for Batches<'_, D> {
    type Item = Result<D::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.indices.len());
        let items = self.indices[self.pos..end]
            .iter()
            .map(|&idx| self.loader.dataset.get_item(idx))
            .collect();
        self.pos = end;
        Some(self.loader.dataset.collate(items, &self.loader.device))
    }
}
