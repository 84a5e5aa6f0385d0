//! Rank-sharded sampling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits a dataset into `world_size` equal shards.
///
/// The index list is shuffled with `seed + epoch` (identically on every rank),
/// extended by wrapping around to a multiple of `world_size`, and rank `r`
/// takes positions `r, r + world_size, ...`.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, rank: usize, world_size: usize, shuffle: bool, seed: u64) -> Self {
        let world_size = world_size.max(1);
        Self {
            dataset_len,
            rank: rank.min(world_size - 1),
            world_size,
            shuffle,
            seed,
        }
    }

    /// Samples drawn by this rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size)
    }

    pub fn indices(&self, epoch: u64) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples() * self.world_size;
        let mut cursor = 0;
        while order.len() < total {
            order.push(order[cursor]);
            cursor += 1;
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
