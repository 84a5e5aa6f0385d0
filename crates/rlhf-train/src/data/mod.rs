//! Datasets, collators and sharded loaders.

pub mod dataset;
pub mod loader;
pub mod sampler;
pub mod template;

pub use dataset::{Dataset, PromptOnlyDataset, SupervisedDataset, SupervisedSample};
pub use loader::DataLoader;
pub use sampler::DistributedSampler;
pub use template::Template;
