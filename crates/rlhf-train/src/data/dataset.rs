//! Prompt-only, supervised and placeholder datasets with their collators.

use candle_core::{Device, Tensor};
use rlhf_core::{DatasetSource, Result, RlhfError};
use rlhf_model::tokenizer::pad_to_tensors;
use rlhf_model::{PaddingSide, TextTokenizer};
use tracing::{info, warn};

use crate::batch::{PromptBatch, SupervisedBatch};
use crate::data::template::{read_samples, Template};

/// Indexable samples plus the collator that turns a group of them into a batch.
pub trait Dataset {
    type Item: Clone;
    type Batch;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_item(&self, idx: usize) -> Self::Item;

    fn collate(&self, items: Vec<Self::Item>, device: &Device) -> Result<Self::Batch>;
}

/// Tokenized prompts, collated with left padding for generation.
pub struct PromptOnlyDataset {
    prompts: Vec<Vec<u32>>,
    pad_token_id: u32,
}

impl PromptOnlyDataset {
    /// Prompts that leave no room for a response (at least `model_max_length`
    /// tokens) are dropped.
    pub fn new(source: &DatasetSource, template: Template, tokenizer: &TextTokenizer) -> Result<Self> {
        let samples = read_samples(source)?;
        let total = samples.len();
        let mut prompts = Vec::with_capacity(total);
        for sample in samples {
            let ids = tokenizer.encode(&template.format_prompt(&sample.prompt))?;
            if !ids.is_empty() && ids.len() < tokenizer.model_max_length {
                prompts.push(ids);
            }
        }
        if prompts.len() < total {
            warn!(
                dataset = %source.path,
                dropped = total - prompts.len(),
                model_max_length = tokenizer.model_max_length,
                "dropped prompts that are empty or too long"
            );
        }
        if prompts.is_empty() {
            return Err(RlhfError::Data(format!("no usable prompts in '{}'", source.path)));
        }
        info!(dataset = %source.path, prompts = prompts.len(), "loaded prompt-only dataset");
        Ok(Self::from_token_ids(prompts, tokenizer.pad_token_id()))
    }

    pub fn from_token_ids(prompts: Vec<Vec<u32>>, pad_token_id: u32) -> Self {
        Self { prompts, pad_token_id }
    }
}

impl Dataset for PromptOnlyDataset {
    type Item = Vec<u32>;
    type Batch = PromptBatch;

    fn len(&self) -> usize {
        self.prompts.len()
    }

    fn get_item(&self, idx: usize) -> Vec<u32> {
        self.prompts[idx].clone()
    }

    fn collate(&self, items: Vec<Vec<u32>>, device: &Device) -> Result<PromptBatch> {
        let (input_ids, attention_mask) = pad_to_tensors(&items, self.pad_token_id, PaddingSide::Left, device)?;
        Ok(PromptBatch {
            input_ids,
            attention_mask,
        })
    }
}

/// Prompt + response tokens with a mask over the response part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedSample {
    pub input_ids: Vec<u32>,
    pub loss_mask: Vec<u8>,
}

/// Prompt/response pairs for the PTX objective, collated with right padding.
pub struct SupervisedDataset {
    samples: Vec<SupervisedSample>,
    pad_token_id: u32,
}

impl SupervisedDataset {
    /// Each sample is `prompt + response + EOS`, truncated to
    /// `model_max_length`. Records without a response, or whose response is
    /// truncated away entirely, are skipped.
    pub fn new(source: &DatasetSource, template: Template, tokenizer: &TextTokenizer) -> Result<Self> {
        let records = read_samples(source)?;
        let total = records.len();
        let eos = tokenizer.special().eos;
        let mut samples = Vec::with_capacity(total);
        for record in records {
            let Some(response) = record.response else {
                continue;
            };
            let prompt_ids = tokenizer.encode(&template.format_prompt(&record.prompt))?;
            let mut response_ids = tokenizer.encode(&response)?;
            response_ids.extend(eos);
            if let Some(sample) = supervised_sample(&prompt_ids, &response_ids, tokenizer.model_max_length) {
                samples.push(sample);
            }
        }
        if samples.len() < total {
            warn!(
                dataset = %source.path,
                skipped = total - samples.len(),
                "skipped supervised records without a usable response"
            );
        }
        info!(dataset = %source.path, samples = samples.len(), "loaded supervised dataset");
        Ok(Self::from_samples(samples, tokenizer.pad_token_id()))
    }

    pub fn from_samples(samples: Vec<SupervisedSample>, pad_token_id: u32) -> Self {
        Self { samples, pad_token_id }
    }
}

fn supervised_sample(prompt: &[u32], response: &[u32], max_len: usize) -> Option<SupervisedSample> {
    let mut input_ids: Vec<u32> = prompt.iter().chain(response).copied().collect();
    let mut loss_mask: Vec<u8> = std::iter::repeat_n(0u8, prompt.len())
        .chain(std::iter::repeat_n(1u8, response.len()))
        .collect();
    input_ids.truncate(max_len);
    loss_mask.truncate(max_len);
    // The first token is never a target.
    let has_target = loss_mask.iter().skip(1).any(|&m| m == 1);
    has_target.then_some(SupervisedSample { input_ids, loss_mask })
}

impl Dataset for SupervisedDataset {
    type Item = SupervisedSample;
    type Batch = SupervisedBatch;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get_item(&self, idx: usize) -> SupervisedSample {
        self.samples[idx].clone()
    }

    fn collate(&self, items: Vec<SupervisedSample>, device: &Device) -> Result<SupervisedBatch> {
        let ids: Vec<Vec<u32>> = items.iter().map(|s| s.input_ids.clone()).collect();
        let (input_ids, attention_mask) = pad_to_tensors(&ids, self.pad_token_id, PaddingSide::Right, device)?;
        let (_, width) = input_ids.dims2()?;
        let loss_mask: Vec<u8> = items
            .iter()
            .flat_map(|s| {
                let pad = width - s.loss_mask.len();
                s.loss_mask.iter().copied().chain(std::iter::repeat_n(0u8, pad))
            })
            .collect();
        let loss_mask = Tensor::from_vec(loss_mask, (items.len(), width), device)?;
        Ok(SupervisedBatch {
            input_ids,
            attention_mask,
            loss_mask,
        })
    }
}
