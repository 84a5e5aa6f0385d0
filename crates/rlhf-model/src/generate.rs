//! Autoregressive sampling with temperature, nucleus (top-p) filtering and
//! repetition penalty.

use std::cmp::Ordering;

use candle_core::{DType, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Total length (prompt + response) to stop at.
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f64,
    /// Greedy decoding when false.
    pub do_sample: bool,
    pub eos_token_id: Option<u32>,
    pub pad_token_id: u32,
}

/// Agreement on when to stop when several workers generate in lockstep.
pub trait StopSync {
    /// Given whether this worker still has work, report whether any worker does.
    fn any_unfinished(&self, local_unfinished: bool) -> Result<bool>;
}

/// Single worker: stop as soon as local generation is done.
pub struct LocalStop;

impl StopSync for LocalStop {
    fn any_unfinished(&self, local_unfinished: bool) -> Result<bool> {
        Ok(local_unfinished)
    }
}

/// Extend `input_ids` until every row emitted EOS or `max_length` is reached.
///
/// `logits_fn(ids, mask)` must return logits `[B, T, vocab]`. Rows that
/// finished early are filled with the pad id. A worker whose rows are all done
/// keeps answering `sync` until every worker is done, without running the model.
pub fn generate<F>(
    mut logits_fn: F,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    cfg: &GenerationConfig,
    rng: &mut StdRng,
    sync: &dyn StopSync,
) -> Result<Tensor>
where
    F: FnMut(&Tensor, &Tensor) -> Result<Tensor>,
{
    let device = input_ids.device();
    let mut ids = input_ids.to_vec2::<u32>()?;
    let mut mask = attention_mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
    let batch = ids.len();
    let mut cur_len = ids.first().map(Vec::len).unwrap_or(0);
    let mut finished = vec![false; batch];

    loop {
        let local_unfinished = finished.iter().any(|f| !f) && cur_len < cfg.max_length;
        if !sync.any_unfinished(local_unfinished)? {
            break;
        }
        if !local_unfinished {
            continue;
        }

        let ids_t = Tensor::from_vec(ids.concat(), (batch, cur_len), device)?;
        let mask_t = Tensor::from_vec(mask.concat(), (batch, cur_len), device)?;
        let logits = logits_fn(&ids_t, &mask_t)?;
        let last = logits
            .narrow(1, cur_len - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        for (i, row_logits) in last.into_iter().enumerate() {
            let next = if finished[i] {
                cfg.pad_token_id
            } else {
                let history: Vec<u32> = ids[i]
                    .iter()
                    .zip(&mask[i])
                    .filter(|(_, m)| **m != 0)
                    .map(|(&t, _)| t)
                    .collect();
                sample_next(row_logits, &history, cfg, rng)
            };
            mask[i].push(u8::from(!finished[i]));
            ids[i].push(next);
            if cfg.eos_token_id == Some(next) {
                finished[i] = true;
            }
        }
        cur_len += 1;
    }

    Tensor::from_vec(ids.concat(), (batch, cur_len), device)
}

/// Pick the next token from one row of logits.
pub fn sample_next(mut logits: Vec<f32>, history: &[u32], cfg: &GenerationConfig, rng: &mut StdRng) -> u32 {
    apply_repetition_penalty(&mut logits, history, cfg.repetition_penalty);
    if !cfg.do_sample {
        return argmax(&logits);
    }

    let temp = cfg.temperature.max(1e-5);
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let mut probs: Vec<f64> = logits
        .iter()
        .map(|&v| ((v as f64 - max_logit) / temp).exp())
        .collect();
    let mass: f64 = probs.iter().sum();
    if !(mass > 0.0) {
        return argmax(&logits);
    }
    for p in &mut probs {
        *p /= mass;
    }

    let keep = nucleus(&probs, cfg.top_p);
    let kept_mass: f64 = keep.iter().map(|&i| probs[i]).sum();
    let r = rng.gen::<f64>() * kept_mass;
    let mut cumulative = 0.0;
    for &i in &keep {
        cumulative += probs[i];
        if r < cumulative {
            return i as u32;
        }
    }
    keep.last().copied().unwrap_or(0) as u32
}

/// Penalize every token already present: positive logits divided by the
/// penalty, negative ones multiplied.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f64) {
    if (penalty - 1.0).abs() < f64::EPSILON {
        return;
    }
    let penalty = penalty as f32;
    let mut seen = vec![false; logits.len()];
    for &t in history {
        let t = t as usize;
        if t < logits.len() && !seen[t] {
            seen[t] = true;
            let v = logits[t];
            logits[t] = if v < 0.0 { v * penalty } else { v / penalty };
        }
    }
}

/// Smallest prefix of tokens (by descending probability) whose mass reaches
/// `top_p`. Always holds at least one token.
pub fn nucleus(probs: &[f64], top_p: f64) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..probs.len()).collect();
    idx.sort_by(|a, b| probs[*b].partial_cmp(&probs[*a]).unwrap_or(Ordering::Equal));
    if top_p >= 1.0 {
        return idx;
    }
    let mut cumulative = 0.0;
    let mut cut = idx.len();
    for (n, &i) in idx.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= top_p {
            cut = n + 1;
            break;
        }
    }
    idx.truncate(cut.max(1));
    idx
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}
