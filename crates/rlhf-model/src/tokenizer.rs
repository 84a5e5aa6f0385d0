//! HuggingFace `tokenizers` wrapper with padding, special tokens and
//! cross-tokenizer re-encoding.

use std::path::Path;

use candle_core::{Device, Tensor};
use rlhf_core::error::{config_error, Result, RlhfError};

use crate::config::ModelConfig;

fn tok_err(context: &str, e: impl std::fmt::Display) -> RlhfError {
    RlhfError::Tokenizer(format!("{context}: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub unk: Option<u32>,
}

const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<eos>"];
const BOS_CANDIDATES: &[&str] = &["<s>", "<|startoftext|>", "<bos>"];
const UNK_CANDIDATES: &[&str] = &["<unk>", "[UNK]", "<|unk|>"];

#[derive(Clone)]
pub struct TextTokenizer {
    inner: tokenizers::Tokenizer,
    special: SpecialTokens,
    pad_id: u32,
    pub padding_side: PaddingSide,
    pub model_max_length: usize,
}

impl TextTokenizer {
    /// Load `tokenizer.json`. Ids in `config` win over well-known token strings.
    pub fn from_file(
        path: &Path,
        config: &ModelConfig,
        model_max_length: usize,
        padding_side: PaddingSide,
    ) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| tok_err(&format!("failed to load {}", path.display()), e))?;
        Self::from_tokenizer(inner, config, model_max_length, padding_side)
    }

    /// Fails without a pad token distinct from EOS.
    pub fn from_tokenizer(
        inner: tokenizers::Tokenizer,
        config: &ModelConfig,
        model_max_length: usize,
        padding_side: PaddingSide,
    ) -> Result<Self> {
        let lookup = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));
        let special = SpecialTokens {
            bos: config.bos_token_id.or_else(|| lookup(BOS_CANDIDATES)),
            eos: config.eos_token_id.or_else(|| lookup(EOS_CANDIDATES)),
            pad: config.pad_token_id.or_else(|| lookup(PAD_CANDIDATES)),
            unk: config.unk_token_id.or_else(|| lookup(UNK_CANDIDATES)),
        };
        let pad_id = match (special.pad, special.eos) {
            (None, _) => return Err(config_error("tokenizer has no pad token")),
            (Some(pad), Some(eos)) if pad == eos => {
                return Err(config_error(format!("tokenizer pad token id {pad} is the EOS token id")))
            }
            (Some(pad), _) => pad,
        };
        Ok(Self {
            inner,
            special,
            pad_id,
            padding_side,
            model_max_length,
        })
    }

    /// Whitespace word-level tokenizer over `words`, with `<pad>`, `<unk>`,
    /// `<s>` and `</s>` at ids 0..4. Enough for smoke runs without downloads.
    pub fn word_level(words: &[&str], model_max_length: usize) -> Result<Self> {
        let specials = ["<pad>", "<unk>", "<s>", "</s>"];
        let mut vocab = serde_json::Map::new();
        for (i, token) in specials.iter().chain(words.iter()).enumerate() {
            vocab.entry(token.to_string()).or_insert(serde_json::json!(i));
        }
        let added: Vec<_> = specials
            .iter()
            .enumerate()
            .map(|(id, content)| {
                serde_json::json!({
                    "id": id, "content": content, "single_word": false, "lstrip": false,
                    "rstrip": false, "normalized": false, "special": true
                })
            })
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        let bytes = serde_json::to_vec(&json)?;
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| tok_err("failed to build word-level tokenizer", e))?;
        let mut config = ModelConfig::tiny(0);
        config.pad_token_id = Some(0);
        config.unk_token_id = Some(1);
        config.bos_token_id = Some(2);
        config.eos_token_id = Some(3);
        Self::from_tokenizer(inner, &config, model_max_length, PaddingSide::Right)
    }

    pub fn with_padding_side(mut self, side: PaddingSide) -> Self {
        self.padding_side = side;
        self
    }

    pub fn special(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    pub fn eos_token(&self) -> Option<String> {
        self.special.eos.and_then(|id| self.inner.id_to_token(id))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| tok_err("encoding failed", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn is_special(&self, id: u32) -> bool {
        let s = &self.special;
        [s.bos, s.eos, s.pad, s.unk].contains(&Some(id))
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let ids: Vec<u32> = if skip_special_tokens {
            ids.iter().copied().filter(|&id| !self.is_special(id)).collect()
        } else {
            ids.to_vec()
        };
        self.inner
            .decode(&ids, skip_special_tokens)
            .map_err(|e| tok_err("decoding failed", e))
    }

    pub fn decode_batch(&self, rows: &[Vec<u32>], skip_special_tokens: bool) -> Result<Vec<String>> {
        rows.iter()
            .map(|row| self.decode(row, skip_special_tokens))
            .collect()
    }

    /// Encode and pad to the longest row, truncating to `model_max_length`.
    pub fn encode_batch(&self, texts: &[String], device: &Device) -> Result<(Tensor, Tensor)> {
        let seqs = texts
            .iter()
            .map(|t| {
                let mut ids = self.encode(t)?;
                ids.truncate(self.model_max_length);
                Ok(ids)
            })
            .collect::<Result<Vec<_>>>()?;
        self.pad_to_tensors(&seqs, device)
    }

    /// Encode and pad to the longest row, keeping every token.
    pub fn encode_batch_untruncated(&self, texts: &[String], device: &Device) -> Result<(Tensor, Tensor)> {
        let seqs = texts.iter().map(|t| self.encode(t)).collect::<Result<Vec<_>>>()?;
        self.pad_to_tensors(&seqs, device)
    }

    /// Pad with this tokenizer's pad id and padding side.
    pub fn pad_to_tensors(&self, seqs: &[Vec<u32>], device: &Device) -> Result<(Tensor, Tensor)> {
        pad_to_tensors(seqs, self.pad_token_id(), self.padding_side, device)
    }

    /// Same vocabulary and special tokens.
    pub fn is_same_as(&self, other: &TextTokenizer) -> bool {
        self.special == other.special && self.inner.get_vocab(true) == other.inner.get_vocab(true)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join("tokenizer.json");
        self.inner
            .save(&path, false)
            .map_err(|e| tok_err(&format!("failed to save {}", path.display()), e))
    }
}

/// Pad rows to the longest one. Returns (padded ids, 0/1 mask) as vectors.
pub fn pad_sequences(seqs: &[Vec<u32>], pad_id: u32, side: PaddingSide) -> (Vec<Vec<u32>>, Vec<Vec<u8>>) {
    let max_len = seqs.iter().map(Vec::len).max().unwrap_or(0);
    seqs.iter()
        .map(|seq| {
            let n_pad = max_len - seq.len();
            let pad = std::iter::repeat_n(pad_id, n_pad);
            let zeros = std::iter::repeat_n(0u8, n_pad);
            let ones = std::iter::repeat_n(1u8, seq.len());
            match side {
                PaddingSide::Left => (
                    pad.chain(seq.iter().copied()).collect(),
                    zeros.chain(ones).collect(),
                ),
                PaddingSide::Right => (
                    seq.iter().copied().chain(pad).collect(),
                    ones.chain(zeros).collect(),
                ),
            }
        })
        .unzip()
}

/// [`pad_sequences`] as u32 ids `[B, T]` and u8 mask `[B, T]`.
pub fn pad_to_tensors(
    seqs: &[Vec<u32>],
    pad_id: u32,
    side: PaddingSide,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let (ids, mask) = pad_sequences(seqs, pad_id, side);
    let b = ids.len();
    let t = ids.first().map(Vec::len).unwrap_or(0);
    let ids = Tensor::from_vec(ids.concat(), (b, t), device)?;
    let mask = Tensor::from_vec(mask.concat(), (b, t), device)?;
    Ok((ids, mask))
}

/// Re-encode token ids from `src` into `dest`: decode without special
/// tokens, append `dest`'s EOS token, encode without truncation, pad to the
/// longest row.
pub fn batch_retokenize(
    input_ids: &Tensor,
    src: &TextTokenizer,
    dest: &TextTokenizer,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let rows = input_ids.to_vec2::<u32>()?;
    let eos = dest.eos_token().unwrap_or_default();
    let texts = src
        .decode_batch(&rows, true)?
        .into_iter()
        .map(|text| format!("{text}{eos}"))
        .collect::<Vec<_>>();
    dest.encode_batch_untruncated(&texts, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> Vec<&'static str> {
        vec!["hello", "world", "how", "are", "you"]
    }

    #[test]
    fn test_word_level_specials() {
        let tok = TextTokenizer::word_level(&words(), 16).unwrap();
        assert_eq!(tok.vocab_size(), 9);
        assert_eq!(tok.pad_token_id(), 0);
        assert_eq!(tok.special().eos, Some(3));
        assert_eq!(tok.eos_token().as_deref(), Some("</s>"));
    }

    #[test]
    fn test_encode_decode_skip_special() {
        let tok = TextTokenizer::word_level(&words(), 16).unwrap();
        let ids = tok.encode("hello world</s>").unwrap();
        assert_eq!(ids, vec![4, 5, 3]);
        assert_eq!(tok.decode(&[0, 0, 4, 5, 3], true).unwrap(), "hello world");
        assert_eq!(tok.encode("goodbye").unwrap(), vec![1]);
    }

    #[test]
    fn test_pad_sequences_both_sides() {
        let seqs = vec![vec![7, 8, 9], vec![5]];
        let (ids, mask) = pad_sequences(&seqs, 0, PaddingSide::Left);
        assert_eq!(ids[1], vec![0, 0, 5]);
        assert_eq!(mask[1], vec![0, 0, 1]);
        let (ids, mask) = pad_sequences(&seqs, 0, PaddingSide::Right);
        assert_eq!(ids[1], vec![5, 0, 0]);
        assert_eq!(mask[0], vec![1, 1, 1]);
    }

    #[test]
    fn test_encode_batch_truncates() {
        let tok = TextTokenizer::word_level(&words(), 2).unwrap();
        let texts = vec!["hello world how".to_string(), "you".to_string()];
        let (ids, mask) = tok.encode_batch(&texts, &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 2]);
        assert_eq!(mask.to_vec2::<u8>().unwrap()[1], vec![1, 0]);
    }

    #[test]
    fn test_retokenize_appends_eos() {
        let src = TextTokenizer::word_level(&["hello", "world"], 16).unwrap();
        let dest = TextTokenizer::word_level(&["world", "hello"], 16).unwrap();
        assert!(!src.is_same_as(&dest));
        assert!(src.is_same_as(&TextTokenizer::word_level(&["hello", "world"], 16).unwrap()));

        let ids = Tensor::new(&[[4u32, 5, 3], [5, 0, 0]], &Device::Cpu).unwrap();
        let (out, mask) = batch_retokenize(&ids, &src, &dest, &Device::Cpu).unwrap();
        let out = out.to_vec2::<u32>().unwrap();
        assert_eq!(out[0], vec![5, 4, 3]);
        assert_eq!(out[1], vec![4, 3, 0]);
        assert_eq!(mask.to_vec2::<u8>().unwrap()[1], vec![1, 1, 0]);
    }

    #[test]
    fn test_retokenize_keeps_eos_past_max_length() {
        let src = TextTokenizer::word_level(&words(), 16).unwrap();
        let dest = TextTokenizer::word_level(&["you", "are", "how", "world", "hello"], 2).unwrap();
        let ids = Tensor::new(&[[4u32, 5, 6, 7, 8]], &Device::Cpu).unwrap();
        let (out, mask) = batch_retokenize(&ids, &src, &dest, &Device::Cpu).unwrap();
        let out = out.to_vec2::<u32>().unwrap();
        assert_eq!(out[0].len(), 6);
        assert_eq!(out[0].last(), Some(&3));
        assert_eq!(mask.to_vec2::<u8>().unwrap()[0], vec![1; 6]);
    }

    fn bare_tokenizer() -> tokenizers::Tokenizer {
        let tok = TextTokenizer::word_level(&words(), 16).unwrap();
        tok.inner
    }

    #[test]
    fn test_pad_must_exist_and_differ_from_eos() {
        let mut config = ModelConfig::tiny(9);
        config.pad_token_id = Some(3);
        config.eos_token_id = Some(3);
        let err = TextTokenizer::from_tokenizer(bare_tokenizer(), &config, 16, PaddingSide::Left)
            .err()
            .unwrap();
        assert!(matches!(err, RlhfError::Config(_)));

        let json = serde_json::json!({
            "version": "1.0", "truncation": null, "padding": null, "added_tokens": [],
            "normalizer": null, "pre_tokenizer": { "type": "Whitespace" }, "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": { "[UNK]": 0, "hi": 1 }, "unk_token": "[UNK]" }
        });
        let no_pad = tokenizers::Tokenizer::from_bytes(serde_json::to_vec(&json).unwrap()).unwrap();
        let err = TextTokenizer::from_tokenizer(no_pad, &ModelConfig::tiny(2), 16, PaddingSide::Left)
            .err()
            .unwrap();
        assert!(matches!(err, RlhfError::Config(_)));

        config.pad_token_id = Some(0);
        let tok = TextTokenizer::from_tokenizer(bare_tokenizer(), &config, 16, PaddingSide::Left).unwrap();
        assert_eq!(tok.pad_token_id(), 0);
    }
}
