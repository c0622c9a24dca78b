//! Learned reward model scoring.
//!
//! A sequence-classification-style scorer: token embeddings are masked
//! mean-pooled and passed through an MLP head that emits one scalar logit
//! per sequence. Plugged into the reward aggregator as the `Model` variant
//! of a reward source, scored over the concatenated prompt+response text.

use crate::tokenizer::ChatTokenizer;
use crate::utils::error::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};

/// Reward model configuration.
#[derive(Debug, Clone)]
pub struct RewardModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
}

impl Default for RewardModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 258,
            hidden_size: 32,
            intermediate_size: 64,
        }
    }
}

/// MLP reward head: hidden -> intermediate -> scalar.
struct RewardHead {
    fc1: Linear,
    fc2: Linear,
}

impl RewardHead {
    fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(hidden_size, intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(intermediate_size, 1, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu()?;
        Ok(self.fc2.forward(&h)?.squeeze(D::Minus1)?)
    }
}

/// Scoring model: embedding backbone + reward head.
pub struct RewardModel {
    embed: Embedding,
    head: RewardHead,
    device: Device,
    config: RewardModelConfig,
}

impl RewardModel {
    pub fn new(config: RewardModelConfig, vb: VarBuilder, device: Device) -> Result<Self> {
        let embed = embedding(config.vocab_size, config.hidden_size, vb.pp("embed"))?;
        let head = RewardHead::new(config.hidden_size, config.intermediate_size, vb.pp("head"))?;
        Ok(Self {
            embed,
            head,
            device,
            config,
        })
    }

    pub fn config(&self) -> &RewardModelConfig {
        &self.config
    }

    /// Score tokenized sequences.
    ///
    /// Args:
    ///   input_ids: (batch, seq) token ids
    ///   attention_mask: (batch, seq) - 1 for real tokens, 0 for padding
    ///
    /// Returns one scalar logit per sequence, shape (batch,).
    pub fn score_tokens(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mask = attention_mask.to_dtype(DType::F32)?;
        let h = self.embed.forward(input_ids)?;

        // Masked mean pool over the sequence dimension.
        let masked = h.broadcast_mul(&mask.unsqueeze(2)?)?;
        let summed = masked.sum(1)?;
        let lengths = mask.sum_keepdim(1)?.maximum(1.0)?;
        let pooled = summed.broadcast_div(&lengths)?;

        self.head.forward(&pooled)
    }

    /// Tokenize and score raw texts with this model's own tokenizer.
    /// Sequences are right-padded to the batch maximum.
    pub fn score_texts(&self, texts: &[String], tokenizer: &dyn ChatTokenizer) -> Result<Vec<f64>> {
        let pad = tokenizer.pad_token_id();
        let encoded: Vec<Vec<u32>> = texts.iter().map(|t| tokenizer.encode(t)).collect();
        let max_len = encoded.iter().map(|e| e.len()).max().unwrap_or(0).max(1);

        let batch = encoded.len();
        let mut flat = Vec::with_capacity(batch * max_len);
        for ids in &encoded {
            flat.extend_from_slice(ids);
            flat.extend(std::iter::repeat(pad).take(max_len - ids.len()));
        }

        let input_ids = Tensor::from_vec(flat, (batch, max_len), &self.device)?;
        let attention_mask = input_ids.ne(pad)?.to_dtype(DType::F32)?;

        let scores = self.score_tokens(&input_ids, &attention_mask)?;
        Ok(scores
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|s| s as f64)
            .collect())
    }
}
