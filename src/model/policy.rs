//! Policy model collaborator.
//!
//! The trainer talks to the generative model through the `CausalLM` seam:
//! a teacher-forced forward pass producing next-token logits. Generation is
//! layered on top by the sample generator, so any candle model that exposes
//! logits can be trained.
//!
//! `TinyCausalLM` is the built-in model used by the demo binary and the test
//! suite: an embedding, a GELU feed-forward block, and a vocabulary head.
//! Logits at position `t` depend only on the token at `t`, which keeps the
//! model trivially causal.

use crate::utils::error::{GrpoError, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};

/// Forward interface required of a trainable policy (and of the frozen
/// reference snapshot).
pub trait CausalLM {
    /// Next-token logits `[batch, seq, vocab]` for the given token ids and
    /// attention mask (1.0 for real tokens, 0.0 for padding).
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn vocab_size(&self) -> usize;
}

/// Configuration for the built-in test/demo model.
#[derive(Debug, Clone)]
pub struct TinyCausalLMConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_hidden: usize,
}

impl Default for TinyCausalLMConfig {
    fn default() -> Self {
        Self {
            vocab_size: 258,
            d_model: 32,
            d_hidden: 64,
        }
    }
}

/// Minimal trainable causal LM: embed -> GELU MLP -> vocab head.
pub struct TinyCausalLM {
    embed: Embedding,
    fc: Linear,
    head: Linear,
    config: TinyCausalLMConfig,
}

impl TinyCausalLM {
    pub fn new(config: TinyCausalLMConfig, vb: VarBuilder) -> Result<Self> {
        let embed = embedding(config.vocab_size, config.d_model, vb.pp("embed"))?;
        let fc = linear(config.d_model, config.d_hidden, vb.pp("fc"))?;
        let head = linear(config.d_hidden, config.vocab_size, vb.pp("head"))?;
        Ok(Self {
            embed,
            fc,
            head,
            config,
        })
    }

    pub fn config(&self) -> &TinyCausalLMConfig {
        &self.config
    }

    /// Build an independent frozen copy of the model described by `source`.
    ///
    /// The snapshot gets its own variables and its own storage; the values
    /// are copied over, so later optimizer steps on the live policy cannot
    /// alias into it. Used for the KL reference model.
    pub fn frozen_snapshot(
        config: &TinyCausalLMConfig,
        source: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        let snapshot_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&snapshot_map, DType::F32, device);
        let model = Self::new(config.clone(), vb)?;

        let src = source.data().lock().unwrap();
        let dst = snapshot_map.data().lock().unwrap();
        for (name, var) in src.iter() {
            let target = dst.get(name).ok_or_else(|| {
                GrpoError::Training(format!("parameter {} missing from snapshot", name))
            })?;
            target.set(var.as_tensor())?;
        }

        Ok(model)
    }
}

impl CausalLM for TinyCausalLM {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let h = self.embed.forward(input_ids)?;
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let h = h.broadcast_mul(&mask)?;
        let h = self.fc.forward(&h)?.gelu()?;
        let logits = self.head.forward(&h)?;
        Ok(logits)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

/// Count trainable parameters in a varmap.
pub fn num_parameters(varmap: &VarMap) -> usize {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(_, v)| v.as_tensor().elem_count())
        .sum()
}
