//! Group sample generation.
//!
//! For each prompt the generator renders the chat template with the fixed
//! system prompt, left-pads the prompt to `max_prompt_length`, and samples
//! `num_generations` continuations from the current policy. All sequences in
//! a group share one fixed shape: `max_prompt_length + max_generate_length`
//! columns, right-padded with the tokenizer's pad id. Sampling must stay
//! stochastic: greedy decoding would collapse intra-group variance and with
//! it the advantage normalization.

use crate::model::policy::CausalLM;
use crate::tokenizer::ChatTokenizer;
use crate::utils::config::GrpoConfig;
use crate::utils::error::{GrpoError, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

/// System prompt applied to every dataset prompt via the chat template.
pub const SYSTEM_PROMPT: &str =
    "Let's think step by step and output the final answer within \\boxed{}.";

/// Stochastic decoding parameters.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 1.0,
            top_k: 50,
        }
    }
}

/// One prompt's group of sampled sequences in fixed-shape tensors.
#[derive(Debug, Clone)]
pub struct SampleGroup {
    /// `[num_generations, max_prompt_length + max_generate_length]` u32
    pub prompt_response_ids: Tensor,
    /// `[num_generations, max_generate_length]` u32
    pub response_ids: Tensor,
    /// 1.0 for non-pad tokens over the full sequence
    pub attention_mask: Tensor,
    /// 1.0 for response tokens that are neither pad nor eos
    pub action_mask: Tensor,
    /// Response-span width; the trailing columns credited by the loss
    pub num_actions: usize,
    /// Per-sequence count of credited tokens
    pub response_lengths: Vec<usize>,
    pub prompt: String,
    pub answer: Option<String>,
}

/// Samples response groups from the current policy.
pub struct SampleGenerator {
    num_generations: usize,
    max_prompt_length: usize,
    max_generate_length: usize,
    params: SamplingParams,
    system_prompt: String,
    device: Device,
    rng: StdRng,
}

impl SampleGenerator {
    pub fn new(
        num_generations: usize,
        max_prompt_length: usize,
        max_generate_length: usize,
        params: SamplingParams,
        device: Device,
        rng: StdRng,
    ) -> Self {
        Self {
            num_generations,
            max_prompt_length,
            max_generate_length,
            params,
            system_prompt: SYSTEM_PROMPT.to_string(),
            device,
            rng,
        }
    }

    pub fn from_config(config: &GrpoConfig, device: Device, rng: StdRng) -> Self {
        Self::new(
            config.num_generations,
            config.max_prompt_length,
            config.max_generate_length,
            SamplingParams {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
            },
            device,
            rng,
        )
    }

    /// Chat-templated prompt ids, truncated then left-padded to
    /// `max_prompt_length`.
    fn padded_prompt_ids(&self, tokenizer: &dyn ChatTokenizer, prompt: &str) -> Vec<u32> {
        let templated = tokenizer.apply_chat_template(&self.system_prompt, prompt);
        let mut ids = tokenizer.encode(&templated);
        ids.truncate(self.max_prompt_length);

        let pad = tokenizer.pad_token_id();
        let mut row = vec![pad; self.max_prompt_length - ids.len()];
        row.extend_from_slice(&ids);
        row
    }

    /// Sample one group of responses for a prompt.
    pub fn generate_group<M: CausalLM + ?Sized>(
        &mut self,
        model: &M,
        tokenizer: &dyn ChatTokenizer,
        prompt: &str,
        answer: Option<&str>,
    ) -> Result<SampleGroup> {
        let pad = tokenizer.pad_token_id();
        let eos = tokenizer.eos_token_id();
        let g = self.num_generations;
        let total_len = self.max_prompt_length + self.max_generate_length;

        let prompt_row = self.padded_prompt_ids(tokenizer, prompt);
        let mut rows: Vec<Vec<u32>> = vec![prompt_row; g];
        let mut finished = vec![false; g];

        for _ in 0..self.max_generate_length {
            if finished.iter().all(|&f| f) {
                break;
            }
            let cur_len = rows[0].len();
            let flat: Vec<u32> = rows.iter().flatten().copied().collect();
            let input_ids = Tensor::from_vec(flat, (g, cur_len), &self.device)?;
            let attention_mask = input_ids.ne(pad)?.to_dtype(DType::F32)?;

            let logits = model.forward(&input_ids, &attention_mask)?;
            let dims = logits.dims3()?;
            if dims.0 != g || dims.1 != cur_len {
                return Err(GrpoError::Generation(format!(
                    "model returned logits of shape {:?} for input [{}, {}]",
                    dims, g, cur_len
                )));
            }

            let last = logits
                .i((.., cur_len - 1, ..))?
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?;

            for (i, row) in rows.iter_mut().enumerate() {
                if finished[i] {
                    row.push(pad);
                    continue;
                }
                let token = sample_token(&last[i], &self.params, &mut self.rng)?;
                row.push(token);
                if token == eos {
                    finished[i] = true;
                }
            }
        }

        // Uniform shape: right-pad every row to the fixed total length.
        for row in rows.iter_mut() {
            debug_assert!(row.len() <= total_len);
            row.resize(total_len, pad);
        }

        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        let prompt_response_ids = Tensor::from_vec(flat, (g, total_len), &self.device)?;
        let attention_mask = prompt_response_ids.ne(pad)?.to_dtype(DType::F32)?;

        let response_ids = prompt_response_ids
            .narrow(1, self.max_prompt_length, self.max_generate_length)?
            .contiguous()?;
        let not_pad = response_ids.ne(pad)?.to_dtype(DType::F32)?;
        let not_eos = response_ids.ne(eos)?.to_dtype(DType::F32)?;
        let action_mask = (&not_pad * &not_eos)?;

        let response_lengths = action_mask
            .sum(1)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|l| l as usize)
            .collect();

        Ok(SampleGroup {
            prompt_response_ids,
            response_ids,
            attention_mask,
            action_mask,
            num_actions: self.max_generate_length,
            response_lengths,
            prompt: prompt.to_string(),
            answer: answer.map(|a| a.to_string()),
        })
    }
}

/// Draw one token: temperature scale, top-k cutoff, top-p nucleus, then a
/// weighted draw over the surviving candidates.
fn sample_token(logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Result<u32> {
    if logits.is_empty() {
        return Err(GrpoError::Generation("model produced empty logits".into()));
    }

    let inv_temp = (1.0 / params.temperature) as f32;
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_unstable_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if params.top_k > 0 && params.top_k < indices.len() {
        indices.truncate(params.top_k);
    }

    let max_scaled = logits[indices[0]] * inv_temp;
    let mut weights: Vec<f32> = indices
        .iter()
        .map(|&i| (logits[i] * inv_temp - max_scaled).exp())
        .collect();

    let total: f32 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(GrpoError::Generation(
            "degenerate sampling distribution".into(),
        ));
    }

    if params.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut cut = weights.len();
        for (i, w) in weights.iter().enumerate() {
            cumulative += w / total;
            if cumulative >= params.top_p as f32 {
                cut = i + 1;
                break;
            }
        }
        weights.truncate(cut);
        indices.truncate(cut);
    }

    let dist = WeightedIndex::new(&weights)
        .map_err(|e| GrpoError::Generation(format!("token sampling failed: {}", e)))?;
    Ok(indices[dist.sample(rng)] as u32)
}
